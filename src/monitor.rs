//! Idle monitoring loop.
//!
//! `IdleTracker` is the pure per-tick state machine deciding what a sample
//! means; `Monitor` drives it against a provider on a fixed interval and
//! turns its decisions into journal records and simulation calls.

use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::Config;
use crate::journal::Journal;
use crate::journal::Severity;
use crate::provider::IdleProvider;
use crate::provider::PollSample;
use crate::provider::ProviderError;

/// Cap for the failure backoff between polls.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Log the first few poll failures in a row, then only every Nth.
const FAILURE_LOG_BURST: u32 = 5;
const FAILURE_LOG_EVERY: u32 = 10;

/// Session state derived from provider samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The provider reports recent user input.
    Active,

    /// The idle threshold was crossed in the current episode.
    Idle,

    /// Activity was simulated for the current episode.
    IdleSimulated,
}

/// Reaction demanded by one poll sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    /// The session just crossed the idle threshold.
    RecordIdle { idle_for: Duration },

    /// Activity simulation should fire for this episode.
    Simulate { idle_for: Duration },
}

/// Per-tick idle state machine.
///
/// Transitions are driven entirely by the provider's samples; the tracker
/// keeps no clock of its own. `IdleSimulated` doubles as the
/// once-per-episode flag: it only resets when the idle hint goes false.
#[derive(Debug)]
pub struct IdleTracker {
    idle_threshold: Duration,
    simulate_threshold: Duration,
    simulate_enabled: bool,
    state: SessionState,
}

impl IdleTracker {
    /// Create a tracker with explicit thresholds.
    pub fn new(idle_threshold: Duration, simulate_threshold: Duration, simulate_enabled: bool) -> Self {
        Self {
            idle_threshold,
            simulate_threshold,
            simulate_enabled,
            state: SessionState::Active,
        }
    }

    /// Create a tracker from configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.idle_threshold(),
            config.simulate_threshold(),
            config.simulate_activity,
        )
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Feed one sample through the state machine.
    ///
    /// Both actions can fire on the same tick when a single sample crosses
    /// both thresholds.
    pub fn observe(&mut self, sample: &PollSample) -> Vec<TickAction> {
        let mut actions = Vec::new();

        if !sample.is_idle {
            if self.state != SessionState::Active {
                debug!("Session active again");
            }
            self.state = SessionState::Active;
            return actions;
        }

        if self.state == SessionState::Active && sample.idle_duration >= self.idle_threshold {
            self.state = SessionState::Idle;
            actions.push(TickAction::RecordIdle {
                idle_for: sample.idle_duration,
            });
        }

        if self.state == SessionState::Idle
            && self.simulate_enabled
            && sample.idle_duration >= self.simulate_threshold
        {
            self.state = SessionState::IdleSimulated;
            actions.push(TickAction::Simulate {
                idle_for: sample.idle_duration,
            });
        }

        actions
    }
}

/// Monitor loop driving a provider on a fixed interval.
pub struct Monitor<P: IdleProvider> {
    provider: P,
    tracker: IdleTracker,
    journal: Journal,
    poll_interval: Duration,
    call_timeout: Duration,
    dry_run: bool,
    consecutive_failures: u32,
}

impl<P: IdleProvider> Monitor<P> {
    /// Create a monitor from configuration.
    pub fn new(provider: P, journal: Journal, config: &Config, dry_run: bool) -> Self {
        Self {
            provider,
            tracker: IdleTracker::from_config(config),
            journal,
            poll_interval: config.poll_interval(),
            call_timeout: config.call_timeout(),
            dry_run,
            consecutive_failures: 0,
        }
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.tracker.state()
    }

    /// Run one poll cycle.
    ///
    /// A poll failure is logged and counted; it never propagates, so the
    /// loop always reaches the next tick.
    pub async fn tick(&mut self) {
        let sample = match timeout(self.call_timeout, self.provider.poll_once()).await {
            Ok(Ok(sample)) => sample,
            Ok(Err(e)) => {
                self.on_poll_failure(&e);
                return;
            }
            Err(_) => {
                self.on_poll_failure(&ProviderError::Timeout(self.call_timeout));
                return;
            }
        };

        if self.consecutive_failures > 0 {
            info!(
                "Provider recovered after {} failed polls",
                self.consecutive_failures
            );
            self.consecutive_failures = 0;
        }

        for action in self.tracker.observe(&sample) {
            self.apply(action).await;
        }
    }

    /// Run until the shutdown token is cancelled.
    ///
    /// Polls immediately on startup, then sleeps between ticks; the sleep
    /// stretches under failure backoff. Flushes the journal before
    /// returning.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        info!(
            "Idle monitor started, polling every {:?} (simulate: {})",
            self.poll_interval, self.tracker.simulate_enabled
        );

        loop {
            self.tick().await;

            let delay = self.next_delay();
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        if let Err(e) = self.journal.flush() {
            warn!("Failed to flush activity journal: {e}");
        }
        info!("Idle monitor stopped");
    }

    /// Delay before the next poll, stretched while the provider is failing.
    fn next_delay(&self) -> Duration {
        backoff_delay(self.poll_interval, self.consecutive_failures, MAX_BACKOFF)
    }

    async fn apply(&mut self, action: TickAction) {
        match action {
            TickAction::RecordIdle { idle_for } => {
                info!("Session idle detected (idle for {}s)", idle_for.as_secs());
                self.journal_record(
                    Severity::Warning,
                    &format!("Session idle detected (idle for {}s)", idle_for.as_secs()),
                );
            }
            TickAction::Simulate { idle_for } => {
                if self.dry_run {
                    info!(
                        "[DRY RUN] Would simulate user activity (idle for {}s)",
                        idle_for.as_secs()
                    );
                    return;
                }

                match timeout(self.call_timeout, self.provider.simulate_activity()).await {
                    Ok(Ok(())) => {
                        info!("Simulated user activity (idle for {}s)", idle_for.as_secs());
                        self.journal_record(
                            Severity::Info,
                            &format!("Simulated user activity (idle for {}s)", idle_for.as_secs()),
                        );
                    }
                    Ok(Err(e)) => {
                        warn!("Activity simulation failed: {e}");
                        self.journal_record(
                            Severity::Error,
                            &format!("Activity simulation failed: {e}"),
                        );
                    }
                    Err(_) => {
                        let e = ProviderError::Timeout(self.call_timeout);
                        warn!("Activity simulation failed: {e}");
                        self.journal_record(
                            Severity::Error,
                            &format!("Activity simulation failed: {e}"),
                        );
                    }
                }
            }
        }
    }

    fn on_poll_failure(&mut self, err: &ProviderError) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let count = self.consecutive_failures;

        if count <= FAILURE_LOG_BURST || count % FAILURE_LOG_EVERY == 0 {
            warn!("Failed to poll idle state ({count} in a row): {err}");
            self.journal_record(Severity::Error, &format!("Monitor error: {err}"));

            if count == FAILURE_LOG_BURST {
                warn!("Rate-limiting poll failure logs (showing every {FAILURE_LOG_EVERY}th)");
            }
        }
    }

    fn journal_record(&mut self, severity: Severity, message: &str) {
        // A full disk must not stop the monitor.
        if let Err(e) = self.journal.record(severity, message) {
            warn!("Failed to append to activity journal: {e}");
        }
    }
}

/// Exponential backoff: `base * 2^consecutive_failures`, capped at `max`.
fn backoff_delay(base: Duration, consecutive_failures: u32, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(consecutive_failures).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    fn tracker(idle_secs: u64, simulate_secs: u64, enabled: bool) -> IdleTracker {
        IdleTracker::new(
            Duration::from_secs(idle_secs),
            Duration::from_secs(simulate_secs),
            enabled,
        )
    }

    #[test]
    fn test_tracker_starts_active() {
        let t = tracker(60, 120, true);
        assert_eq!(t.state(), SessionState::Active);
    }

    #[test]
    fn test_idle_below_threshold_no_action() {
        let mut t = tracker(60, 120, true);
        let actions = t.observe(&PollSample::idle(Duration::from_secs(30)));
        assert!(actions.is_empty());
        assert_eq!(t.state(), SessionState::Active);
    }

    #[test]
    fn test_idle_transition_fires_once() {
        let mut t = tracker(60, 120, false);

        let actions = t.observe(&PollSample::idle(Duration::from_secs(65)));
        assert_eq!(
            actions,
            vec![TickAction::RecordIdle {
                idle_for: Duration::from_secs(65)
            }]
        );
        assert_eq!(t.state(), SessionState::Idle);

        // Still idle on later ticks: no repeat record.
        assert!(t.observe(&PollSample::idle(Duration::from_secs(95))).is_empty());
        assert!(t.observe(&PollSample::idle(Duration::from_secs(125))).is_empty());
    }

    #[test]
    fn test_simulate_disabled_never_fires() {
        let mut t = tracker(60, 120, false);

        t.observe(&PollSample::idle(Duration::from_secs(65)));
        let actions = t.observe(&PollSample::idle(Duration::from_secs(100_000)));
        assert!(actions.is_empty());
        assert_eq!(t.state(), SessionState::Idle);
    }

    #[test]
    fn test_idle_then_simulate_sequence() {
        // idle_minutes=1, simulate_after_minutes=2, simulate_activity=true;
        // samples at 30s, 65s, 130s of idle.
        let mut t = tracker(60, 120, true);

        assert!(t.observe(&PollSample::idle(Duration::from_secs(30))).is_empty());

        let second = t.observe(&PollSample::idle(Duration::from_secs(65)));
        assert_eq!(
            second,
            vec![TickAction::RecordIdle {
                idle_for: Duration::from_secs(65)
            }]
        );

        let third = t.observe(&PollSample::idle(Duration::from_secs(130)));
        assert_eq!(
            third,
            vec![TickAction::Simulate {
                idle_for: Duration::from_secs(130)
            }]
        );
        assert_eq!(t.state(), SessionState::IdleSimulated);

        // Simulation fires once per episode.
        assert!(t.observe(&PollSample::idle(Duration::from_secs(200))).is_empty());
    }

    #[test]
    fn test_episode_reset_refires() {
        let mut t = tracker(60, 120, true);

        t.observe(&PollSample::idle(Duration::from_secs(65)));
        t.observe(&PollSample::idle(Duration::from_secs(130)));
        assert_eq!(t.state(), SessionState::IdleSimulated);

        // Back to active ends the episode.
        assert!(t.observe(&PollSample::active()).is_empty());
        assert_eq!(t.state(), SessionState::Active);

        // A fresh episode fires both again.
        let actions = t.observe(&PollSample::idle(Duration::from_secs(150)));
        assert_eq!(
            actions,
            vec![
                TickAction::RecordIdle {
                    idle_for: Duration::from_secs(150)
                },
                TickAction::Simulate {
                    idle_for: Duration::from_secs(150)
                },
            ]
        );
    }

    #[test]
    fn test_single_tick_crosses_both_thresholds() {
        let mut t = tracker(60, 120, true);

        let actions = t.observe(&PollSample::idle(Duration::from_secs(600)));
        assert_eq!(actions.len(), 2);
        assert_eq!(t.state(), SessionState::IdleSimulated);
    }

    #[test]
    fn test_backoff_delay() {
        let base = Duration::from_secs(30);
        let max = Duration::from_secs(300);

        assert_eq!(backoff_delay(base, 0, max), Duration::from_secs(30));
        assert_eq!(backoff_delay(base, 1, max), Duration::from_secs(60));
        assert_eq!(backoff_delay(base, 2, max), Duration::from_secs(120));
        assert_eq!(backoff_delay(base, 4, max), max);
        assert_eq!(backoff_delay(base, 63, max), max);
    }

    /// Provider that replays a scripted sequence of poll results.
    struct ScriptedProvider {
        samples: VecDeque<Result<PollSample, ProviderError>>,
        simulate_calls: u32,
        fail_simulate: bool,
    }

    impl ScriptedProvider {
        fn new(samples: Vec<Result<PollSample, ProviderError>>) -> Self {
            Self {
                samples: samples.into(),
                simulate_calls: 0,
                fail_simulate: false,
            }
        }
    }

    #[async_trait]
    impl IdleProvider for ScriptedProvider {
        async fn poll_once(&mut self) -> Result<PollSample, ProviderError> {
            self.samples
                .pop_front()
                .unwrap_or(Ok(PollSample::active()))
        }

        async fn simulate_activity(&mut self) -> Result<(), ProviderError> {
            self.simulate_calls += 1;
            if self.fail_simulate {
                Err(ProviderError::SimulateFailed("screensaver gone".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn test_config() -> Config {
        Config {
            idle_minutes: 1,
            simulate_after_minutes: 2,
            simulate_activity: true,
            poll_interval_seconds: 30,
            call_timeout_seconds: 5,
            log_path: None,
        }
    }

    fn idle(secs: u64) -> Result<PollSample, ProviderError> {
        Ok(PollSample::idle(Duration::from_secs(secs)))
    }

    #[tokio::test]
    async fn test_monitor_journals_idle_then_simulate() {
        let dir = tempfile::tempdir().unwrap();
        let journal_path = dir.path().join("activity.log");
        let journal = Journal::open(&journal_path).unwrap();

        let provider = ScriptedProvider::new(vec![idle(30), idle(65), idle(130)]);
        let mut monitor = Monitor::new(provider, journal, &test_config(), false);

        for _ in 0..3 {
            monitor.tick().await;
        }

        assert_eq!(monitor.provider.simulate_calls, 1);
        assert_eq!(monitor.state(), SessionState::IdleSimulated);

        let content = std::fs::read_to_string(&journal_path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("WARNING Session idle detected (idle for 65s)"));
        assert!(lines[1].contains("INFO Simulated user activity (idle for 130s)"));
    }

    #[tokio::test]
    async fn test_monitor_survives_poll_failure() {
        let dir = tempfile::tempdir().unwrap();
        let journal_path = dir.path().join("activity.log");
        let journal = Journal::open(&journal_path).unwrap();

        let provider = ScriptedProvider::new(vec![
            Err(ProviderError::ConnectionFailed("bus down".to_string())),
            idle(65),
        ]);
        let mut monitor = Monitor::new(provider, journal, &test_config(), false);

        monitor.tick().await;
        assert_eq!(monitor.consecutive_failures, 1);
        assert_eq!(monitor.next_delay(), Duration::from_secs(60));

        // Next tick succeeds and the failure counter resets.
        monitor.tick().await;
        assert_eq!(monitor.consecutive_failures, 0);
        assert_eq!(monitor.next_delay(), Duration::from_secs(30));
        assert_eq!(monitor.state(), SessionState::Idle);

        let content = std::fs::read_to_string(&journal_path).unwrap();
        assert!(content.contains("ERROR Monitor error"));
        assert!(content.contains("WARNING Session idle detected"));
    }

    #[tokio::test]
    async fn test_monitor_dry_run_never_simulates() {
        let dir = tempfile::tempdir().unwrap();
        let journal_path = dir.path().join("activity.log");
        let journal = Journal::open(&journal_path).unwrap();

        let provider = ScriptedProvider::new(vec![idle(600)]);
        let mut monitor = Monitor::new(provider, journal, &test_config(), true);

        monitor.tick().await;

        assert_eq!(monitor.provider.simulate_calls, 0);
        // The episode still counts as handled.
        assert_eq!(monitor.state(), SessionState::IdleSimulated);

        let content = std::fs::read_to_string(&journal_path).unwrap();
        assert!(!content.contains("Simulated user activity"));
    }

    #[tokio::test]
    async fn test_monitor_journals_simulation_failure() {
        let dir = tempfile::tempdir().unwrap();
        let journal_path = dir.path().join("activity.log");
        let journal = Journal::open(&journal_path).unwrap();

        let mut provider = ScriptedProvider::new(vec![idle(600)]);
        provider.fail_simulate = true;
        let mut monitor = Monitor::new(provider, journal, &test_config(), false);

        monitor.tick().await;

        assert_eq!(monitor.provider.simulate_calls, 1);
        let content = std::fs::read_to_string(&journal_path).unwrap();
        assert!(content.contains("ERROR Activity simulation failed"));
    }

    #[tokio::test]
    async fn test_failure_logging_rate_limited() {
        let dir = tempfile::tempdir().unwrap();
        let journal_path = dir.path().join("activity.log");
        let journal = Journal::open(&journal_path).unwrap();

        let failures: Vec<Result<PollSample, ProviderError>> = (0..20)
            .map(|_| Err(ProviderError::ConnectionFailed("bus down".to_string())))
            .collect();
        let provider = ScriptedProvider::new(failures);
        let mut monitor = Monitor::new(provider, journal, &test_config(), false);

        for _ in 0..20 {
            monitor.tick().await;
        }
        assert_eq!(monitor.consecutive_failures, 20);

        // First 5 failures journaled, then only the 10th and 20th.
        let content = std::fs::read_to_string(&journal_path).unwrap();
        assert_eq!(content.lines().count(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::open(&dir.path().join("activity.log")).unwrap();

        let provider = ScriptedProvider::new(vec![idle(65)]);
        let mut monitor = Monitor::new(provider, journal, &test_config(), false);

        let shutdown = CancellationToken::new();
        shutdown.cancel();

        // Returns after the first tick instead of sleeping forever.
        monitor.run(shutdown).await;
        assert_eq!(monitor.state(), SessionState::Idle);
    }
}
