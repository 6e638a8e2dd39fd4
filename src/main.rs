//! idlewatchd - Systemd user daemon that watches session idle state.
//!
//! Polls the logind idle hint for the current session, records idle episodes
//! in an activity journal, and optionally simulates user activity to keep
//! the session awake.

use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use tokio::signal::unix::SignalKind;
use tokio::signal::unix::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use idlewatchd::Config;
use idlewatchd::InstanceLock;
use idlewatchd::Journal;
use idlewatchd::Monitor;
use idlewatchd::provider::IdleProvider;
use idlewatchd::provider::LogindProvider;
use idlewatchd::provider::logind;

/// Session idle watcher daemon.
///
/// Watches the logind idle hint and optionally simulates user activity to
/// keep the session awake. Meant to run as a systemd user service.
#[derive(Parser, Debug)]
#[command(name = "idlewatchd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Never invoke the activity simulation call; log what would happen.
    #[arg(long)]
    dry_run: bool,

    /// Poll the idle state once, print the sample, then exit.
    #[arg(long)]
    oneshot: bool,

    /// Probe the bus interfaces the daemon depends on, then exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level)?;

    info!("idlewatchd v{} starting", env!("CARGO_PKG_VERSION"));

    if args.check {
        return run_check().await;
    }

    let config = Config::load_or_default(args.config.as_deref());
    info!(
        "Configuration loaded (idle after {}m, simulate after {}m, simulate: {})",
        config.idle_minutes, config.simulate_after_minutes, config.simulate_activity
    );

    if args.oneshot {
        return run_oneshot(&config).await;
    }

    run_daemon(config, args.dry_run).await
}

/// Initialize logging with the specified level.
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(format!("idlewatchd={level}"))
        .or_else(|_| EnvFilter::try_new("info"))
        .context("Invalid log level")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    Ok(())
}

/// Poll once and print the sample.
async fn run_oneshot(config: &Config) -> Result<()> {
    let mut provider = LogindProvider::new();

    let sample = tokio::time::timeout(config.call_timeout(), provider.poll_once())
        .await
        .context("Timed out polling idle state")?
        .context("Failed to poll idle state")?;

    println!(
        "idle={} idle_duration={}s",
        sample.is_idle,
        sample.idle_duration.as_secs()
    );

    Ok(())
}

/// Probe the bus interfaces and print a diagnostic summary.
async fn run_check() -> Result<()> {
    let diag = logind::probe().await;

    print_check("System bus", diag.system_bus.as_ref().map(|_| String::new()));
    print_check("Session path", diag.session_path.as_ref().map(String::clone));
    print_check(
        "IdleHint",
        diag.idle_hint.as_ref().map(|idle| format!("idle={idle}")),
    );
    print_check("Session bus", diag.session_bus.as_ref().map(|_| String::new()));
    print_check("ScreenSaver", diag.screensaver.as_ref().map(|_| String::new()));

    if diag.healthy() {
        Ok(())
    } else {
        anyhow::bail!("One or more bus checks failed")
    }
}

fn print_check(label: &str, result: Result<String, &String>) {
    match result {
        Ok(detail) if detail.is_empty() => println!("{label}: OK"),
        Ok(detail) => println!("{label}: OK ({detail})"),
        Err(e) => println!("{label}: FAIL ({e})"),
    }
}

/// Run the daemon loop until a termination signal arrives.
async fn run_daemon(config: Config, dry_run: bool) -> Result<()> {
    let lock_path =
        InstanceLock::default_path().context("Could not determine the state directory")?;
    let _lock = InstanceLock::acquire(&lock_path)?;

    let journal_path = config
        .log_path
        .clone()
        .or_else(Journal::default_path)
        .context("Could not determine the activity journal path")?;
    let journal = Journal::open(&journal_path)?;
    info!("Activity journal: {}", journal_path.display());

    let provider = LogindProvider::new();
    let mut monitor = Monitor::new(provider, journal, &config, dry_run);

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone())?;

    monitor.run(shutdown).await;

    Ok(())
}

/// Cancel the shutdown token on SIGINT or SIGTERM.
fn spawn_signal_listener(shutdown: CancellationToken) -> Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        }
        shutdown.cancel();
    });

    Ok(())
}
