//! Idle detection via systemd-logind `DBus` interface.
//!
//! Polls the `IdleHint` and `IdleSinceHint` properties of the current
//! session on the system bus. Activity simulation goes through
//! `org.freedesktop.ScreenSaver` on the session bus, which is where desktop
//! environments expose it.

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;
use tracing::trace;
use zbus::Connection;

use crate::provider::IdleProvider;
use crate::provider::PollSample;
use crate::provider::ProviderError;

/// `DBus` service and path for login1.
const LOGIND_SERVICE: &str = "org.freedesktop.login1";
const LOGIND_PATH: &str = "/org/freedesktop/login1";
const SESSION_INTERFACE: &str = "org.freedesktop.login1.Session";
const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

/// `DBus` service, path and interface for the screensaver.
const SCREENSAVER_SERVICE: &str = "org.freedesktop.ScreenSaver";
const SCREENSAVER_PATH: &str = "/org/freedesktop/ScreenSaver";
const SCREENSAVER_INTERFACE: &str = "org.freedesktop.ScreenSaver";

/// Idle provider backed by systemd-logind and the session screensaver.
///
/// Connections and the resolved session path are cached between polls and
/// dropped on error, so a bus restart heals on the next tick.
pub struct LogindProvider {
    /// Cached system bus connection (logind lives here).
    system: Option<Connection>,

    /// Cached session bus connection (screensaver lives here).
    session: Option<Connection>,

    /// Resolved session object path in `DBus`.
    session_path: Option<String>,
}

impl LogindProvider {
    /// Create a new provider. No connection is made until the first call.
    pub fn new() -> Self {
        Self {
            system: None,
            session: None,
            session_path: None,
        }
    }

    async fn system_conn(&mut self) -> Result<Connection, ProviderError> {
        if let Some(ref conn) = self.system {
            return Ok(conn.clone());
        }
        let conn = Connection::system()
            .await
            .map_err(|e| ProviderError::ConnectionFailed(format!("system bus: {e}")))?;
        self.system = Some(conn.clone());
        Ok(conn)
    }

    async fn session_conn(&mut self) -> Result<Connection, ProviderError> {
        if let Some(ref conn) = self.session {
            return Ok(conn.clone());
        }
        let conn = Connection::session()
            .await
            .map_err(|e| ProviderError::ConnectionFailed(format!("session bus: {e}")))?;
        self.session = Some(conn.clone());
        Ok(conn)
    }

    async fn resolved_session_path(&mut self, conn: &Connection) -> Result<String, ProviderError> {
        if let Some(ref path) = self.session_path {
            return Ok(path.clone());
        }
        let path = resolve_session_path(conn).await?;
        debug!("Resolved session path: {path}");
        self.session_path = Some(path.clone());
        Ok(path)
    }
}

impl Default for LogindProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdleProvider for LogindProvider {
    async fn poll_once(&mut self) -> Result<PollSample, ProviderError> {
        let result = async {
            let conn = self.system_conn().await?;
            let path = self.resolved_session_path(&conn).await?;

            let idle = get_idle_hint(&conn, &path).await?;
            if !idle {
                return Ok(PollSample::active());
            }

            let since_usec = get_idle_since_usec(&conn, &path).await?;
            let now_usec = u64::try_from(Utc::now().timestamp_micros()).unwrap_or(0);
            Ok(PollSample::idle(idle_duration_from(since_usec, now_usec)))
        }
        .await;

        if result.is_err() {
            // Drop caches so the next poll reconnects from scratch.
            self.system = None;
            self.session_path = None;
        } else {
            trace!("Poll sample: {result:?}");
        }

        result
    }

    async fn simulate_activity(&mut self) -> Result<(), ProviderError> {
        let result = async {
            let conn = self.session_conn().await?;

            let proxy = zbus::Proxy::new(
                &conn,
                SCREENSAVER_SERVICE,
                SCREENSAVER_PATH,
                SCREENSAVER_INTERFACE,
            )
            .await
            .map_err(|e| ProviderError::SimulateFailed(format!("proxy: {e}")))?;

            proxy
                .call::<_, _, ()>("SimulateUserActivity", &())
                .await
                .map_err(|e| ProviderError::SimulateFailed(e.to_string()))?;

            Ok(())
        }
        .await;

        if result.is_err() {
            self.session = None;
        }

        result
    }
}

/// Resolve the session object path for the current session.
async fn resolve_session_path(conn: &Connection) -> Result<String, ProviderError> {
    // First try XDG_SESSION_ID if available
    if let Ok(session_id) = env::var("XDG_SESSION_ID") {
        debug!("Using XDG_SESSION_ID: {session_id}");

        const MANAGER_INTERFACE: &str = "org.freedesktop.login1.Manager";

        let proxy = zbus::Proxy::new(conn, LOGIND_SERVICE, LOGIND_PATH, MANAGER_INTERFACE)
            .await
            .map_err(|e| ProviderError::SessionNotFound(format!("Manager proxy: {e}")))?;

        let path: zbus::zvariant::OwnedObjectPath = proxy
            .call("GetSession", &(&session_id,))
            .await
            .map_err(|e| ProviderError::SessionNotFound(format!("GetSession: {e}")))?;

        return Ok(path.to_string());
    }

    debug!("XDG_SESSION_ID not set, trying to find current session");

    // Probe "self" then "auto" by reading IdleHint
    let self_path = format!("{LOGIND_PATH}/session/self");
    if get_idle_hint(conn, &self_path).await.is_ok() {
        return Ok(self_path);
    }

    let auto_path = format!("{LOGIND_PATH}/session/auto");
    if get_idle_hint(conn, &auto_path).await.is_ok() {
        return Ok(auto_path);
    }

    Err(ProviderError::SessionNotFound(
        "set XDG_SESSION_ID or ensure a logind session is available".to_string(),
    ))
}

/// Get the `IdleHint` property from a session.
async fn get_idle_hint(conn: &Connection, session_path: &str) -> Result<bool, ProviderError> {
    let value = get_session_property(conn, session_path, "IdleHint").await?;

    value
        .downcast_ref::<bool>()
        .map_err(|_| ProviderError::QueryFailed("IdleHint is not a boolean".to_string()))
}

/// Get the `IdleSinceHint` property (realtime usec timestamp) from a session.
///
/// logind reports 0 when it has no idle-since timestamp.
async fn get_idle_since_usec(conn: &Connection, session_path: &str) -> Result<u64, ProviderError> {
    let value = get_session_property(conn, session_path, "IdleSinceHint").await?;

    value
        .downcast_ref::<u64>()
        .map_err(|_| ProviderError::QueryFailed("IdleSinceHint is not a u64".to_string()))
}

async fn get_session_property(
    conn: &Connection,
    session_path: &str,
    name: &str,
) -> Result<zbus::zvariant::OwnedValue, ProviderError> {
    let proxy = zbus::Proxy::new(conn, LOGIND_SERVICE, session_path, PROPERTIES_INTERFACE)
        .await
        .map_err(|e| ProviderError::QueryFailed(format!("Properties proxy: {e}")))?;

    proxy
        .call("Get", &(SESSION_INTERFACE, name))
        .await
        .map_err(|e| ProviderError::QueryFailed(format!("{name}: {e}")))
}

/// Compute the idle duration from an `IdleSinceHint` timestamp.
///
/// Both values are usec on the realtime clock. A zero or future timestamp
/// yields a zero duration; thresholds then fire on a later tick instead of
/// misfiring on clock skew.
fn idle_duration_from(since_usec: u64, now_usec: u64) -> Duration {
    if since_usec == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(now_usec.saturating_sub(since_usec))
}

/// Result of probing each bus interface the daemon depends on.
///
/// Used by `--check` to report connectivity before the daemon is enabled.
#[derive(Debug)]
pub struct BusDiagnostics {
    pub system_bus: Result<(), String>,
    pub session_path: Result<String, String>,
    pub idle_hint: Result<bool, String>,
    pub session_bus: Result<(), String>,
    pub screensaver: Result<(), String>,
}

impl BusDiagnostics {
    /// True if every probe succeeded.
    pub fn healthy(&self) -> bool {
        self.system_bus.is_ok()
            && self.session_path.is_ok()
            && self.idle_hint.is_ok()
            && self.session_bus.is_ok()
            && self.screensaver.is_ok()
    }
}

/// Probe the system and session buses and the interfaces the daemon uses.
pub async fn probe() -> BusDiagnostics {
    let mut diag = BusDiagnostics {
        system_bus: Err("not attempted".to_string()),
        session_path: Err("not attempted".to_string()),
        idle_hint: Err("not attempted".to_string()),
        session_bus: Err("not attempted".to_string()),
        screensaver: Err("not attempted".to_string()),
    };

    match Connection::system().await {
        Ok(conn) => {
            diag.system_bus = Ok(());

            match resolve_session_path(&conn).await {
                Ok(path) => {
                    diag.session_path = Ok(path.clone());
                    diag.idle_hint = get_idle_hint(&conn, &path)
                        .await
                        .map_err(|e| e.to_string());
                }
                Err(e) => diag.session_path = Err(e.to_string()),
            }
        }
        Err(e) => diag.system_bus = Err(e.to_string()),
    }

    match Connection::session().await {
        Ok(conn) => {
            diag.session_bus = Ok(());
            diag.screensaver = probe_screensaver(&conn).await.map_err(|e| e.to_string());
        }
        Err(e) => diag.session_bus = Err(e.to_string()),
    }

    diag
}

/// Check that the screensaver service answers, without poking it.
async fn probe_screensaver(conn: &Connection) -> Result<(), ProviderError> {
    const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";

    let proxy = zbus::Proxy::new(
        conn,
        SCREENSAVER_SERVICE,
        SCREENSAVER_PATH,
        INTROSPECTABLE_INTERFACE,
    )
    .await
    .map_err(|e| ProviderError::QueryFailed(format!("Introspectable proxy: {e}")))?;

    let _: String = proxy
        .call("Introspect", &())
        .await
        .map_err(|e| ProviderError::QueryFailed(format!("Introspect: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_duration_zero_hint() {
        assert_eq!(idle_duration_from(0, 1_000_000), Duration::ZERO);
    }

    #[test]
    fn test_idle_duration_normal() {
        // Idle since 65 seconds before "now".
        let now = 1_700_000_065_000_000;
        let since = 1_700_000_000_000_000;
        assert_eq!(idle_duration_from(since, now), Duration::from_secs(65));
    }

    #[test]
    fn test_idle_duration_future_hint_saturates() {
        let now = 1_700_000_000_000_000;
        let since = 1_700_000_060_000_000;
        assert_eq!(idle_duration_from(since, now), Duration::ZERO);
    }

    #[test]
    fn test_diagnostics_healthy() {
        let diag = BusDiagnostics {
            system_bus: Ok(()),
            session_path: Ok("/org/freedesktop/login1/session/self".to_string()),
            idle_hint: Ok(false),
            session_bus: Ok(()),
            screensaver: Ok(()),
        };
        assert!(diag.healthy());
    }

    #[test]
    fn test_diagnostics_unhealthy_on_any_failure() {
        let diag = BusDiagnostics {
            system_bus: Ok(()),
            session_path: Ok("/org/freedesktop/login1/session/self".to_string()),
            idle_hint: Ok(true),
            session_bus: Err("no session bus".to_string()),
            screensaver: Err("not attempted".to_string()),
        };
        assert!(!diag.healthy());
    }
}
