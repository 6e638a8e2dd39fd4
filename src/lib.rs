//! idlewatchd - Systemd user daemon that watches session idle state.
//!
//! Polls the logind `IdleHint` for the current session on a fixed interval,
//! records idle episodes in an append-only activity journal, and can
//! optionally simulate user activity over the session bus to keep the
//! session awake.

pub mod config;
pub mod journal;
pub mod lock;
pub mod monitor;
pub mod provider;

pub use config::Config;
pub use journal::Journal;
pub use lock::InstanceLock;
pub use monitor::{IdleTracker, Monitor, SessionState};
pub use provider::{IdleProvider, PollSample, ProviderError};
