//! Idle-hint providers.
//!
//! This module provides a small abstraction over the session-management
//! interface the daemon polls, so the monitor loop can be tested with a
//! fake provider instead of a live bus.

pub mod logind;

use std::time::Duration;

use async_trait::async_trait;
pub use logind::LogindProvider;
use thiserror::Error;

/// One sample of session idle state.
///
/// `idle_duration` is how long the session has been idle according to the
/// provider; it is zero whenever `is_idle` is false. The monitor derives all
/// of its decisions from this sample and keeps no idle heuristic of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSample {
    /// Whether the session manager currently reports the session as idle.
    pub is_idle: bool,

    /// How long the session has been idle.
    pub idle_duration: Duration,
}

impl PollSample {
    /// An active (not idle) sample.
    pub fn active() -> Self {
        Self {
            is_idle: false,
            idle_duration: Duration::ZERO,
        }
    }

    /// An idle sample with the given duration.
    pub fn idle(idle_duration: Duration) -> Self {
        Self {
            is_idle: true,
            idle_duration,
        }
    }
}

/// Trait for idle-hint providers.
///
/// Implementations should handle reconnection internally: a failed call may
/// drop cached connections so the next poll starts fresh.
#[async_trait]
pub trait IdleProvider: Send {
    /// Query the current idle state.
    async fn poll_once(&mut self) -> Result<PollSample, ProviderError>;

    /// Simulate user activity, resetting the session's perceived idle state.
    async fn simulate_activity(&mut self) -> Result<(), ProviderError>;
}

/// Errors that can occur while talking to the provider.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Bus connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Session path could not be resolved: {0}")]
    SessionNotFound(String),

    #[error("Idle hint query failed: {0}")]
    QueryFailed(String),

    #[error("Activity simulation failed: {0}")]
    SimulateFailed(String),

    #[error("Bus call timed out after {0:?}")]
    Timeout(Duration),
}
