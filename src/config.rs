//! Configuration loading and defaults for idlewatchd.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

/// Errors that can occur while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Main configuration for idlewatchd.
///
/// All fields are optional in the JSON file; missing fields take the
/// built-in defaults and unknown fields are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Minutes of continuous idle before the session counts as idle (default: 10).
    pub idle_minutes: u64,

    /// Minutes of continuous idle before activity simulation fires (default: 5).
    pub simulate_after_minutes: u64,

    /// Whether to simulate user activity at all (default: false).
    pub simulate_activity: bool,

    /// Interval between idle polls in seconds (default: 30).
    pub poll_interval_seconds: u64,

    /// Timeout for a single bus call in seconds (default: 5).
    pub call_timeout_seconds: u64,

    /// Path to the activity journal.
    /// If unset, defaults to `$XDG_STATE_HOME/idlewatchd/activity.log`.
    pub log_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            idle_minutes: 10,
            simulate_after_minutes: 5,
            simulate_activity: false,
            poll_interval_seconds: 30,
            call_timeout_seconds: 5,
            log_path: None,
        }
    }
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config =
            serde_json::from_str(&content).map_err(|source| ConfigError::Malformed {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(config.sanitized())
    }

    /// Load configuration from the given path or the default location,
    /// falling back to built-in defaults on any failure.
    ///
    /// The daemon is meant to keep running under a supervisor, so a missing
    /// or malformed config file is downgraded to a warning rather than a
    /// startup failure.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let candidate = path.map(Path::to_path_buf).or_else(Self::default_path);

        match candidate {
            Some(p) if p.exists() => match Self::load(&p) {
                Ok(config) => config,
                Err(e) => {
                    warn!("{e}; using built-in defaults");
                    Self::default()
                }
            },
            _ => Self::default(),
        }
    }

    /// Default config file path: `$XDG_CONFIG_HOME/idlewatchd/config.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("idlewatchd").join("config.json"))
    }

    /// Replace zero values with defaults.
    ///
    /// All scalar fields must be positive; a zero would make the loop spin
    /// or a threshold fire on every tick.
    fn sanitized(mut self) -> Self {
        let defaults = Self::default();

        if self.idle_minutes == 0 {
            warn!(
                "idle_minutes must be positive, using {}",
                defaults.idle_minutes
            );
            self.idle_minutes = defaults.idle_minutes;
        }
        if self.simulate_after_minutes == 0 {
            warn!(
                "simulate_after_minutes must be positive, using {}",
                defaults.simulate_after_minutes
            );
            self.simulate_after_minutes = defaults.simulate_after_minutes;
        }
        if self.poll_interval_seconds == 0 {
            warn!(
                "poll_interval_seconds must be positive, using {}",
                defaults.poll_interval_seconds
            );
            self.poll_interval_seconds = defaults.poll_interval_seconds;
        }
        if self.call_timeout_seconds == 0 {
            warn!(
                "call_timeout_seconds must be positive, using {}",
                defaults.call_timeout_seconds
            );
            self.call_timeout_seconds = defaults.call_timeout_seconds;
        }

        self
    }

    /// Idle duration after which the session counts as idle.
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_minutes * 60)
    }

    /// Idle duration after which activity simulation fires.
    pub fn simulate_threshold(&self) -> Duration {
        Duration::from_secs(self.simulate_after_minutes * 60)
    }

    /// Interval between polls.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    /// Timeout for a single bus call.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_seconds)
    }
}
