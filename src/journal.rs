//! Append-only activity journal.
//!
//! One timestamped line per significant event (idle detected, activity
//! simulated, error). The journal is the daemon's user-facing record and is
//! separate from the tracing output the supervisor captures; rotation is
//! left to the operator.

use std::fmt;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use chrono::Local;
use thiserror::Error;

/// Errors that can occur while opening the journal.
#[derive(Error, Debug)]
pub enum JournalError {
    #[error("Failed to create journal directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to open journal {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Severity tag written into each journal line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Append-only journal backed by a single log file.
pub struct Journal {
    file: File,
    path: PathBuf,
}

impl Journal {
    /// Open the journal for appending, creating parent directories as needed.
    pub fn open(path: &Path) -> Result<Self, JournalError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| JournalError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| JournalError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Default journal path: `$XDG_STATE_HOME/idlewatchd/activity.log`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::state_dir().map(|d| d.join("idlewatchd").join("activity.log"))
    }

    /// Append one timestamped record and flush it.
    ///
    /// Errors are returned to the caller so the loop can warn and continue;
    /// a full disk must not stop the monitor.
    pub fn record(&mut self, severity: Severity, message: &str) -> std::io::Result<()> {
        let line = format!(
            "{} {severity} {message}\n",
            Local::now().format("%Y-%m-%dT%H:%M:%S%:z")
        );
        self.file.write_all(line.as_bytes())?;
        self.file.flush()
    }

    /// Flush buffered writes. Called on shutdown.
    pub fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }

    /// Path of the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
