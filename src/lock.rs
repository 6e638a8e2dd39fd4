//! Single-instance advisory lock.
//!
//! The service manager is expected to keep at most one daemon per user, but
//! nothing stops a second manual launch. An exclusive `flock` on a pid file
//! makes the second instance fail fast instead of double-polling and
//! double-writing the journal.

use std::fs::File;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use fs2::FileExt;
use thiserror::Error;
use tracing::debug;

/// Errors that can occur while acquiring the instance lock.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Another instance is already running (lock held on {path})")]
    AlreadyRunning { path: PathBuf },

    #[error("Failed to create lock file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Exclusive advisory lock held for the lifetime of the daemon.
///
/// The lock releases automatically when the process exits, even on a crash;
/// the pid file content is informational for operators.
#[derive(Debug)]
pub struct InstanceLock {
    // Held only for the flock; never read back.
    _file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Acquire the lock, creating parent directories as needed.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let io_err = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(io_err)?;

        if file.try_lock_exclusive().is_err() {
            return Err(LockError::AlreadyRunning {
                path: path.to_path_buf(),
            });
        }

        file.set_len(0).map_err(io_err)?;
        writeln!(file, "{}", std::process::id()).map_err(io_err)?;

        debug!("Acquired instance lock: {}", path.display());

        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    /// Default lock path: `$XDG_STATE_HOME/idlewatchd/idlewatchd.pid`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::state_dir().map(|d| d.join("idlewatchd").join("idlewatchd.pid"))
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_writes_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idlewatchd.pid");

        let lock = InstanceLock::acquire(&path).unwrap();
        assert_eq!(lock.path(), path);

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_second_acquire_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idlewatchd.pid");

        let _lock = InstanceLock::acquire(&path).unwrap();
        let err = InstanceLock::acquire(&path).unwrap_err();
        assert!(matches!(err, LockError::AlreadyRunning { .. }));
    }

    #[test]
    fn test_reacquire_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idlewatchd.pid");

        {
            let _lock = InstanceLock::acquire(&path).unwrap();
        }
        // Dropping the lock releases the flock.
        let _lock = InstanceLock::acquire(&path).unwrap();
    }

    #[test]
    fn test_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("idlewatchd").join("idlewatchd.pid");

        let _lock = InstanceLock::acquire(&path).unwrap();
        assert!(path.exists());
    }
}
