//! Single-instance lock backed by an exclusive OS file lock.
//!
//! The OS drops the lock when the holding process exits, so a crashed
//! primary never leaves a stale lock behind.

use std::fs::{File, OpenOptions, TryLockError};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{CaptureError, Result};

/// Exclusive, process-wide instance lock.
#[derive(Debug)]
pub struct SingleInstanceLock {
    file: File,
    path: PathBuf,
}

impl SingleInstanceLock {
    /// Try to take the lock at `path`.
    ///
    /// Returns `Ok(None)` when another process (or handle) already holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            create_private_dir(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                tracing::debug!(path = %path.display(), "Instance lock held elsewhere");
                return Ok(None);
            }
            Err(TryLockError::Error(e)) => {
                return Err(CaptureError::Ipc(format!(
                    "failed to lock {}: {}",
                    path.display(),
                    e
                )));
            }
        }

        // PID is informational only; the lock itself is the source of truth.
        file.set_len(0)?;
        write!(file, "{}", std::process::id())?;

        tracing::info!(pid = std::process::id(), path = %path.display(), "Instance lock acquired");
        Ok(Some(Self {
            file,
            path: path.to_path_buf(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SingleInstanceLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            tracing::warn!(error = %e, path = %self.path.display(), "Failed to release instance lock");
        } else {
            tracing::debug!(path = %self.path.display(), "Instance lock released");
        }
    }
}

/// Create `dir` and any missing parents, owner-only on Unix.
///
/// Directories that already exist keep their mode.
pub(crate) fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.lock");

        let first = SingleInstanceLock::try_acquire(&path).unwrap();
        assert!(first.is_some());

        let second = SingleInstanceLock::try_acquire(&path).unwrap();
        assert!(second.is_none());

        drop(first);

        let third = SingleInstanceLock::try_acquire(&path).unwrap();
        assert!(third.is_some());
    }

    // Windows locks block reads from other handles.
    #[cfg(unix)]
    #[test]
    fn test_lock_file_records_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("app.lock");

        let lock = SingleInstanceLock::try_acquire(&path).unwrap().unwrap();
        assert_eq!(lock.path(), path);
        let pid = std::fs::read_to_string(&path).unwrap();
        assert_eq!(pid, std::process::id().to_string());
    }

    #[cfg(unix)]
    #[test]
    fn test_missing_runtime_dir_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let run_dir = dir.path().join("run").join("latchkey");
        let _lock = SingleInstanceLock::try_acquire(&run_dir.join("app.lock"))
            .unwrap()
            .unwrap();

        for created in [run_dir.as_path(), run_dir.parent().unwrap()] {
            let mode = std::fs::metadata(created).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700, "{}", created.display());
        }
    }
}
