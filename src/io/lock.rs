//! Advisory file locks under `<root>/locks/`.
//!
//! `RunLock` is a `flock(LOCK_EX | LOCK_NB)` on `<date>.lock`: at most one
//! pipeline run per target date, and runs for different dates never contend.
//! `StoreLock` is a blocking `flock(LOCK_EX)` on `store.lock`, held while the
//! shared index and latest pointers are read, modified and written back.
//! Both are released when the guard (and its file descriptor) is dropped,
//! which also covers crashed processes.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;

use chrono::NaiveDate;

use crate::error::StorageError;

const STORE_LOCK_FILE: &str = "store.lock";

#[derive(Debug)]
pub struct RunLock {
    _file: File,
}

impl RunLock {
    /// Take the lock for `date` or fail with `StorageError::Locked`.
    pub fn acquire(lock_dir: &Path, date: NaiveDate) -> Result<Self, StorageError> {
        let path = lock_dir.join(format!("{}.lock", date.format("%Y-%m-%d")));
        let file = open_lock_file(lock_dir, &path)?;

        match try_flock_exclusive(&file) {
            Ok(true) => {
                tracing::debug!(path = %path.display(), %date, "run lock acquired");
                Ok(Self { _file: file })
            }
            Ok(false) => Err(StorageError::Locked { date }),
            Err(e) => Err(StorageError::WriteFailure {
                path,
                message: format!("locking: {e}"),
            }),
        }
    }
}

/// Store-wide writer lock. Blocks until every other holder has released it.
#[derive(Debug)]
pub struct StoreLock {
    _file: File,
}

impl StoreLock {
    pub fn acquire(lock_dir: &Path) -> Result<Self, StorageError> {
        let path = lock_dir.join(STORE_LOCK_FILE);
        let file = open_lock_file(lock_dir, &path)?;
        flock_exclusive(&file).map_err(|e| StorageError::WriteFailure {
            path,
            message: format!("locking: {e}"),
        })?;
        Ok(Self { _file: file })
    }
}

fn open_lock_file(lock_dir: &Path, path: &Path) -> Result<File, StorageError> {
    fs::create_dir_all(lock_dir).map_err(|e| StorageError::WriteFailure {
        path: lock_dir.to_path_buf(),
        message: format!("creating lock directory: {e}"),
    })?;
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map_err(|e| StorageError::WriteFailure {
            path: path.to_path_buf(),
            message: format!("opening lock file: {e}"),
        })
}

/// Try to acquire an exclusive flock on a file (non-blocking).
///
/// Returns `Ok(false)` if another descriptor already holds the lock.
fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: `fd` is a valid descriptor owned by `file` for the whole call.
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            return Ok(false);
        }
        Err(err)
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(true)
    }
}

/// Acquire an exclusive flock, waiting for the current holder.
fn flock_exclusive(file: &File) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        loop {
            // SAFETY: `fd` is a valid descriptor owned by `file` for the whole call.
            let result = unsafe { libc::flock(fd, libc::LOCK_EX) };
            if result == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn second_lock_for_same_date_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 2, 1).unwrap();

        let first = RunLock::acquire(dir.path(), date).unwrap();
        let second = RunLock::acquire(dir.path(), date);
        assert_eq!(second.unwrap_err(), StorageError::Locked { date });

        // A different date does not contend.
        let other = RunLock::acquire(dir.path(), date.succ_opt().unwrap());
        assert!(other.is_ok());

        drop(first);
        assert!(RunLock::acquire(dir.path(), date).is_ok());
    }

    #[test]
    fn store_lock_waits_for_holder() {
        let dir = tempfile::tempdir().unwrap();
        let held = StoreLock::acquire(dir.path()).unwrap();

        let acquired = Arc::new(AtomicBool::new(false));
        let waiter = {
            let path = dir.path().to_path_buf();
            let acquired = Arc::clone(&acquired);
            std::thread::spawn(move || {
                let _lock = StoreLock::acquire(&path).unwrap();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(100));
        assert!(!acquired.load(Ordering::SeqCst));

        drop(held);
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }
}
