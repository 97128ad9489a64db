//! Single-instance PID lock.
//!
//! One call session per machine: the lock file holds the decimal PID of
//! the running session. A file whose PID is no longer alive is stale and
//! gets overwritten; a live PID is a hard error with the remediation
//! spelled out.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{debug, warn};

/// Returned when the lock is held by a live process.
#[derive(Debug)]
pub struct LockHeld {
    pub pid: u32,
}

impl fmt::Display for LockHeld {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Another call is already running (pid {}). Run `callwire hangup` to end it.",
            self.pid
        )
    }
}

impl std::error::Error for LockHeld {}

/// Held PID lock; released explicitly on every terminal path, with a
/// Drop backstop.
#[derive(Debug)]
pub struct SessionLock {
    path: PathBuf,
    held: bool,
}

impl SessionLock {
    /// Take the lock, overwriting a stale file.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Ok(contents) = std::fs::read_to_string(path) {
            if let Ok(pid) = contents.trim().parse::<u32>() {
                if pid_alive(pid) {
                    return Err(LockHeld { pid }.into());
                }
                warn!(stale_pid = pid, "Overwriting stale lock file");
            } else {
                warn!(path = %path.display(), "Lock file held garbage, overwriting");
            }
        }
        std::fs::write(path, std::process::id().to_string())?;
        debug!(path = %path.display(), pid = std::process::id(), "Lock acquired");
        Ok(Self {
            path: path.to_path_buf(),
            held: true,
        })
    }

    /// Remove the lock file. A missing file is a no-op.
    pub fn release(&mut self) {
        if self.held {
            let _ = std::fs::remove_file(&self.path);
            self.held = false;
        }
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// On Linux a live PID has a /proc entry.
fn pid_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("callwire-lock-{}-{}.pid", tag, std::process::id()))
    }

    #[test]
    fn acquire_writes_current_pid() {
        let path = lock_path("fresh");
        let _ = std::fs::remove_file(&path);

        let mut lock = SessionLock::acquire(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, std::process::id().to_string());
        lock.release();
        assert!(!path.exists());
    }

    #[test]
    fn stale_pid_is_overwritten() {
        let path = lock_path("stale");
        // No real process gets a PID this large.
        std::fs::write(&path, "999999999").unwrap();

        let mut lock = SessionLock::acquire(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, std::process::id().to_string());
        lock.release();
    }

    #[test]
    fn live_pid_refuses() {
        let path = lock_path("live");
        // PID 1 is always alive.
        std::fs::write(&path, "1").unwrap();

        let err = SessionLock::acquire(&path).unwrap_err();
        let held = err.downcast_ref::<LockHeld>().expect("LockHeld error");
        assert_eq!(held.pid, 1);
        assert!(err.to_string().contains("Another call is already running"));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn release_on_missing_file_is_noop() {
        let path = lock_path("noop");
        let _ = std::fs::remove_file(&path);

        let mut lock = SessionLock::acquire(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        lock.release();
        lock.release();
    }
}
