//! Process Singleton Guard (§4.A): at most one broker instance per host user.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockRecord {
    pid: u32,
    instance_id: String,
    timestamp: i64,
}

/// Holds the broker's own lockfile for its lifetime. Dropping (or calling
/// [`SingletonGuard::release`] explicitly) removes the lockfile iff it still
/// carries this instance's id, so a successor that has already taken over
/// is never clobbered.
pub struct SingletonGuard {
    path: PathBuf,
    instance_id: String,
}

impl SingletonGuard {
    /// Acquire the singleton lock at `path`, taking over gracefully from a
    /// stale or unresponsive previous holder.
    ///
    /// - If the lockfile is missing or its pid is dead, it is replaced.
    /// - If the lockfile's pid is alive, a graceful termination signal is
    ///   sent and the guard polls for up to five seconds; if the holder
    ///   exits in time, the lockfile is replaced, otherwise startup aborts.
    pub fn acquire(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if let Some(existing) = read_lock(path) {
            if is_pid_alive(existing.pid) {
                info!(pid = existing.pid, "stale broker instance detected, requesting shutdown");
                request_termination(existing.pid);
                if !wait_for_exit(existing.pid, Duration::from_secs(5)) {
                    return Err(std::io::Error::other(format!(
                        "a broker instance (pid {}) is still running and did not exit",
                        existing.pid
                    )));
                }
                info!(pid = existing.pid, "previous broker instance exited, taking over");
            } else {
                warn!(pid = existing.pid, "removing stale lockfile");
            }
        }

        let instance_id = Uuid::new_v4().to_string();
        let record = LockRecord {
            pid: std::process::id(),
            instance_id: instance_id.clone(),
            timestamp: chrono::Utc::now().timestamp(),
        };
        write_lock(path, &record)?;

        Ok(Self {
            path: path.to_path_buf(),
            instance_id,
        })
    }

    /// Remove the lockfile iff it still names this instance.
    pub fn release(&self) {
        if let Some(existing) = read_lock(&self.path) {
            if existing.instance_id == self.instance_id {
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }
}

impl Drop for SingletonGuard {
    fn drop(&mut self) {
        self.release();
    }
}

fn read_lock(path: &Path) -> Option<LockRecord> {
    let contents = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

fn write_lock(path: &Path, record: &LockRecord) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut f = std::fs::File::create(&tmp_path)?;
        f.write_all(serde_json::to_string(record)?.as_bytes())?;
    }
    std::fs::rename(tmp_path, path)
}

fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if !is_pid_alive(pid) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    !is_pid_alive(pid)
}

#[cfg(unix)]
fn is_pid_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(unix)]
fn request_termination(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
}

#[cfg(not(unix))]
fn is_pid_alive(_pid: u32) -> bool {
    false
}

#[cfg(not(unix))]
fn request_termination(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquires_fresh_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broker.lock");
        let guard = SingletonGuard::acquire(&path).unwrap();
        assert!(path.exists());
        let record = read_lock(&path).unwrap();
        assert_eq!(record.pid, std::process::id());
        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn takes_over_stale_lock_with_dead_pid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broker.lock");
        // An implausibly high pid is never a live process.
        let stale = LockRecord {
            pid: 999_999,
            instance_id: "stale".into(),
            timestamp: 0,
        };
        write_lock(&path, &stale).unwrap();
        let guard = SingletonGuard::acquire(&path).unwrap();
        let record = read_lock(&path).unwrap();
        assert_ne!(record.instance_id, "stale");
        drop(guard);
    }

    #[test]
    fn release_does_not_remove_a_successors_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broker.lock");
        let guard = SingletonGuard::acquire(&path).unwrap();
        // Simulate a successor overwriting the lockfile after takeover.
        let successor = LockRecord {
            pid: std::process::id(),
            instance_id: "successor".into(),
            timestamp: 0,
        };
        write_lock(&path, &successor).unwrap();
        guard.release();
        assert!(path.exists(), "release must not clobber a successor's lock");
    }
}
