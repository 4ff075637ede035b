use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::log_warn;
use crate::types::{LockOwner, LockRecord};

pub const LOCK_FILE_NAME: &str = "execution-run.lock.json";

/// Holds the single-owner project execution lock; releases it on drop.
///
/// Release only removes the lock file while its record still matches this
/// process's `{pid, owner, project}` triple, so a newer holder's lock is
/// never deleted by a stale guard.
#[must_use = "lock is released when ExecutionLock is dropped"]
pub struct ExecutionLock {
    path: PathBuf,
    record: LockRecord,
}

impl std::fmt::Debug for ExecutionLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionLock")
            .field("path", &self.path)
            .field("pid", &self.record.pid)
            .field("owner", &self.record.owner)
            .finish()
    }
}

impl Drop for ExecutionLock {
    fn drop(&mut self) {
        match read_record(&self.path) {
            Ok(current)
                if current.pid == self.record.pid
                    && current.owner == self.record.owner
                    && current.project_name == self.record.project_name =>
            {
                if let Err(e) = fs::remove_file(&self.path) {
                    log_warn!(
                        "Warning: Failed to remove lock file {}: {}",
                        self.path.display(),
                        e
                    );
                }
            }
            Ok(_) => {
                log_warn!(
                    "Warning: Lock file {} now belongs to another holder; leaving it",
                    self.path.display()
                );
            }
            Err(e) => {
                log_warn!(
                    "Warning: Could not verify lock file {} on release: {}",
                    self.path.display(),
                    e
                );
            }
        }
    }
}

impl ExecutionLock {
    pub fn record(&self) -> &LockRecord {
        &self.record
    }
}

/// Acquire the per-project execution lock.
///
/// The lock file is created with exclusive-create semantics. On contention
/// the holder's record decides: a live PID means the project is genuinely
/// busy; a dead PID means a stale lock, which is removed followed by a
/// single retry.
pub fn try_acquire(
    runtime_dir: &Path,
    owner: LockOwner,
    project_name: &str,
) -> Result<ExecutionLock, String> {
    fs::create_dir_all(runtime_dir)
        .map_err(|e| format!("Failed to create {}: {}", runtime_dir.display(), e))?;

    let path = runtime_dir.join(LOCK_FILE_NAME);
    let record = LockRecord {
        pid: std::process::id() as i32,
        owner,
        project_name: project_name.to_string(),
        acquired_at: Utc::now(),
    };

    for attempt in 0..2 {
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let contents = serde_json::to_string_pretty(&record)
                    .map_err(|e| format!("Failed to serialize lock record: {}", e))?;
                file.write_all(contents.as_bytes())
                    .map_err(|e| format!("Failed to write lock file {}: {}", path.display(), e))?;
                return Ok(ExecutionLock { path, record });
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = read_record(&path)?;
                if is_pid_alive(holder.pid) {
                    return Err(format!(
                        "Execution already running for project '{}' (pid {}, owner {}, acquired at {})",
                        holder.project_name,
                        holder.pid,
                        holder.owner,
                        holder.acquired_at.to_rfc3339()
                    ));
                }
                if attempt == 0 {
                    log_warn!(
                        "Warning: Removing stale lock held by dead pid {}",
                        holder.pid
                    );
                    fs::remove_file(&path).map_err(|e| {
                        format!("Failed to remove stale lock {}: {}", path.display(), e)
                    })?;
                }
            }
            Err(e) => {
                return Err(format!(
                    "Failed to create lock file {}: {}",
                    path.display(),
                    e
                ));
            }
        }
    }

    Err(format!(
        "Could not acquire lock {} after removing a stale record",
        path.display()
    ))
}

fn read_record(path: &Path) -> Result<LockRecord, String> {
    let contents = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read lock file {}: {}", path.display(), e))?;
    serde_json::from_str(&contents).map_err(|e| {
        format!(
            "Lock file {} is unreadable ({}); remove it to recover",
            path.display(),
            e
        )
    })
}

/// Liveness probe via signal 0. Permission denied still means the process
/// exists; only no-such-process counts as dead.
fn is_pid_alive(pid: i32) -> bool {
    match nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn is_pid_alive_for_current_process() {
        assert!(is_pid_alive(std::process::id() as i32));
    }

    #[test]
    fn is_pid_alive_for_nonexistent_process() {
        // PID 99999999 is almost certainly not alive
        assert!(!is_pid_alive(99_999_999));
    }

    #[test]
    fn contention_names_the_holder() {
        let dir = TempDir::new().unwrap();
        let lock = try_acquire(dir.path(), LockOwner::CliPhaseRun, "demo").unwrap();

        let err = try_acquire(dir.path(), LockOwner::WebAutoMode, "demo").unwrap_err();
        assert!(err.contains("demo"));
        assert!(err.contains(&lock.record().pid.to_string()));
        assert!(err.contains("CLI_PHASE_RUN"));
        assert!(err.contains("acquired at"));
    }

    #[test]
    fn stale_lock_is_removed_and_reacquired() {
        let dir = TempDir::new().unwrap();
        let stale = LockRecord {
            pid: 99_999_999,
            owner: LockOwner::WebAutoMode,
            project_name: "demo".to_string(),
            acquired_at: Utc::now(),
        };
        let path = dir.path().join(LOCK_FILE_NAME);
        fs::write(&path, serde_json::to_string(&stale).unwrap()).unwrap();

        let lock = try_acquire(dir.path(), LockOwner::CliPhaseRun, "demo").unwrap();
        assert_eq!(lock.record().owner, LockOwner::CliPhaseRun);
    }

    #[test]
    fn release_removes_only_matching_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOCK_FILE_NAME);

        {
            let _lock = try_acquire(dir.path(), LockOwner::CliPhaseRun, "demo").unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());

        // A guard must not delete a newer holder's record
        let lock = try_acquire(dir.path(), LockOwner::CliPhaseRun, "demo").unwrap();
        let usurper = LockRecord {
            pid: std::process::id() as i32,
            owner: LockOwner::WebAutoMode,
            project_name: "demo".to_string(),
            acquired_at: Utc::now(),
        };
        fs::write(&path, serde_json::to_string(&usurper).unwrap()).unwrap();
        drop(lock);
        assert!(path.exists());
    }
}
