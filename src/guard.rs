use anyhow::{anyhow, Context, Result};
use fd_lock::{RwLock, RwLockWriteGuard};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::info;

pub const GUARD_FILE: &str = "coordinator.lock";

/// Exclusive claim on a mission root for a long-running monitor.
///
/// Only one `watch` service may own a mission at a time; editors never take
/// this guard and coordinate through document leases instead. The lock is
/// released when the guard is dropped or the process exits.
pub struct MissionGuard {
    path: PathBuf,
    _lock_guard: RwLockWriteGuard<'static, File>,
}

impl std::fmt::Debug for MissionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MissionGuard").field("path", &self.path).finish()
    }
}

impl MissionGuard {
    pub fn acquire(lock_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(lock_dir)
            .with_context(|| format!("failed to create lock directory {}", lock_dir.display()))?;

        let path = lock_dir.join(GUARD_FILE);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;

        // The guard borrows the lock for the rest of the process.
        let lock = Box::leak(Box::new(RwLock::new(lock_file)));
        let mut guard = lock.try_write().map_err(|_| {
            anyhow!(
                "Another coordinator already owns {}. Only one watcher can run per mission.",
                lock_dir.display()
            )
        })?;

        let owner = format!("{}@{}\n", std::process::id(), host_name());
        guard.set_len(0)?;
        guard.seek(SeekFrom::Start(0))?;
        guard.write_all(owner.as_bytes())?;
        guard.flush()?;

        info!(path = %path.display(), "Mission guard acquired");
        Ok(Self {
            path,
            _lock_guard: guard,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn host_name() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown-host".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_guard_is_refused_until_first_drops() {
        let dir = TempDir::new().unwrap();
        let lock_dir = dir.path().join("locks");

        let first = MissionGuard::acquire(&lock_dir).unwrap();
        assert!(first.path().exists());
        assert!(MissionGuard::acquire(&lock_dir).is_err());

        drop(first);
        assert!(MissionGuard::acquire(&lock_dir).is_ok());
    }

    #[test]
    fn test_guard_records_owner_pid() {
        let dir = TempDir::new().unwrap();
        let guard = MissionGuard::acquire(dir.path()).unwrap();
        let contents = std::fs::read_to_string(guard.path()).unwrap();
        assert!(contents.starts_with(&std::process::id().to_string()));
    }
}
