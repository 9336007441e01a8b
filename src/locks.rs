//! Per-document leases with timeout, backoff and stale-lease recovery.
//!
//! A lease is a small JSON record in `<lock_dir>/<document>.lease`. Inspecting,
//! claiming and releasing a lease all happen while holding an exclusive
//! `fd-lock` on the matching `.guard` file, so agents in separate processes
//! serialize on the same document just like tasks within one process.
//!
//! A lease whose deadline has passed is treated as abandoned: the next caller
//! takes it over and the takeover is logged and kept in an audit list.

use crate::clock::{chrono_duration, SharedClock};
use crate::error::{CoordinationError, Result};
use crate::fs::DocumentName;
use crate::observability::CoordinationMetrics;
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use fd_lock::RwLock;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

const MAX_AUDIT_ENTRIES: usize = 256;

/// On-disk lease contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub document: String,
    pub holder: String,
    pub token: String,
    pub acquired_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

impl LeaseRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline <= now
    }
}

/// Audit entry written whenever an abandoned lease is taken over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reclamation {
    pub document: String,
    pub previous_holder: String,
    pub previous_deadline: Option<DateTime<Utc>>,
    pub reclaimed_by: String,
    pub reclaimed_at: DateTime<Utc>,
}

/// Proof of ownership returned by [`LockManager::acquire`].
#[derive(Debug, Clone)]
pub struct LockHandle {
    document: DocumentName,
    holder: String,
    token: String,
    acquired_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
    reclaimed: Option<Reclamation>,
}

impl LockHandle {
    pub fn document(&self) -> &DocumentName {
        &self.document
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    /// Set when this acquisition took over an abandoned lease.
    pub fn reclaimed(&self) -> Option<&Reclamation> {
        self.reclaimed.as_ref()
    }
}

enum Claim {
    Acquired {
        record: LeaseRecord,
        reclaimed: Option<Reclamation>,
    },
    Held(LeaseRecord),
}

pub struct LockManager {
    lock_dir: PathBuf,
    clock: SharedClock,
    backoff: RetryPolicy,
    default_timeout: Duration,
    default_max_wait: Duration,
    reclamations: Mutex<Vec<Reclamation>>,
    metrics: Arc<CoordinationMetrics>,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("lock_dir", &self.lock_dir)
            .field("default_timeout", &self.default_timeout)
            .field("default_max_wait", &self.default_max_wait)
            .finish()
    }
}

impl LockManager {
    pub fn new(
        lock_dir: impl Into<PathBuf>,
        clock: SharedClock,
        backoff: RetryPolicy,
        default_timeout: Duration,
        default_max_wait: Duration,
        metrics: Arc<CoordinationMetrics>,
    ) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            clock,
            backoff,
            default_timeout,
            default_max_wait,
            reclamations: Mutex::new(Vec::new()),
            metrics,
        }
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn default_max_wait(&self) -> Duration {
        self.default_max_wait
    }

    /// Acquire using the configured timeout and max-wait.
    pub async fn acquire_default(&self, document: &DocumentName, holder: &str) -> Result<LockHandle> {
        self.acquire(document, holder, self.default_timeout, self.default_max_wait)
            .await
    }

    /// Acquire the lease on `document` for `holder`.
    ///
    /// `timeout` bounds how long the lease stays valid without release;
    /// `max_wait` bounds how long this call waits for a live lease held by
    /// someone else. Re-acquiring a live lease you already hold fails with
    /// `SelfDeadlock` instead of blocking.
    pub async fn acquire(
        &self,
        document: &DocumentName,
        holder: &str,
        timeout: Duration,
        max_wait: Duration,
    ) -> Result<LockHandle> {
        let started = tokio::time::Instant::now();
        let mut attempt: u32 = 0;

        loop {
            match self.try_claim(document, holder, timeout).await? {
                Claim::Acquired { record, reclaimed } => {
                    let waited = started.elapsed();
                    self.metrics.record_lock_acquired(attempt > 0);
                    if let Some(reclamation) = &reclaimed {
                        self.record_reclamation(reclamation.clone());
                    }
                    debug!(
                        document = %document,
                        holder = %holder,
                        waited_ms = waited.as_millis() as u64,
                        attempts = attempt + 1,
                        "Lock acquired"
                    );
                    return Ok(LockHandle {
                        document: document.clone(),
                        holder: record.holder,
                        token: record.token,
                        acquired_at: record.acquired_at,
                        deadline: record.deadline,
                        reclaimed,
                    });
                }
                Claim::Held(current) => {
                    if current.holder == holder {
                        return Err(CoordinationError::SelfDeadlock {
                            document: document.to_string(),
                            holder: holder.to_string(),
                        });
                    }

                    let waited = started.elapsed();
                    if waited >= max_wait {
                        self.metrics.record_lock_timeout();
                        debug!(
                            document = %document,
                            holder = %holder,
                            current_holder = %current.holder,
                            "Lock wait exhausted"
                        );
                        return Err(CoordinationError::LockTimeout {
                            document: document.to_string(),
                            holder: current.holder,
                            waited,
                        });
                    }

                    let delay = self.backoff.delay_for(attempt).min(max_wait - waited);
                    attempt = attempt.saturating_add(1);
                    tokio::time::sleep(delay.max(Duration::from_millis(1))).await;
                }
            }
        }
    }

    /// Release a lease. Releasing a handle that was already released, or
    /// whose lease was reclaimed by someone else, is a no-op. Returns whether
    /// a lease was actually removed.
    pub async fn release(&self, handle: &LockHandle) -> Result<bool> {
        let lock_dir = self.lock_dir.clone();
        let key = handle.document.flat_key();
        let token = handle.token.clone();

        let removed = tokio::task::spawn_blocking(move || release_blocking(&lock_dir, &key, &token))
            .await
            .map_err(|e| CoordinationError::io("release lease", std::io::Error::other(e)))?
            .map_err(|e| CoordinationError::io(format!("release lease on {}", handle.document), e))?;

        if removed {
            debug!(document = %handle.document, holder = %handle.holder, "Lock released");
        } else {
            debug!(
                document = %handle.document,
                holder = %handle.holder,
                "Release ignored, lease no longer owned by this handle"
            );
        }
        Ok(removed)
    }

    /// Confirm `handle` still owns a live lease on its document. The editor
    /// calls this under the guard right before each write, so a holder whose
    /// lease lapsed never overwrites the work of whoever reclaimed it.
    pub async fn verify(&self, handle: &LockHandle) -> Result<()> {
        let now = self.clock.now();
        let lock_dir = self.lock_dir.clone();
        let key = handle.document.flat_key();
        let token = handle.token.clone();

        let owned = tokio::task::spawn_blocking(move || verify_blocking(&lock_dir, &key, &token, now))
            .await
            .map_err(|e| CoordinationError::io("verify lease", std::io::Error::other(e)))?
            .map_err(|e| CoordinationError::io(format!("verify lease on {}", handle.document), e))?;

        if owned {
            return Ok(());
        }
        warn!(
            document = %handle.document,
            holder = %handle.holder,
            deadline = %handle.deadline,
            "Lease lost before write"
        );
        Err(CoordinationError::LeaseLost {
            document: handle.document.to_string(),
            holder: handle.holder.clone(),
        })
    }

    /// Current lease on `document`, live or expired.
    pub async fn inspect(&self, document: &DocumentName) -> Result<Option<LeaseRecord>> {
        let path = self.lock_dir.join(format!("{}.lease", document.flat_key()));
        tokio::task::spawn_blocking(move || read_lease(&path))
            .await
            .map_err(|e| CoordinationError::io("inspect lease", std::io::Error::other(e)))?
            .map_err(|e| CoordinationError::io(format!("inspect lease on {document}"), e))
    }

    /// Reclamations observed by this manager, oldest first.
    pub fn reclamations(&self) -> Vec<Reclamation> {
        self.reclamations
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    async fn try_claim(&self, document: &DocumentName, holder: &str, timeout: Duration) -> Result<Claim> {
        let now = self.clock.now();
        let lock_dir = self.lock_dir.clone();
        let key = document.flat_key();
        let candidate = LeaseRecord {
            document: document.to_string(),
            holder: holder.to_string(),
            token: uuid::Uuid::new_v4().to_string(),
            acquired_at: now,
            deadline: now + chrono_duration(timeout),
        };

        tokio::task::spawn_blocking(move || claim_blocking(&lock_dir, &key, candidate, now))
            .await
            .map_err(|e| CoordinationError::io("claim lease", std::io::Error::other(e)))?
            .map_err(|e| CoordinationError::io(format!("claim lease on {document}"), e))
    }

    fn record_reclamation(&self, reclamation: Reclamation) {
        warn!(
            document = %reclamation.document,
            previous_holder = %reclamation.previous_holder,
            reclaimed_by = %reclamation.reclaimed_by,
            previous_deadline = ?reclamation.previous_deadline,
            "Reclaimed abandoned lock"
        );
        self.metrics.record_lock_reclaimed();

        if let Ok(mut entries) = self.reclamations.lock() {
            if entries.len() >= MAX_AUDIT_ENTRIES {
                entries.remove(0);
            }
            entries.push(reclamation);
        }
    }
}

fn open_guard(lock_dir: &Path, key: &str) -> std::io::Result<RwLock<File>> {
    std::fs::create_dir_all(lock_dir)?;
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_dir.join(format!("{key}.guard")))?;
    Ok(RwLock::new(file))
}

fn read_lease(path: &Path) -> std::io::Result<Option<LeaseRecord>> {
    match std::fs::read(path) {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable lease file, treating as abandoned");
                Ok(Some(LeaseRecord {
                    document: String::new(),
                    holder: "unknown".to_string(),
                    token: String::new(),
                    acquired_at: DateTime::<Utc>::MIN_UTC,
                    deadline: DateTime::<Utc>::MIN_UTC,
                }))
            }
        },
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn write_lease(path: &Path, record: &LeaseRecord) -> std::io::Result<()> {
    let bytes = serde_json::to_vec_pretty(record).map_err(std::io::Error::other)?;
    let temp = path.with_extension("lease.tmp");
    std::fs::write(&temp, bytes)?;
    std::fs::rename(&temp, path)
}

fn claim_blocking(lock_dir: &Path, key: &str, candidate: LeaseRecord, now: DateTime<Utc>) -> std::io::Result<Claim> {
    let mut guard_lock = open_guard(lock_dir, key)?;
    let _guard = guard_lock.write()?;

    let lease_path = lock_dir.join(format!("{key}.lease"));
    let reclaimed = match read_lease(&lease_path)? {
        Some(current) if !current.is_expired(now) => return Ok(Claim::Held(current)),
        Some(expired) => Some(Reclamation {
            document: candidate.document.clone(),
            previous_holder: expired.holder,
            previous_deadline: (expired.deadline != DateTime::<Utc>::MIN_UTC).then_some(expired.deadline),
            reclaimed_by: candidate.holder.clone(),
            reclaimed_at: now,
        }),
        None => None,
    };

    write_lease(&lease_path, &candidate)?;
    Ok(Claim::Acquired {
        record: candidate,
        reclaimed,
    })
}

fn release_blocking(lock_dir: &Path, key: &str, token: &str) -> std::io::Result<bool> {
    let mut guard_lock = open_guard(lock_dir, key)?;
    let _guard = guard_lock.write()?;

    let lease_path = lock_dir.join(format!("{key}.lease"));
    match read_lease(&lease_path)? {
        Some(current) if current.token == token => match std::fs::remove_file(&lease_path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        },
        _ => Ok(false),
    }
}

fn verify_blocking(lock_dir: &Path, key: &str, token: &str, now: DateTime<Utc>) -> std::io::Result<bool> {
    let mut guard_lock = open_guard(lock_dir, key)?;
    let _guard = guard_lock.write()?;

    let lease_path = lock_dir.join(format!("{key}.lease"));
    Ok(matches!(read_lease(&lease_path)?, Some(current) if current.token == token && !current.is_expired(now)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tempfile::TempDir;

    fn manager(dir: &TempDir, clock: ManualClock) -> LockManager {
        LockManager::new(
            dir.path().join("locks"),
            Arc::new(clock),
            RetryPolicy::new(10, Duration::from_millis(5), 2.0, Duration::from_millis(20)),
            Duration::from_secs(30),
            Duration::from_millis(200),
            Arc::new(CoordinationMetrics::new()),
        )
    }

    fn doc(name: &str) -> DocumentName {
        DocumentName::parse(name).unwrap()
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir, ManualClock::default());

        let handle = locks.acquire_default(&doc("plan.md"), "agent-a").await.unwrap();
        assert_eq!(handle.holder(), "agent-a");
        assert!(handle.reclaimed().is_none());
        assert!(locks.inspect(&doc("plan.md")).await.unwrap().is_some());

        assert!(locks.release(&handle).await.unwrap());
        assert!(locks.inspect(&doc("plan.md")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_contended_acquire_times_out() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir, ManualClock::default());

        let _held = locks.acquire_default(&doc("plan.md"), "agent-a").await.unwrap();
        let result = locks
            .acquire(&doc("plan.md"), "agent-b", Duration::from_secs(30), Duration::from_millis(40))
            .await;

        match result {
            Err(CoordinationError::LockTimeout { holder, .. }) => assert_eq!(holder, "agent-a"),
            other => panic!("expected LockTimeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reentrant_acquire_is_rejected() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir, ManualClock::default());

        let _held = locks.acquire_default(&doc("plan.md"), "agent-a").await.unwrap();
        let result = locks.acquire_default(&doc("plan.md"), "agent-a").await;
        assert!(matches!(result, Err(CoordinationError::SelfDeadlock { .. })));
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed_and_audited() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::default();
        let locks = manager(&dir, clock.clone());

        let stale = locks
            .acquire(&doc("plan.md"), "crashed-agent", Duration::from_secs(5), Duration::from_millis(50))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(6));

        let fresh = locks.acquire_default(&doc("plan.md"), "agent-b").await.unwrap();
        let reclamation = fresh.reclaimed().expect("reclamation recorded on handle");
        assert_eq!(reclamation.previous_holder, "crashed-agent");
        assert_eq!(reclamation.reclaimed_by, "agent-b");
        assert_eq!(locks.reclamations().len(), 1);

        // The crashed holder's late release must not disturb the new owner.
        assert!(!locks.release(&stale).await.unwrap());
        let current = locks.inspect(&doc("plan.md")).await.unwrap().unwrap();
        assert_eq!(current.holder, "agent-b");
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir, ManualClock::default());

        let first = locks.acquire_default(&doc("plan.md"), "agent-a").await.unwrap();
        assert!(locks.release(&first).await.unwrap());
        assert!(!locks.release(&first).await.unwrap());

        let second = locks.acquire_default(&doc("plan.md"), "agent-b").await.unwrap();
        assert!(!locks.release(&first).await.unwrap());
        assert_eq!(
            locks.inspect(&doc("plan.md")).await.unwrap().unwrap().token,
            second.token()
        );
    }

    #[tokio::test]
    async fn test_waiter_acquires_after_release() {
        let dir = TempDir::new().unwrap();
        let locks = Arc::new(manager(&dir, ManualClock::default()));

        let held = locks.acquire_default(&doc("plan.md"), "agent-a").await.unwrap();
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks
                    .acquire(&doc("plan.md"), "agent-b", Duration::from_secs(30), Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        locks.release(&held).await.unwrap();

        let handle = waiter.await.unwrap().unwrap();
        assert_eq!(handle.holder(), "agent-b");
    }

    #[tokio::test]
    async fn test_verify_fails_once_lease_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::default();
        let locks = manager(&dir, clock.clone());

        let slow = locks
            .acquire(&doc("plan.md"), "slow-agent", Duration::from_secs(5), Duration::from_millis(50))
            .await
            .unwrap();
        locks.verify(&slow).await.unwrap();

        clock.advance(Duration::from_secs(6));
        let expired = locks.verify(&slow).await;
        assert!(matches!(expired, Err(CoordinationError::LeaseLost { ref holder, .. }) if holder == "slow-agent"));

        let fresh = locks.acquire_default(&doc("plan.md"), "agent-b").await.unwrap();
        locks.verify(&fresh).await.unwrap();
        assert!(matches!(locks.verify(&slow).await, Err(CoordinationError::LeaseLost { .. })));
    }

    #[tokio::test]
    async fn test_nested_and_underscored_names_do_not_share_a_lease() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir, ManualClock::default());

        let nested = locks.acquire_default(&doc("a/b.md"), "agent-a").await.unwrap();
        let flat = locks
            .acquire(&doc("a__b.md"), "agent-b", Duration::from_secs(30), Duration::from_millis(40))
            .await
            .unwrap();
        assert_eq!(flat.holder(), "agent-b");

        // One holder may hold both without tripping the self-deadlock check.
        locks.release(&flat).await.unwrap();
        let same_holder = locks.acquire_default(&doc("a__b.md"), "agent-a").await.unwrap();
        assert!(locks.release(&same_holder).await.unwrap());
        assert!(locks.release(&nested).await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_lease_is_treated_as_abandoned() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir, ManualClock::default());
        std::fs::create_dir_all(dir.path().join("locks")).unwrap();
        std::fs::write(dir.path().join("locks/plan.md.lease"), "not json").unwrap();

        let handle = locks.acquire_default(&doc("plan.md"), "agent-a").await.unwrap();
        let reclamation = handle.reclaimed().unwrap();
        assert_eq!(reclamation.previous_holder, "unknown");
        assert_eq!(reclamation.previous_deadline, None);
    }
}
