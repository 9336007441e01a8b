//! Content cache with modification-time invalidation.
//!
//! The stamp recorded with each entry is authoritative: before an entry is
//! served its stamp is compared with the store's current one and the content
//! is re-read on any mismatch. A short TTL may skip that comparison to save
//! stat calls under heavy polling, which bounds staleness for changes made
//! outside this process to the TTL. Local writes go through
//! [`ContentCache::write_through`] so they are never stale.
//!
//! A mismatch means "different", not "newer": a file restored with an older
//! modification time (`cp -p`, `rsync -a`, a clock stepping back) replaces
//! the cached copy like any other external change.

use crate::clock::{chrono_duration, SharedClock};
use crate::error::{CoordinationError, Result};
use crate::fs::{DocumentName, DocumentStamp, DocumentStore, StoredDocument};
use crate::observability::CoordinationMetrics;
use chrono::{DateTime, Utc};
use moka::sync::Cache;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedDocument {
    pub name: DocumentName,
    pub content: String,
    pub stamp: DocumentStamp,
    pub cached_at: DateTime<Utc>,
    pub checked_at: DateTime<Utc>,
}

/// How a document differs from what the cache last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentChange {
    pub name: DocumentName,
    pub kind: ChangeKind,
}

pub struct ContentCache {
    store: Arc<dyn DocumentStore>,
    entries: Cache<String, Arc<CachedDocument>>,
    // Last stamp observed for every known document. Its mutex also serializes
    // cache inserts so an older read never replaces a newer entry.
    known: Mutex<HashMap<DocumentName, DocumentStamp>>,
    ttl: Duration,
    clock: SharedClock,
    metrics: Arc<CoordinationMetrics>,
}

impl std::fmt::Debug for ContentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentCache")
            .field("entries", &self.entries.entry_count())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl ContentCache {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        ttl: Duration,
        max_entries: u64,
        clock: SharedClock,
        metrics: Arc<CoordinationMetrics>,
    ) -> Self {
        Self {
            store,
            entries: Cache::builder().max_capacity(max_entries).build(),
            known: Mutex::new(HashMap::new()),
            ttl,
            clock,
            metrics,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Read through the cache. Within the TTL of the last freshness check the
    /// cached copy is served without touching the store.
    pub async fn read(&self, name: &DocumentName) -> Result<Arc<CachedDocument>> {
        if let Some(entry) = self.entries.get(name.as_str()) {
            let age = self.clock.now() - entry.checked_at;
            if !self.ttl.is_zero() && age < chrono_duration(self.ttl) {
                self.metrics.record_cache_hit();
                return Ok(entry);
            }
        }
        self.read_fresh(name).await
    }

    /// Read with a mandatory stamp comparison against the store.
    pub async fn read_fresh(&self, name: &DocumentName) -> Result<Arc<CachedDocument>> {
        let Some(current) = self.store.stamp(name).await? else {
            self.forget(name);
            return Err(CoordinationError::NotFound(name.to_string()));
        };

        if let Some(entry) = self.entries.get(name.as_str()) {
            if entry.stamp == current {
                self.metrics.record_cache_hit();
                return Ok(self.mark_checked(entry));
            }
            debug!(document = %name, "Cached copy is stale, re-reading");
        }

        self.metrics.record_cache_miss();
        let stored = match self.store.read(name).await {
            Ok(stored) => stored,
            Err(CoordinationError::NotFound(missing)) => {
                self.forget(name);
                return Err(CoordinationError::NotFound(missing));
            }
            Err(e) => return Err(e),
        };

        // An older stamp is either an external restore or a read that raced
        // a newer local write. Only the store can tell which.
        if let Some(existing) = self.entries.get(name.as_str()) {
            let regressed = existing.stamp.is_newer_than(&stored.stamp);
            if regressed && self.store.stamp(name).await? != Some(stored.stamp) {
                debug!(document = %name, "Newer write landed during re-read, keeping it");
                return Ok(existing);
            }
        }
        Ok(self.replace(name, stored))
    }

    /// Record content the caller just wrote. Called by the editor while it
    /// still holds the document lock.
    pub fn write_through(&self, name: &DocumentName, content: String, stamp: DocumentStamp) -> Arc<CachedDocument> {
        self.insert_if_newer(name, StoredDocument { content, stamp })
    }

    pub fn invalidate(&self, name: &DocumentName) {
        self.entries.invalidate(name.as_str());
        debug!(document = %name, "Cache entry invalidated");
    }

    /// Compare every document in the store with the last observed stamps.
    /// Changed documents have their cached content dropped so the next read
    /// reloads it.
    pub async fn reconcile(&self) -> Result<Vec<DocumentChange>> {
        let listed = self.store.list().await?;
        let mut observed = Vec::with_capacity(listed.len());
        for name in listed {
            if let Some(stamp) = self.store.stamp(&name).await? {
                observed.push((name, stamp));
            }
        }

        let mut changes = Vec::new();
        let mut regressed = Vec::new();
        let vanished: Vec<DocumentName> = {
            let mut known = self.lock_known();
            for (name, stamp) in &observed {
                match known.get(name) {
                    None => {
                        known.insert(name.clone(), *stamp);
                        changes.push(DocumentChange {
                            name: name.clone(),
                            kind: ChangeKind::Created,
                        });
                    }
                    Some(previous) if previous == stamp => {}
                    Some(previous) if previous.is_newer_than(stamp) => regressed.push((name.clone(), *stamp)),
                    Some(_) => {
                        known.insert(name.clone(), *stamp);
                        self.entries.invalidate(name.as_str());
                        changes.push(DocumentChange {
                            name: name.clone(),
                            kind: ChangeKind::Modified,
                        });
                    }
                }
            }
            known
                .keys()
                .filter(|name| !observed.iter().any(|(seen, _)| seen == *name))
                .cloned()
                .collect()
        };

        for (name, stamp) in regressed {
            // An older stamp that is still on disk is a restore; anything else
            // means a local write landed after the listing.
            if self.store.stamp(&name).await? != Some(stamp) {
                continue;
            }
            let mut known = self.lock_known();
            if known.get(&name).is_some_and(|previous| *previous != stamp) {
                known.insert(name.clone(), stamp);
                self.entries.invalidate(name.as_str());
                changes.push(DocumentChange {
                    name,
                    kind: ChangeKind::Modified,
                });
            }
        }

        for name in vanished {
            // Re-check: a writer may have created it after the listing.
            if self.store.stamp(&name).await?.is_none() {
                self.forget(&name);
                changes.push(DocumentChange {
                    name,
                    kind: ChangeKind::Removed,
                });
            }
        }

        for change in &changes {
            info!(document = %change.name, kind = ?change.kind, "Detected document change in store");
        }
        Ok(changes)
    }

    /// Byte sizes of every known document.
    pub fn document_sizes(&self) -> Vec<(DocumentName, u64)> {
        let known = self.lock_known();
        let mut sizes: Vec<_> = known.iter().map(|(name, stamp)| (name.clone(), stamp.len)).collect();
        sizes.sort();
        sizes
    }

    pub fn total_bytes(&self) -> u64 {
        self.lock_known().values().map(|stamp| stamp.len).sum()
    }

    pub fn is_cached(&self, name: &DocumentName) -> bool {
        self.entries.contains_key(name.as_str())
    }

    fn lock_known(&self) -> MutexGuard<'_, HashMap<DocumentName, DocumentStamp>> {
        self.known.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn forget(&self, name: &DocumentName) {
        let mut known = self.lock_known();
        known.remove(name);
        self.entries.invalidate(name.as_str());
    }

    fn mark_checked(&self, entry: Arc<CachedDocument>) -> Arc<CachedDocument> {
        let known = self.lock_known();
        match self.entries.get(entry.name.as_str()) {
            Some(current) if current.stamp == entry.stamp => {
                let refreshed = Arc::new(CachedDocument {
                    checked_at: self.clock.now(),
                    ..(*current).clone()
                });
                self.entries.insert(entry.name.to_string(), refreshed.clone());
                drop(known);
                refreshed
            }
            Some(current) => current,
            None => entry,
        }
    }

    /// Store what was just read from disk, whatever its stamp.
    fn replace(&self, name: &DocumentName, stored: StoredDocument) -> Arc<CachedDocument> {
        let now = self.clock.now();
        let mut known = self.lock_known();
        let entry = Arc::new(CachedDocument {
            name: name.clone(),
            content: stored.content,
            stamp: stored.stamp,
            cached_at: now,
            checked_at: now,
        });
        self.entries.insert(name.to_string(), entry.clone());
        known.insert(name.clone(), stored.stamp);
        entry
    }

    fn insert_if_newer(&self, name: &DocumentName, stored: StoredDocument) -> Arc<CachedDocument> {
        let now = self.clock.now();
        let mut known = self.lock_known();

        if let Some(existing) = self.entries.get(name.as_str()) {
            if existing.stamp.is_newer_than(&stored.stamp) {
                return existing;
            }
        }

        let entry = Arc::new(CachedDocument {
            name: name.clone(),
            content: stored.content,
            stamp: stored.stamp,
            cached_at: now,
            checked_at: now,
        });
        self.entries.insert(name.to_string(), entry.clone());

        let replace_known = match known.get(name) {
            Some(previous) => !previous.is_newer_than(&stored.stamp),
            None => true,
        };
        if replace_known {
            known.insert(name.clone(), stored.stamp);
        }
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::fs::FileDocumentStore;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<FileDocumentStore>,
        cache: ContentCache,
        clock: ManualClock,
        metrics: Arc<CoordinationMetrics>,
    }

    fn fixture(ttl: Duration) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileDocumentStore::new(dir.path()));
        let clock = ManualClock::default();
        let metrics = Arc::new(CoordinationMetrics::new());
        let cache = ContentCache::new(store.clone(), ttl, 64, Arc::new(clock.clone()), metrics.clone());
        Fixture {
            _dir: dir,
            store,
            cache,
            clock,
            metrics,
        }
    }

    fn doc(name: &str) -> DocumentName {
        DocumentName::parse(name).unwrap()
    }

    #[tokio::test]
    async fn test_read_detects_external_change_without_ttl() {
        let f = fixture(Duration::ZERO);
        f.store.write(&doc("plan.md"), "first").await.unwrap();

        assert_eq!(f.cache.read(&doc("plan.md")).await.unwrap().content, "first");
        f.store.write(&doc("plan.md"), "second").await.unwrap();
        assert_eq!(f.cache.read(&doc("plan.md")).await.unwrap().content, "second");
    }

    #[tokio::test]
    async fn test_ttl_bounds_staleness_for_external_writes() {
        let f = fixture(Duration::from_secs(2));
        f.store.write(&doc("plan.md"), "first").await.unwrap();
        f.cache.read(&doc("plan.md")).await.unwrap();

        f.store.write(&doc("plan.md"), "second").await.unwrap();
        // Inside the window the cached copy may be served.
        assert_eq!(f.cache.read(&doc("plan.md")).await.unwrap().content, "first");

        f.clock.advance(Duration::from_secs(3));
        assert_eq!(f.cache.read(&doc("plan.md")).await.unwrap().content, "second");
    }

    #[tokio::test]
    async fn test_read_fresh_ignores_ttl() {
        let f = fixture(Duration::from_secs(60));
        f.store.write(&doc("plan.md"), "first").await.unwrap();
        f.cache.read(&doc("plan.md")).await.unwrap();
        f.store.write(&doc("plan.md"), "second").await.unwrap();

        assert_eq!(f.cache.read_fresh(&doc("plan.md")).await.unwrap().content, "second");
    }

    #[tokio::test]
    async fn test_write_through_is_visible_immediately() {
        let f = fixture(Duration::from_secs(60));
        f.store.write(&doc("plan.md"), "old").await.unwrap();
        f.cache.read(&doc("plan.md")).await.unwrap();

        let stamp = f.store.write(&doc("plan.md"), "new").await.unwrap();
        f.cache.write_through(&doc("plan.md"), "new".to_string(), stamp);

        assert_eq!(f.cache.read(&doc("plan.md")).await.unwrap().content, "new");
    }

    #[tokio::test]
    async fn test_older_read_never_replaces_newer_entry() {
        let f = fixture(Duration::from_secs(60));
        let old_stamp = f.store.write(&doc("plan.md"), "old").await.unwrap();
        let new_stamp = f.store.write(&doc("plan.md"), "new").await.unwrap();

        f.cache.write_through(&doc("plan.md"), "new".to_string(), new_stamp);
        let kept = f.cache.write_through(&doc("plan.md"), "old".to_string(), old_stamp);

        assert_eq!(kept.content, "new");
        assert_eq!(f.cache.read(&doc("plan.md")).await.unwrap().content, "new");
    }

    fn set_mtime(path: &std::path::Path, modified: std::time::SystemTime) {
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(modified).unwrap();
    }

    #[tokio::test]
    async fn test_restore_with_older_mtime_is_picked_up() {
        let f = fixture(Duration::ZERO);
        let path = f.store.root().join("plan.md");
        f.store.write(&doc("plan.md"), "v1").await.unwrap();
        let current = f.store.write(&doc("plan.md"), "v2 original").await.unwrap();
        f.cache.write_through(&doc("plan.md"), "v2 original".to_string(), current);

        std::fs::write(&path, "RESTORED FROM BACKUP v1").unwrap();
        set_mtime(&path, current.modified - Duration::from_secs(3600));

        let fresh = f.cache.read_fresh(&doc("plan.md")).await.unwrap();
        assert_eq!(fresh.content, "RESTORED FROM BACKUP v1");
        assert_eq!(f.cache.read(&doc("plan.md")).await.unwrap().content, "RESTORED FROM BACKUP v1");
        assert_eq!(f.cache.total_bytes(), "RESTORED FROM BACKUP v1".len() as u64);
    }

    #[tokio::test]
    async fn test_reconcile_reports_restore_with_older_mtime() {
        let f = fixture(Duration::ZERO);
        let path = f.store.root().join("plan.md");
        let current = f.store.write(&doc("plan.md"), "current").await.unwrap();
        f.cache.reconcile().await.unwrap();
        f.cache.read(&doc("plan.md")).await.unwrap();

        std::fs::write(&path, "restored").unwrap();
        set_mtime(&path, current.modified - Duration::from_secs(3600));

        let changes = f.cache.reconcile().await.unwrap();
        assert_eq!(
            changes,
            vec![DocumentChange {
                name: doc("plan.md"),
                kind: ChangeKind::Modified
            }]
        );
        assert!(!f.cache.is_cached(&doc("plan.md")));
        assert!(f.cache.reconcile().await.unwrap().is_empty());
        assert_eq!(f.cache.read(&doc("plan.md")).await.unwrap().content, "restored");
    }

    #[tokio::test]
    async fn test_missing_document_is_not_found_and_forgotten() {
        let f = fixture(Duration::ZERO);
        f.store.write(&doc("plan.md"), "x").await.unwrap();
        f.cache.read(&doc("plan.md")).await.unwrap();
        std::fs::remove_file(f.store.root().join("plan.md")).unwrap();

        let result = f.cache.read(&doc("plan.md")).await;
        assert!(matches!(result, Err(CoordinationError::NotFound(_))));
        assert!(!f.cache.is_cached(&doc("plan.md")));
        assert_eq!(f.cache.total_bytes(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_reports_created_modified_removed() {
        let f = fixture(Duration::ZERO);
        f.store.write(&doc("a.md"), "a").await.unwrap();
        f.store.write(&doc("b.md"), "b").await.unwrap();

        let first = f.cache.reconcile().await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|change| change.kind == ChangeKind::Created));
        assert!(f.cache.reconcile().await.unwrap().is_empty());

        f.store.write(&doc("a.md"), "a2").await.unwrap();
        std::fs::remove_file(f.store.root().join("b.md")).unwrap();

        let changes = f.cache.reconcile().await.unwrap();
        assert!(changes.contains(&DocumentChange {
            name: doc("a.md"),
            kind: ChangeKind::Modified
        }));
        assert!(changes.contains(&DocumentChange {
            name: doc("b.md"),
            kind: ChangeKind::Removed
        }));
        assert_eq!(f.cache.document_sizes(), vec![(doc("a.md"), 2)]);
    }

    #[tokio::test]
    async fn test_hits_and_misses_are_counted() {
        let f = fixture(Duration::from_secs(5));
        f.store.write(&doc("plan.md"), "x").await.unwrap();

        f.cache.read(&doc("plan.md")).await.unwrap();
        f.cache.read(&doc("plan.md")).await.unwrap();

        let snapshot = f.metrics.snapshot();
        assert_eq!(snapshot.cache_misses, 1);
        assert_eq!(snapshot.cache_hits, 1);
    }
}
