/// Document storage abstraction
///
/// Every document lives as a flat UTF-8 file under the mission root. The store
/// is the single source of truth; the cache and editor only ever reach it
/// through the [`DocumentStore`] trait, which can be mocked in tests with the
/// `mockall` crate.
///
/// # Examples
///
/// ```rust,no_run
/// use mission_relay::fs::{DocumentName, DocumentStore, FileDocumentStore};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let store = FileDocumentStore::new("mission");
///     let name = DocumentName::parse("specifications.md")?;
///
///     let stamp = store.write(&name, "# Specifications\n").await?;
///     let stored = store.read(&name).await?;
///     assert_eq!(stored.stamp, stamp);
///     Ok(())
/// }
/// ```
pub mod names;

pub use names::DocumentName;

use crate::error::{CoordinationError, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::io::AsyncReadExt;
use tracing::debug;

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

/// Freshness signal for a document: modification time plus byte length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentStamp {
    pub modified: SystemTime,
    pub len: u64,
}

impl DocumentStamp {
    pub fn from_metadata(metadata: &std::fs::Metadata) -> std::io::Result<Self> {
        Ok(Self {
            modified: metadata.modified()?,
            len: metadata.len(),
        })
    }

    /// True when `self` was written strictly after `other`.
    pub fn is_newer_than(&self, other: &DocumentStamp) -> bool {
        self.modified > other.modified
    }
}

/// Content and stamp taken from the same open handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    pub content: String,
    pub stamp: DocumentStamp,
}

/// Trait for document storage that can be mocked in tests
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read the full content, failing with `NotFound` if absent
    async fn read(&self, name: &DocumentName) -> Result<StoredDocument>;

    /// Current stamp without reading content; `None` if the document is absent
    async fn stamp(&self, name: &DocumentName) -> Result<Option<DocumentStamp>>;

    /// Replace the whole content, creating parent directories as needed.
    /// The returned stamp is strictly newer than the one it replaces.
    async fn write(&self, name: &DocumentName, content: &str) -> Result<DocumentStamp>;

    async fn exists(&self, name: &DocumentName) -> bool;

    /// Every document under the root, sorted by name
    async fn list(&self) -> Result<Vec<DocumentName>>;
}

/// Filesystem-backed store rooted at the mission directory.
///
/// Writes go to a hidden sibling temp file which is renamed over the target,
/// so readers only ever observe complete contents.
#[derive(Debug, Clone)]
pub struct FileDocumentStore {
    root: PathBuf,
    excluded: Vec<PathBuf>,
}

impl FileDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            excluded: Vec::new(),
        }
    }

    /// Leave `path` (a file, or a directory and everything in it) out of
    /// [`DocumentStore::list`]. Used for the config file and lock directory.
    pub fn exclude(mut self, path: impl Into<PathBuf>) -> Self {
        self.excluded.push(path.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn temp_path(path: &Path) -> PathBuf {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());
        path.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4().simple()))
    }
}

/// Writes `content` to `temp`, stamping it with a modification time strictly
/// after `previous` even on filesystems with coarse timestamp granularity.
fn write_stamped(temp: &Path, content: &str, previous: Option<SystemTime>) -> std::io::Result<SystemTime> {
    use std::io::Write;

    let mut file = std::fs::File::create(temp)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()?;

    let Some(previous) = previous else {
        return file.metadata()?.modified();
    };

    for step in [Duration::from_millis(1), Duration::from_secs(1), Duration::from_secs(2)] {
        let candidate = SystemTime::now().max(previous + step);
        file.set_modified(candidate)?;
        let observed = file.metadata()?.modified()?;
        if observed > previous {
            return Ok(observed);
        }
    }
    file.metadata()?.modified()
}

#[async_trait::async_trait]
impl DocumentStore for FileDocumentStore {
    async fn read(&self, name: &DocumentName) -> Result<StoredDocument> {
        let path = name.resolve(&self.root);
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CoordinationError::NotFound(name.to_string()))
            }
            Err(e) => return Err(CoordinationError::io(format!("open {name}"), e)),
        };

        let metadata = file
            .metadata()
            .await
            .map_err(|e| CoordinationError::io(format!("stat {name}"), e))?;
        if metadata.is_dir() {
            return Err(CoordinationError::NotFound(name.to_string()));
        }
        let stamp = DocumentStamp::from_metadata(&metadata)
            .map_err(|e| CoordinationError::io(format!("stat {name}"), e))?;

        let mut content = String::with_capacity(metadata.len() as usize);
        file.read_to_string(&mut content)
            .await
            .map_err(|e| CoordinationError::io(format!("read {name}"), e))?;

        Ok(StoredDocument { content, stamp })
    }

    async fn stamp(&self, name: &DocumentName) -> Result<Option<DocumentStamp>> {
        match tokio::fs::metadata(name.resolve(&self.root)).await {
            Ok(metadata) if metadata.is_file() => DocumentStamp::from_metadata(&metadata)
                .map(Some)
                .map_err(|e| CoordinationError::io(format!("stat {name}"), e)),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CoordinationError::io(format!("stat {name}"), e)),
        }
    }

    async fn write(&self, name: &DocumentName, content: &str) -> Result<DocumentStamp> {
        let path = name.resolve(&self.root);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CoordinationError::io(format!("create parent of {name}"), e))?;
        }

        let previous = self.stamp(name).await?.map(|stamp| stamp.modified);
        let temp = Self::temp_path(&path);
        let body = content.to_string();
        let temp_for_write = temp.clone();

        let written = tokio::task::spawn_blocking(move || write_stamped(&temp_for_write, &body, previous))
            .await
            .map_err(|e| CoordinationError::io(format!("write {name}"), std::io::Error::other(e)))?;

        let modified = match written {
            Ok(modified) => modified,
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(CoordinationError::io(format!("write {name}"), e));
            }
        };

        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(CoordinationError::io(format!("rename into {name}"), e));
        }

        debug!(document = %name, bytes = content.len(), "Document written");
        Ok(DocumentStamp {
            modified,
            len: content.len() as u64,
        })
    }

    async fn exists(&self, name: &DocumentName) -> bool {
        matches!(self.stamp(name).await, Ok(Some(_)))
    }

    async fn list(&self) -> Result<Vec<DocumentName>> {
        let mut names = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(CoordinationError::io(format!("list {}", dir.display()), e)),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| CoordinationError::io(format!("list {}", dir.display()), e))?
            {
                let file_name = entry.file_name();
                let file_name = file_name.to_string_lossy();
                // Hidden entries hold temp files and coordination state.
                if file_name.starts_with('.') {
                    continue;
                }
                let path = entry.path();
                if self.excluded.iter().any(|excluded| *excluded == path) {
                    continue;
                }

                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| CoordinationError::io(format!("list {}", dir.display()), e))?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() {
                    if let Ok(relative) = path.strip_prefix(&self.root) {
                        let relative = relative.to_string_lossy();
                        if let Ok(name) = DocumentName::parse(&relative) {
                            names.push(name);
                        }
                    }
                }
            }
        }

        names.sort();
        Ok(names)
    }
}
