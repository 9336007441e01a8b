//! Atomic, uniquely-anchored document edits.
//!
//! An edit names an anchor copied verbatim from a recent read. It is applied
//! only when the anchor occurs exactly once in the document's current
//! content; zero or several occurrences reject the edit without touching the
//! document. Concurrent editors therefore detect each other: once one edit
//! rewrites the anchor text, the other observes `AnchorNotFound`.

use crate::bus::{ChangeRegion, Notification, NotificationBus};
use crate::cache::ContentCache;
use crate::error::{CoordinationError, Result};
use crate::fs::{DocumentName, DocumentStamp, DocumentStore};
use crate::locks::{LockHandle, LockManager, Reclamation};
use crate::observability::{CoordinationMetrics, OperationTimer};
use crate::phase::PhaseController;
use crate::retry::RetryPolicy;
use crate::telemetry::{create_coordination_span, generate_correlation_id};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn, Instrument};

/// Heading of the reserved section that carries directed agent messages.
pub const SIGNALS_HEADING: &str = "## Signals";

/// A single search-and-replace edit as submitted by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditRequest {
    pub document: String,
    pub search: String,
    pub replace: String,
    pub holder: String,
}

impl EditRequest {
    pub fn new(
        document: impl Into<String>,
        search: impl Into<String>,
        replace: impl Into<String>,
        holder: impl Into<String>,
    ) -> Self {
        Self {
            document: document.into(),
            search: search.into(),
            replace: replace.into(),
            holder: holder.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditOutcome {
    pub document: DocumentName,
    pub content: String,
    pub stamp: DocumentStamp,
    /// Sequence number of the published change event.
    pub event_sequence: u64,
    pub reclaimed: Option<Reclamation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOutcome {
    pub document: DocumentName,
    pub content: String,
    pub created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalDirection {
    To,
    From,
}

impl fmt::Display for SignalDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalDirection::To => write!(f, "To"),
            SignalDirection::From => write!(f, "From"),
        }
    }
}

/// Formats one line of the signals section.
pub fn format_signal_line(direction: SignalDirection, agent: &str, message: &str) -> String {
    let flattened: String = message
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    format!("- {direction} {}: {flattened}", agent.trim())
}

/// Number of possibly-overlapping occurrences of `needle` in `haystack`.
pub fn count_occurrences(haystack: &str, needle: &str) -> usize {
    let Some(first) = needle.chars().next() else {
        return 0;
    };
    let step = first.len_utf8();
    let mut count = 0;
    let mut start = 0;
    while let Some(offset) = haystack[start..].find(needle) {
        count += 1;
        start += offset + step;
    }
    count
}

/// Replace the sole occurrence of `anchor`, or explain why it cannot be done.
pub fn replace_unique(document: &str, content: &str, anchor: &str, replacement: &str) -> Result<String> {
    if anchor.is_empty() {
        return Err(CoordinationError::EmptyAnchor {
            document: document.to_string(),
        });
    }
    match count_occurrences(content, anchor) {
        0 => Err(CoordinationError::AnchorNotFound {
            document: document.to_string(),
        }),
        1 => {
            let position = content.find(anchor).unwrap_or_default();
            let mut updated = String::with_capacity(content.len() - anchor.len() + replacement.len());
            updated.push_str(&content[..position]);
            updated.push_str(replacement);
            updated.push_str(&content[position + anchor.len()..]);
            Ok(updated)
        }
        occurrences => Err(CoordinationError::AnchorAmbiguous {
            document: document.to_string(),
            occurrences,
        }),
    }
}

struct Mutation {
    content: String,
    region: ChangeRegion,
}

pub struct AtomicEditor {
    store: Arc<dyn DocumentStore>,
    locks: Arc<LockManager>,
    cache: Arc<ContentCache>,
    bus: Arc<NotificationBus>,
    phase: Arc<PhaseController>,
    io_retry: RetryPolicy,
    excerpt_chars: usize,
    metrics: Arc<CoordinationMetrics>,
}

impl fmt::Debug for AtomicEditor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicEditor")
            .field("io_retry", &self.io_retry)
            .field("excerpt_chars", &self.excerpt_chars)
            .finish()
    }
}

impl AtomicEditor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        locks: Arc<LockManager>,
        cache: Arc<ContentCache>,
        bus: Arc<NotificationBus>,
        phase: Arc<PhaseController>,
        io_retry: RetryPolicy,
        excerpt_chars: usize,
        metrics: Arc<CoordinationMetrics>,
    ) -> Self {
        Self {
            store,
            locks,
            cache,
            bus,
            phase,
            io_retry,
            excerpt_chars,
            metrics,
        }
    }

    /// Replace the single occurrence of `search` with `replace`.
    pub async fn apply(&self, document: &str, search: &str, replace: &str, holder: &str) -> Result<EditOutcome> {
        let name = DocumentName::parse(document)?;
        let excerpt_chars = self.excerpt_chars;
        self.edit("apply_edit", name, holder, |name, current| {
            let content = replace_unique(name.as_str(), current, search, replace)?;
            Ok(Mutation {
                content,
                region: ChangeRegion {
                    holder: holder.to_string(),
                    before: excerpt(search, excerpt_chars),
                    after: excerpt(replace, excerpt_chars),
                },
            })
        })
        .await
    }

    pub async fn submit(&self, request: &EditRequest) -> Result<EditOutcome> {
        self.apply(&request.document, &request.search, &request.replace, &request.holder)
            .await
    }

    /// Insert `text` immediately after the single occurrence of `marker`.
    pub async fn insert_after(&self, document: &str, marker: &str, text: &str, holder: &str) -> Result<EditOutcome> {
        let name = DocumentName::parse(document)?;
        let excerpt_chars = self.excerpt_chars;
        self.edit("insert_after", name, holder, |name, current| {
            let content = replace_unique(name.as_str(), current, marker, &format!("{marker}{text}"))?;
            Ok(Mutation {
                content,
                region: ChangeRegion {
                    holder: holder.to_string(),
                    before: excerpt(marker, excerpt_chars),
                    after: excerpt(&format!("{marker}{text}"), excerpt_chars),
                },
            })
        })
        .await
    }

    /// Add a line to the document's signals section and notify the addressee.
    pub async fn signal(
        &self,
        document: &str,
        holder: &str,
        direction: SignalDirection,
        agent: &str,
        message: &str,
    ) -> Result<EditOutcome> {
        let line = format_signal_line(direction, agent, message);
        let outcome = self
            .insert_after(document, SIGNALS_HEADING, &format!("\n{line}"), holder)
            .await?;

        let notification = match direction {
            SignalDirection::To => Notification::signal(agent, holder, message),
            SignalDirection::From => Notification::signal(outcome.document.as_str(), agent, message),
        };
        self.bus.publish(notification);
        Ok(outcome)
    }

    /// Create `document` with `template` unless it already exists, in which
    /// case the existing content is returned untouched.
    pub async fn create(&self, document: &str, template: &str, holder: &str) -> Result<CreateOutcome> {
        let name = DocumentName::parse(document)?;
        let lock = self.lock(&name, holder).await?;

        let result = match self.cache.read_fresh(&name).await {
            Ok(existing) => Ok(CreateOutcome {
                document: name.clone(),
                content: existing.content.clone(),
                created: false,
            }),
            Err(CoordinationError::NotFound(_)) => match self.write(&lock, template.to_string()).await {
                Ok(_) => Ok(CreateOutcome {
                    document: name.clone(),
                    content: template.to_string(),
                    created: true,
                }),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        self.unlock(&lock).await;

        let outcome = result?;
        if outcome.created {
            info!(document = %name, holder = %holder, "Document created");
            self.bus.publish(Notification::content_changed(
                name.as_str(),
                ChangeRegion {
                    holder: holder.to_string(),
                    before: String::new(),
                    after: excerpt(template, self.excerpt_chars),
                },
            ));
            self.metrics.record_edit_applied();
            self.phase.recompute();
        }
        Ok(outcome)
    }

    async fn edit<F>(&self, operation: &str, name: DocumentName, holder: &str, mutate: F) -> Result<EditOutcome>
    where
        F: FnOnce(&DocumentName, &str) -> Result<Mutation>,
    {
        let correlation_id = generate_correlation_id();
        let span = create_coordination_span(operation, Some(holder), Some(name.as_str()), Some(&correlation_id));

        async move {
            let timer = OperationTimer::new(operation);
            let result = self.edit_inner(&name, holder, mutate).await;
            timer.finish();

            match result {
                Ok(outcome) => {
                    self.metrics.record_edit_applied();
                    info!(document = %name, holder = %holder, sequence = outcome.event_sequence, "Edit applied");
                    self.phase.recompute();
                    Ok(outcome)
                }
                Err(e) => {
                    self.metrics.record_edit_rejected();
                    info!(document = %name, holder = %holder, reason = e.reason_code(), "Edit rejected");
                    self.bus.publish(Notification::edit_rejected(
                        name.as_str(),
                        holder,
                        e.reason_code(),
                        e.to_string(),
                    ));
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn edit_inner<F>(&self, name: &DocumentName, holder: &str, mutate: F) -> Result<EditOutcome>
    where
        F: FnOnce(&DocumentName, &str) -> Result<Mutation>,
    {
        let lock = self.lock(name, holder).await?;
        let lease = &lock;

        let written = async move {
            let current = self.cache.read_fresh(name).await?;
            let mutation = mutate(name, &current.content)?;
            let stamp = self.write(lease, mutation.content.clone()).await?;
            Ok::<_, CoordinationError>((mutation, stamp))
        }
        .await;
        self.unlock(&lock).await;

        let (mutation, stamp) = written?;
        let event_sequence = self
            .bus
            .publish(Notification::content_changed(name.as_str(), mutation.region));

        Ok(EditOutcome {
            document: name.clone(),
            content: mutation.content,
            stamp,
            event_sequence,
            reclaimed: lock.reclaimed().cloned(),
        })
    }

    async fn lock(&self, name: &DocumentName, holder: &str) -> Result<LockHandle> {
        let lock = self.locks.acquire_default(name, holder).await?;
        if let Some(reclamation) = lock.reclaimed() {
            self.bus.publish(Notification::lock_reclaimed(
                name.as_str(),
                &reclamation.previous_holder,
                &reclamation.reclaimed_by,
            ));
        }
        Ok(lock)
    }

    async fn unlock(&self, lock: &LockHandle) {
        if let Err(e) = self.locks.release(lock).await {
            warn!(document = %lock.document(), error = %e, "Failed to release lock, it will expire at its deadline");
        }
    }

    /// Write with transient I/O retries, then update the cache in place.
    /// Every attempt first checks that `lock` is still the live lease.
    async fn write(&self, lock: &LockHandle, content: String) -> Result<DocumentStamp> {
        let name = lock.document();
        let store = &self.store;
        let locks = &self.locks;
        let metrics = &self.metrics;
        let body = content.as_str();

        let stamp = self
            .io_retry
            .execute(
                move |attempt| async move {
                    if attempt > 0 {
                        metrics.record_io_retry();
                    }
                    locks.verify(lock).await?;
                    store.write(name, body).await
                },
                |e| matches!(e, CoordinationError::Io { .. }),
            )
            .await?;

        self.cache.write_through(name, content, stamp);
        Ok(stamp)
    }
}

/// Truncates `text` to `limit` characters for event payloads.
fn excerpt(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}
