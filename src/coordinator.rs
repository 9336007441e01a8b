//! Mission coordinator
//!
//! Wires the store, leases, cache, bus, phase controller and editor of one
//! mission root together and exposes the operations agents and the CLI use.

use crate::agents::AgentRegistry;
use crate::bus::{ChangeRegion, Notification, NotificationBus, NotificationEvent};
use crate::cache::{CachedDocument, ChangeKind, ContentCache, DocumentChange};
use crate::clock::{system_clock, SharedClock};
use crate::config::{MissionRelayConfig, CONFIG_FILE};
use crate::editor::{AtomicEditor, CreateOutcome, EditOutcome, EditRequest, SignalDirection};
use crate::error::{CoordinationError, Result};
use crate::fs::{DocumentName, DocumentStore, FileDocumentStore};
use crate::locks::LockManager;
use crate::observability::{CoordinationMetrics, MetricsSnapshot};
use crate::phase::{estimate_tokens, PhaseController, PhaseStatus};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Holder name attached to changes made outside the coordinator.
pub const EXTERNAL_HOLDER: &str = "external";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentSummary {
    pub name: String,
    pub bytes: u64,
    pub tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissionStatus {
    pub phase: PhaseStatus,
    pub documents: Vec<DocumentSummary>,
    pub consumers: Vec<String>,
    pub metrics: MetricsSnapshot,
}

pub struct MissionCoordinator {
    config: MissionRelayConfig,
    store: Arc<FileDocumentStore>,
    locks: Arc<LockManager>,
    cache: Arc<ContentCache>,
    bus: Arc<NotificationBus>,
    phase: Arc<PhaseController>,
    editor: AtomicEditor,
    agents: AgentRegistry,
    metrics: Arc<CoordinationMetrics>,
}

impl std::fmt::Debug for MissionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MissionCoordinator")
            .field("root", &self.config.mission.root)
            .field("lock_dir", &self.locks.lock_dir())
            .finish()
    }
}

impl MissionCoordinator {
    pub async fn open(config: MissionRelayConfig) -> Result<Self> {
        Self::with_clock(config, system_clock()).await
    }

    /// Build every component on `clock` and warm the cache from disk.
    pub async fn with_clock(config: MissionRelayConfig, clock: SharedClock) -> Result<Self> {
        config
            .validate()
            .map_err(|e| CoordinationError::Config(e.to_string()))?;

        let root = config.mission.root.clone();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| CoordinationError::io(format!("create mission root {}", root.display()), e))?;

        let metrics = Arc::new(CoordinationMetrics::new());
        let store = Arc::new(
            FileDocumentStore::new(&root)
                .exclude(root.join(CONFIG_FILE))
                .exclude(config.lock_dir()),
        );
        let dyn_store: Arc<dyn DocumentStore> = store.clone();

        let locks = Arc::new(LockManager::new(
            config.lock_dir(),
            clock.clone(),
            config.lock_retry_policy(),
            config.lock_timeout(),
            config.lock_max_wait(),
            metrics.clone(),
        ));
        let cache = Arc::new(ContentCache::new(
            dyn_store.clone(),
            config.cache_ttl(),
            config.cache.max_entries,
            clock.clone(),
            metrics.clone(),
        ));
        let bus = Arc::new(NotificationBus::new(
            config.coalesce_window(),
            config.notifications.queue_cap,
            clock.clone(),
            metrics.clone(),
        ));
        let phase = Arc::new(PhaseController::new(
            cache.clone(),
            bus.clone(),
            config.phase.capacity,
            config.phase_thresholds()?,
            config.phase.bytes_per_token,
            clock.clone(),
            metrics.clone(),
        )?);
        let editor = AtomicEditor::new(
            dyn_store,
            locks.clone(),
            cache.clone(),
            bus.clone(),
            phase.clone(),
            config.io_retry_policy(),
            config.editor.excerpt_chars,
            metrics.clone(),
        );

        let known = cache.reconcile().await?;
        let status = phase.recompute();
        info!(
            root = %config.mission.root.display(),
            documents = known.len(),
            usage = status.usage,
            phase = %status.phase,
            "Mission coordinator opened"
        );

        Ok(Self {
            config,
            store,
            locks,
            cache,
            bus,
            phase,
            editor,
            agents: AgentRegistry::new(clock),
            metrics,
        })
    }

    pub fn config(&self) -> &MissionRelayConfig {
        &self.config
    }

    pub fn store(&self) -> &FileDocumentStore {
        &self.store
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    pub fn phase(&self) -> &PhaseController {
        &self.phase
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    pub fn metrics(&self) -> &CoordinationMetrics {
        &self.metrics
    }

    /// Current content of a document, possibly served from cache.
    pub async fn read(&self, document: &str) -> Result<Arc<CachedDocument>> {
        let name = DocumentName::parse(document)?;
        self.cache.read(&name).await
    }

    /// Current content after a mandatory freshness check.
    pub async fn read_fresh(&self, document: &str) -> Result<Arc<CachedDocument>> {
        let name = DocumentName::parse(document)?;
        self.cache.read_fresh(&name).await
    }

    pub async fn list(&self) -> Result<Vec<DocumentName>> {
        self.store.list().await
    }

    pub async fn apply(&self, document: &str, search: &str, replace: &str, holder: &str) -> Result<EditOutcome> {
        self.agents.touch(holder);
        self.editor.apply(document, search, replace, holder).await
    }

    pub async fn submit(&self, request: &EditRequest) -> Result<EditOutcome> {
        self.agents.touch(&request.holder);
        self.editor.submit(request).await
    }

    pub async fn insert_after(&self, document: &str, marker: &str, text: &str, holder: &str) -> Result<EditOutcome> {
        self.agents.touch(holder);
        self.editor.insert_after(document, marker, text, holder).await
    }

    pub async fn create(&self, document: &str, template: &str, holder: &str) -> Result<CreateOutcome> {
        self.agents.touch(holder);
        self.editor.create(document, template, holder).await
    }

    pub async fn signal(
        &self,
        document: &str,
        holder: &str,
        direction: SignalDirection,
        agent: &str,
        message: &str,
    ) -> Result<EditOutcome> {
        self.agents.touch(holder);
        self.editor.signal(document, holder, direction, agent, message).await
    }

    pub fn subscribe(&self, consumer: &str) -> bool {
        self.bus.subscribe(consumer)
    }

    pub fn drain(&self, consumer: &str, max: usize) -> Vec<NotificationEvent> {
        self.bus.drain(consumer, max)
    }

    pub async fn wait_and_drain(&self, consumer: &str, max: usize, wait: Duration) -> Vec<NotificationEvent> {
        self.bus.wait_and_drain(consumer, max, wait).await
    }

    pub fn status(&self) -> MissionStatus {
        let bytes_per_token = self.config.phase.bytes_per_token;
        let documents = self
            .cache
            .document_sizes()
            .into_iter()
            .map(|(name, bytes)| DocumentSummary {
                name: name.to_string(),
                bytes,
                tokens: estimate_tokens(bytes, bytes_per_token),
            })
            .collect();

        MissionStatus {
            phase: self.phase.status(),
            documents,
            consumers: self.bus.consumers(),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Detect documents changed outside this coordinator, announce them and
    /// re-measure the phase.
    pub async fn refresh(&self) -> Result<Vec<DocumentChange>> {
        let changes = self.cache.reconcile().await?;
        for change in &changes {
            self.metrics.record_external_change();
            let after = match change.kind {
                ChangeKind::Created => "created",
                ChangeKind::Modified => "modified",
                ChangeKind::Removed => "removed",
            };
            self.bus.publish(Notification::content_changed(
                change.name.as_str(),
                ChangeRegion {
                    holder: EXTERNAL_HOLDER.to_string(),
                    before: String::new(),
                    after: after.to_string(),
                },
            ));
        }
        self.phase.recompute();
        Ok(changes)
    }

    /// Periodic refresh until `token` is cancelled.
    pub fn spawn_background(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run_background(token).await;
        })
    }

    async fn run_background(&self, token: CancellationToken) {
        let period = self.config.recompute_interval();
        info!(interval_ms = period.as_millis() as u64, "Starting mission refresh task");

        let mut tick = interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match self.refresh().await {
                        Ok(changes) if !changes.is_empty() => {
                            debug!(changes = changes.len(), "Refresh cycle found external changes");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Refresh cycle failed"),
                    }
                }
                _ = token.cancelled() => {
                    info!("Shutdown signal received, stopping mission refresh task");
                    break;
                }
            }
        }

        self.metrics.log_stats();
    }
}
