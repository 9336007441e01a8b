// Mission Relay - file-based coordination for cooperating agents
// This exposes the core components for testing and integration

pub mod agents;
pub mod bus;
pub mod cache;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod editor;
pub mod error;
pub mod fs;
pub mod guard;
pub mod locks;
pub mod observability;
pub mod phase;
pub mod priority;
pub mod retry;
pub mod shutdown;
pub mod telemetry;

// Re-export key types for easy access
pub use agents::{AgentProfile, AgentRegistry};
pub use bus::{ChangeRegion, EventKind, EventPayload, Notification, NotificationBus, NotificationEvent};
pub use cache::{CachedDocument, ChangeKind, ContentCache, DocumentChange};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::MissionRelayConfig;
pub use coordinator::{MissionCoordinator, MissionStatus};
pub use editor::{AtomicEditor, CreateOutcome, EditOutcome, EditRequest, SignalDirection, SIGNALS_HEADING};
pub use error::{CoordinationError, Result};
pub use fs::{DocumentName, DocumentStamp, DocumentStore, FileDocumentStore};
pub use guard::MissionGuard;
pub use locks::{LeaseRecord, LockHandle, LockManager, Reclamation};
pub use observability::{CoordinationMetrics, MetricsSnapshot, OperationTimer};
pub use phase::{Phase, PhaseController, PhaseStatus, PhaseThresholds};
pub use priority::Priority;
pub use retry::RetryPolicy;
pub use shutdown::ShutdownCoordinator;
pub use telemetry::{create_coordination_span, generate_correlation_id, init_telemetry};
