use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the coordination core.
///
/// Anchor misses and lock timeouts are routine under concurrency: callers are
/// expected to re-read the document and retry, not to abort.
#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("document not found: {0}")]
    NotFound(String),

    #[error("invalid document name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("empty anchor supplied for {document}")]
    EmptyAnchor { document: String },

    #[error("anchor not found in {document}")]
    AnchorNotFound { document: String },

    #[error("anchor occurs {occurrences} times in {document}, expected exactly one")]
    AnchorAmbiguous { document: String, occurrences: usize },

    #[error("timed out after {waited:?} waiting for lock on {document} (held by {holder})")]
    LockTimeout {
        document: String,
        holder: String,
        waited: Duration,
    },

    #[error("{holder} already holds the lock on {document}")]
    SelfDeadlock { document: String, holder: String },

    #[error("lease on {document} held by {holder} expired or was reclaimed before the write")]
    LeaseLost { document: String, holder: String },

    #[error("I/O error on {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoordinationError>;

impl CoordinationError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        CoordinationError::Io {
            context: context.into(),
            source,
        }
    }

    /// True when the precondition of an edit no longer holds and the caller
    /// should re-read before trying again.
    pub fn is_edit_conflict(&self) -> bool {
        matches!(
            self,
            CoordinationError::AnchorNotFound { .. } | CoordinationError::AnchorAmbiguous { .. }
        )
    }

    /// Transient conditions a caller may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoordinationError::AnchorNotFound { .. }
            | CoordinationError::AnchorAmbiguous { .. }
            | CoordinationError::LockTimeout { .. }
            | CoordinationError::LeaseLost { .. } => true,
            CoordinationError::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::PermissionDenied
                    | std::io::ErrorKind::Other
            ),
            _ => false,
        }
    }

    /// Short machine-readable label used in rejection events and metrics.
    pub fn reason_code(&self) -> &'static str {
        match self {
            CoordinationError::NotFound(_) => "not_found",
            CoordinationError::InvalidName { .. } => "invalid_name",
            CoordinationError::EmptyAnchor { .. } => "empty_anchor",
            CoordinationError::AnchorNotFound { .. } => "anchor_not_found",
            CoordinationError::AnchorAmbiguous { .. } => "anchor_ambiguous",
            CoordinationError::LockTimeout { .. } => "lock_timeout",
            CoordinationError::SelfDeadlock { .. } => "self_deadlock",
            CoordinationError::LeaseLost { .. } => "lease_lost",
            CoordinationError::Io { .. } => "io_error",
            CoordinationError::Config(_) => "config_error",
            CoordinationError::Serialization(_) => "serialization_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_classification() {
        let missing = CoordinationError::AnchorNotFound {
            document: "plan.md".to_string(),
        };
        let ambiguous = CoordinationError::AnchorAmbiguous {
            document: "plan.md".to_string(),
            occurrences: 2,
        };
        assert!(missing.is_edit_conflict());
        assert!(ambiguous.is_edit_conflict());
        assert!(missing.is_retryable());

        let timeout = CoordinationError::LockTimeout {
            document: "plan.md".to_string(),
            holder: "agent-b".to_string(),
            waited: Duration::from_millis(50),
        };
        assert!(!timeout.is_edit_conflict());
        assert!(timeout.is_retryable());
    }

    #[test]
    fn test_io_retryability_depends_on_kind() {
        let busy = CoordinationError::io(
            "write plan.md",
            std::io::Error::new(std::io::ErrorKind::Interrupted, "interrupted"),
        );
        let missing = CoordinationError::io(
            "write plan.md",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(busy.is_retryable());
        assert!(!missing.is_retryable());
        assert_eq!(busy.reason_code(), "io_error");
    }

    #[test]
    fn test_display_mentions_occurrences() {
        let err = CoordinationError::AnchorAmbiguous {
            document: "notes.md".to_string(),
            occurrences: 3,
        };
        assert_eq!(
            err.to_string(),
            "anchor occurs 3 times in notes.md, expected exactly one"
        );
    }
}
