use serde::{Deserialize, Serialize};
use std::fmt;

/// Delivery priority for notifications.
/// Higher values drain first; priority never changes sequence numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Routine change notifications (0)
    #[default]
    Normal = 0,
    /// Phase changes, reclamations, overflow markers (1)
    Urgent = 1,
}

impl Priority {
    /// Every level, highest first
    pub const DESCENDING: [Priority; 2] = [Priority::Urgent, Priority::Normal];

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "urgent" | "high" => Some(Priority::Urgent),
            "normal" | "default" => Some(Priority::Normal),
            _ => None,
        }
    }

    pub fn value(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Priority::Urgent => "URGENT",
            Priority::Normal => "NORMAL",
        };
        write!(f, "{}", label)
    }
}
