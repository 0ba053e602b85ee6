use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::DatabaseId;

/// Outcome taxonomy shared by every catalog and table-manager operation.
///
/// Relocation is part of the result type: callers match on `Moved`,
/// `Shutdown` and `Unreachable` and re-resolve instead of unwinding.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordError {
    #[error("node {node} unreachable: {reason}")]
    Unreachable { node: DatabaseId, reason: String },

    #[error("instance has moved{}", moved_suffix(.location))]
    Moved { location: Option<DatabaseId> },

    #[error("instance has been shut down")]
    Shutdown,

    #[error("migration in progress")]
    MigrationInProgress,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("inconsistent state: {0}")]
    InconsistentState(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

fn moved_suffix(location: &Option<DatabaseId>) -> String {
    match location {
        Some(location) => format!(" to {location}"),
        None => String::new(),
    }
}

impl CoordError {
    pub fn unreachable(node: &DatabaseId, reason: impl ToString) -> Self {
        CoordError::Unreachable {
            node: node.clone(),
            reason: reason.to_string(),
        }
    }

    /// The callee is gone or relocated; cached references must be dropped.
    pub fn is_relocation(&self) -> bool {
        matches!(
            self,
            CoordError::Moved { .. } | CoordError::Shutdown | CoordError::Unreachable { .. }
        )
    }

    /// Transport and migration conditions; data-consistency errors never retry.
    pub fn is_retryable(&self) -> bool {
        self.is_relocation() || matches!(self, CoordError::MigrationInProgress)
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, CoordError::Unreachable { .. })
    }
}

impl From<anyhow::Error> for CoordError {
    fn from(err: anyhow::Error) -> Self {
        CoordError::Storage(format!("{err:#}"))
    }
}

pub type CoordResult<T> = std::result::Result<T, CoordError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moved_message_names_destination() {
        let err = CoordError::Moved {
            location: Some(DatabaseId::new("10.0.0.2:7100", "db")),
        };
        assert_eq!(err.to_string(), "instance has moved to 10.0.0.2:7100/db");
        let err = CoordError::Moved { location: None };
        assert_eq!(err.to_string(), "instance has moved");
    }

    #[test]
    fn consistency_errors_are_not_retryable() {
        assert!(CoordError::MigrationInProgress.is_retryable());
        assert!(CoordError::Shutdown.is_retryable());
        assert!(!CoordError::InconsistentState("x".into()).is_retryable());
        assert!(!CoordError::NotFound("t".into()).is_retryable());
    }
}
