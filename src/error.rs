//! Error types for rewards-engine

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RewardsError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown trigger type: {0}")]
    UnknownTrigger(String),

    #[error("Badge {badge_id} has malformed criteria: {reason}")]
    CriteriaEvaluation { badge_id: String, reason: String },

    #[error("Persistence error: {message}")]
    Persistence { transient: bool, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RewardsError {
    /// Wrap a SQLite error, classifying busy/locked databases as transient
    pub fn db(context: &str, err: rusqlite::Error) -> Self {
        let transient = matches!(
            err.sqlite_error_code(),
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
        );
        Self::Persistence {
            transient,
            message: format!("{}: {}", context, err),
        }
    }

    /// Whether a retry of the same unit of work can succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Persistence { transient: true, .. })
    }

    /// In-band error kind reported to callers, if this error has one
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::UnknownTrigger(_) => Some(ErrorKind::UnknownTrigger),
            Self::Validation(_) => Some(ErrorKind::ValidationError),
            Self::Persistence { .. } => Some(ErrorKind::TransientPersistenceError),
            _ => None,
        }
    }
}

/// Error modes surfaced in a trigger result instead of being raised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownTrigger,
    ValidationError,
    TransientPersistenceError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_is_transient() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        let wrapped = RewardsError::db("Insert failed", err);
        assert!(wrapped.is_transient());
        assert_eq!(wrapped.kind(), Some(ErrorKind::TransientPersistenceError));
    }

    #[test]
    fn test_constraint_is_not_transient() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            Some("UNIQUE constraint failed".into()),
        );
        assert!(!RewardsError::db("Insert failed", err).is_transient());
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            RewardsError::Validation("missing event_id".into()).kind(),
            Some(ErrorKind::ValidationError)
        );
        assert_eq!(RewardsError::Internal("x".into()).kind(), None);
    }
}
