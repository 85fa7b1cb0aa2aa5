//! Error types for route-progress
//!
//! Two layers:
//! - [`StoreError`] - what the storage backend reports (SQLite, locking, deadlines)
//! - [`ProgressError`] - what callers of the service see; every variant maps to a
//!   stable `code()` and HTTP status so clients can drive their messaging

use thiserror::Error;

/// Client-facing error taxonomy
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProgressError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Authentication required: {0}")]
    Unauthorized(String),

    #[error("Access denied: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("You must be within {required_radius_m}m of {checkpoint_name} (currently {distance_m:.0}m away)")]
    OutOfRange {
        checkpoint_id: String,
        checkpoint_name: String,
        required_radius_m: f64,
        distance_m: f64,
    },

    #[error("Checkpoint already completed: {checkpoint_id}")]
    AlreadyCompleted { checkpoint_id: String },

    #[error("Too many requests, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Storage unavailable: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProgressError {
    /// Stable machine-readable code for clients
    pub fn code(&self) -> &'static str {
        match self {
            ProgressError::Validation(_) => "validation",
            ProgressError::Unauthorized(_) => "unauthorized",
            ProgressError::Forbidden(_) => "forbidden",
            ProgressError::NotFound(_) => "not_found",
            ProgressError::OutOfRange { .. } => "out_of_range",
            ProgressError::AlreadyCompleted { .. } => "already_completed",
            ProgressError::RateLimited { .. } => "rate_limited",
            ProgressError::Storage(_) => "storage_unavailable",
            ProgressError::Internal(_) => "internal",
        }
    }

    /// Client errors are never worth retrying as-is
    pub fn is_client_error(&self) -> bool {
        !matches!(self, ProgressError::Storage(_) | ProgressError::Internal(_))
    }
}

/// Errors raised by a [`crate::store::ProgressStore`] backend
#[derive(Error, Debug)]
pub enum StoreError {
    /// UNIQUE(player, route, checkpoint) rejected the insert
    #[error("Progress already recorded for checkpoint {checkpoint_id}")]
    DuplicateCompletion { checkpoint_id: String },

    /// The (player, route) lineage already reached Completed
    #[error("Route {route_id} already completed by {player_id}; checkpoint {checkpoint_id} needs a new session")]
    LineageCompleted {
        player_id: String,
        route_id: String,
        checkpoint_id: String,
    },

    #[error("Database busy: {0}")]
    Busy(String),

    #[error("Storage deadline exceeded: {0}")]
    Timeout(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Invalid state transition: {0}")]
    Transition(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Whether the same transaction may succeed if attempted again
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Busy(_) | StoreError::Timeout(_) | StoreError::Connection(_)
        )
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if matches!(
                    err.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                StoreError::Busy(e.to_string())
            }
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::CannotOpen =>
            {
                StoreError::Connection(e.to_string())
            }
            _ => StoreError::Database(e.to_string()),
        }
    }
}

/// True when the error is a UNIQUE or PRIMARY KEY violation
pub(crate) fn is_unique_violation(e: &rusqlite::Error) -> bool {
    match e {
        rusqlite::Error::SqliteFailure(err, _) => {
            err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        }
        _ => false,
    }
}

impl From<StoreError> for ProgressError {
    fn from(e: StoreError) -> Self {
        if !matches!(
            e,
            StoreError::DuplicateCompletion { .. } | StoreError::LineageCompleted { .. }
        ) {
            // Clients only see a generic message
            tracing::error!(error = %e, "Progress store error");
        }
        match e {
            StoreError::DuplicateCompletion { checkpoint_id } => {
                ProgressError::AlreadyCompleted { checkpoint_id }
            }
            StoreError::LineageCompleted { checkpoint_id, .. } => {
                ProgressError::AlreadyCompleted { checkpoint_id }
            }
            StoreError::Busy(_) | StoreError::Timeout(_) | StoreError::Connection(_) => {
                ProgressError::Storage("progress store temporarily unavailable".into())
            }
            _ => ProgressError::Internal("progress store failure".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Busy("locked".into()).is_transient());
        assert!(StoreError::Timeout("5000ms".into()).is_transient());
        assert!(!StoreError::Database("syntax".into()).is_transient());
        assert!(!StoreError::DuplicateCompletion { checkpoint_id: "a".into() }.is_transient());
    }

    #[test]
    fn test_store_error_does_not_leak_detail() {
        let err: ProgressError = StoreError::Database("no such table: sessions".into()).into();
        assert_eq!(err.code(), "internal");
        assert!(!err.to_string().contains("sessions"));

        let err: ProgressError = StoreError::Busy("database is locked".into()).into();
        assert_eq!(err.code(), "storage_unavailable");
        assert!(!err.to_string().contains("locked"));
    }

    #[test]
    fn test_duplicate_maps_to_already_completed() {
        let err: ProgressError = StoreError::DuplicateCompletion {
            checkpoint_id: "zytglogge".into(),
        }
        .into();
        assert_eq!(
            err,
            ProgressError::AlreadyCompleted { checkpoint_id: "zytglogge".into() }
        );
        assert!(err.is_client_error());
    }

    #[test]
    fn test_completed_lineage_reports_checkpoint() {
        let err: ProgressError = StoreError::LineageCompleted {
            player_id: "p1".into(),
            route_id: "bern-classic".into(),
            checkpoint_id: "barengraben".into(),
        }
        .into();
        assert_eq!(
            err,
            ProgressError::AlreadyCompleted { checkpoint_id: "barengraben".into() }
        );
    }
}
