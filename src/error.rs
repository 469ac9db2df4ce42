//! Persistence error taxonomy and store error translation.

use crate::interfaces::StoreError;

/// Result type for coordinator operations.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Errors surfaced to callers of the bulk mutation coordinator.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Failed to {operation} doc id: {id} in table {table}")]
    OperationFailed {
        operation: &'static str,
        table: String,
        id: String,
    },

    /// One or more items of a bulk write failed. Holds one line per failing
    /// item, formatted `el <index>: <error>[ - <reason>]`.
    #[error("{0}")]
    BulkFailed(String),

    #[error("Should be impossible: {0}")]
    Impossible(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Translate a store failure into a persistence error.
///
/// Classification uses the CouchDB error code first, then the HTTP status.
/// The message always keeps the store's code so callers can match on it.
pub fn parse_error(err: StoreError) -> PersistenceError {
    match &err {
        StoreError::Request { status, error, .. } => {
            classify(error, *status, err.to_string())
        }
        StoreError::Transport(_) | StoreError::Serialization(_) | StoreError::Closed => {
            PersistenceError::Internal(err.to_string())
        }
    }
}

/// Translate a bare error code, as found in bulk and fetch rows.
pub fn parse_error_code(code: &str, reason: Option<&str>) -> PersistenceError {
    let message = match reason {
        Some(reason) => format!("{code} - {reason}"),
        None => code.to_string(),
    };
    classify(code, None, message)
}

fn classify(code: &str, status: Option<u16>, message: String) -> PersistenceError {
    match (code, status) {
        ("conflict" | "file_exists", _) | (_, Some(409 | 412)) => {
            PersistenceError::Conflict(message)
        }
        ("not_found", _) | (_, Some(404)) => PersistenceError::NotFound(message),
        ("unauthorized" | "forbidden", _) | (_, Some(401 | 403)) => {
            PersistenceError::Unauthorized(message)
        }
        _ => PersistenceError::Internal(message),
    }
}
