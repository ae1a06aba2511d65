//! Error taxonomy shared by every component.
//!
//! Component APIs (store, memory, sessions, executions) return
//! `Result<T, BrainError>`. The named-operation layer converts failures into
//! terminal chunks; the monitoring API converts them into HTTP statuses.
//! Binary wiring code uses `anyhow` and folds into `BrainError::Other`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrainError {
    /// The addressed entity does not exist (missing key, unknown id).
    #[error("not found: {0}")]
    NotFound(String),

    /// On-disk data failed its checksum or violates an invariant.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Busy/locked/WAL-checkpoint contention. Retried with bounded backoff
    /// before it surfaces.
    #[error("transient storage error: {0}")]
    Transient(String),

    /// A value or output exceeds a configured cap. Not retried.
    #[error("resource limit exceeded: {0}")]
    Resource(String),

    /// A child process exited non-zero or produced nothing within budget.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// Wall-clock deadline passed.
    #[error("execution timed out: {0}")]
    Timeout(String),

    /// An explicit cancel request was observed.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Anything else. Logged and surfaced; never crashes the process.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, BrainError>;

impl BrainError {
    /// True for errors worth retrying inside one operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrainError::Transient(_))
    }
}

impl From<rusqlite::Error> for BrainError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::DatabaseBusy
                    || err.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                BrainError::Transient(e.to_string())
            }
            rusqlite::Error::QueryReturnedNoRows => BrainError::NotFound("no matching row".into()),
            _ => BrainError::Other(anyhow::Error::new(e)),
        }
    }
}

impl From<r2d2::Error> for BrainError {
    fn from(e: r2d2::Error) -> Self {
        // Pool exhaustion / checkout timeout behaves like lock contention.
        BrainError::Transient(e.to_string())
    }
}

impl From<std::io::Error> for BrainError {
    fn from(e: std::io::Error) -> Self {
        BrainError::Other(anyhow::Error::new(e))
    }
}

impl From<serde_json::Error> for BrainError {
    fn from(e: serde_json::Error) -> Self {
        BrainError::Integrity(format!("document decode: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_maps_to_transient() {
        let e = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        );
        assert!(BrainError::from(e).is_transient());
    }

    #[test]
    fn no_rows_maps_to_not_found() {
        let e = BrainError::from(rusqlite::Error::QueryReturnedNoRows);
        assert!(matches!(e, BrainError::NotFound(_)));
    }
}
