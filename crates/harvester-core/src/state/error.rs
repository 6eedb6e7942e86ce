//! Persistence error type.

use thiserror::Error;

/// Failure of a state-store operation. Any write failure is fatal to the job:
/// once a flush is lost, resume can no longer trust the store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("encode/decode JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("create state directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown {kind} state {value:?} in database")]
    UnknownState { kind: &'static str, value: String },

    #[error("column {column} out of range: {value}")]
    OutOfRange { column: &'static str, value: i64 },

    #[error("job {0} not found")]
    JobNotFound(String),

    #[error("write buffer disabled after failed flush: {0}")]
    Poisoned(String),
}
