//! Persistent execution database.
//!
//! One JSON-lines file maps `job_id` to the latest [`JobRecord`] written for
//! it. Writes append; reads fold the file left-to-right with later records
//! superseding earlier ones. Advisory file locking (exclusive for writers,
//! shared for readers) keeps cooperating processes consistent, and a
//! size-triggered compaction rewrites the file in place via atomic rename.

pub mod models;
pub mod store;

pub use models::JobRecord;
pub use store::ExecutionDb;

/// Errors raised by the execution database.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("could not acquire {mode} lock on {path} within {seconds} s")]
    LockTimeout {
        mode: &'static str,
        path: String,
        seconds: u64,
    },

    #[error("home directory could not be determined")]
    NoHome,
}

/// Result type alias for database operations.
pub type Result<T> = std::result::Result<T, Error>;
