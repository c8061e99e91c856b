//! Persistent job ledger.
//!
//! Raw SQL with rusqlite, no ORM. The database file is shared by the scheduler
//! daemon and every agent process, so all cross-process coordination goes
//! through the conditional updates in [`JobStore`].

pub mod init;
pub mod jobs;
pub mod schemas;


pub use init::{init_db, migrate, open_db};
pub use jobs::JobStore;
pub use schemas::{JobStatus, MeetingJob};

/// Errors surfaced by [`JobStore`]. Callers branch on the variant.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A job for this meeting URL already exists, whatever its status.
    #[error("meeting already scheduled: {url}")]
    Duplicate { url: String },

    /// The job was not in `scheduled` state when the claim ran.
    #[error("job {id} is not scheduled (already claimed or finished)")]
    ClaimConflict { id: i64 },

    #[error("job {id} not found")]
    NotFound { id: i64 },

    #[error("invalid job status in database: {0}")]
    InvalidStatus(String),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The blocking task running a store call panicked or was cancelled.
    #[error("store task failed: {0}")]
    Task(String),
}
