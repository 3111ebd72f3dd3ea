//! Error types at the engine's seams.
//!
//! `Conflict` is not a failure: it signals that another actor already
//! advanced the job, and every caller treats it as a logged no-op. `anyhow`
//! stays internal transport for backend failures; the enums here are what
//! crosses the library boundary.

use thiserror::Error;

use crate::job::JobStatus;

/// Failures from the job store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The job's current status was not in the caller's `from` set.
    ///
    /// Expected under concurrency; the caller lost the race and must
    /// perform no side effect.
    #[error("status conflict: another actor already advanced this job")]
    Conflict,

    /// The referenced job does not exist.
    #[error("job not found")]
    NotFound,

    /// Storage backend failed (timeout, connection, serialization).
    #[error("store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Failures from the work queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Queue backend failed (unavailable, throttled, connection).
    #[error("queue backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Failures surfaced by the submission coordinator.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("job not found")]
    NotFound,

    /// The requested operation is not allowed in the job's current status.
    #[error("job is not eligible in status {status:?}")]
    InvalidState { status: JobStatus },

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl From<StoreError> for SubmitError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => SubmitError::NotFound,
            other => SubmitError::Store(other),
        }
    }
}
