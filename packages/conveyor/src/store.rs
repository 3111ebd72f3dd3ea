//! Job store contract.
//!
//! The store is the single arbiter of job state: every mutator goes through
//! [`JobStore::compare_and_transition`], and no component may overwrite
//! `status` unconditionally. Holding a queue lease is necessary but not
//! sufficient to mutate a job.
//!
//! # Implementer Notes
//!
//! - `create_if_absent` must be atomic with respect to the idempotency-key
//!   uniqueness constraint (`ON CONFLICT DO NOTHING` or equivalent).
//! - `compare_and_transition` must be a single conditional write; callers
//!   distinguish losing a race ([`StoreError::Conflict`]) from a missing
//!   record ([`StoreError::NotFound`]).
//! - All writes are single-record; no multi-record transactions are needed.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::job::{JobRecord, JobStatus};

/// Field updates applied atomically with a status transition.
///
/// Expressed as data rather than a closure so a SQL backend can fold the
/// whole transition into one conditional `UPDATE`.
#[derive(Debug, Clone, Default)]
pub struct TransitionUpdate {
    /// Increment `attempts`; set only by the worker at claim time.
    pub increment_attempts: bool,
    /// Terminal result payload (success transitions).
    pub result: Option<serde_json::Value>,
    /// Diagnostic error detail (failure transitions).
    pub error: Option<String>,
}

impl TransitionUpdate {
    /// A bare status change.
    pub fn none() -> Self {
        Self::default()
    }

    /// The worker's claim update: one attempt per delivery.
    pub fn claim() -> Self {
        Self {
            increment_attempts: true,
            ..Self::default()
        }
    }

    pub fn with_result(result: serde_json::Value) -> Self {
        Self {
            result: Some(result),
            ..Self::default()
        }
    }

    pub fn with_error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Durable keyed storage for job records with an idempotency-key uniqueness
/// constraint and atomic conditional updates.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Store a new record unless one with the same idempotency key already
    /// exists. Returns the stored record and whether it is new; an existing
    /// key returns the existing record with `false` rather than erroring.
    /// This is the dedup contract the submission coordinator relies on.
    ///
    /// Records without an idempotency key are always stored as new.
    async fn create_if_absent(&self, record: JobRecord) -> Result<(JobRecord, bool), StoreError>;

    /// Fetch a record by id.
    async fn get(&self, job_id: Uuid) -> Result<JobRecord, StoreError>;

    /// Fetch the non-expired record bound to an idempotency key, if any.
    async fn get_by_idempotency_key(&self, key: &str) -> Result<Option<JobRecord>, StoreError>;

    /// Transition `job_id` to `to` iff its current status is in `from`,
    /// applying `update` and advancing `updated_at` in the same write.
    ///
    /// Fails with [`StoreError::Conflict`] when the guard does not hold;
    /// callers must treat that as "another actor already resolved this job"
    /// and no-op rather than retry.
    async fn compare_and_transition(
        &self,
        job_id: Uuid,
        from: &[JobStatus],
        to: JobStatus,
        update: TransitionUpdate,
    ) -> Result<JobRecord, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_update_increments_attempts_only() {
        let update = TransitionUpdate::claim();
        assert!(update.increment_attempts);
        assert!(update.result.is_none());
        assert!(update.error.is_none());
    }

    #[test]
    fn result_and_error_updates_do_not_touch_attempts() {
        assert!(!TransitionUpdate::with_result(serde_json::json!({})).increment_attempts);
        assert!(!TransitionUpdate::with_error("boom").increment_attempts);
    }
}
