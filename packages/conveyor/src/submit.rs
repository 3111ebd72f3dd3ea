//! Submission coordinator: validate, dedup, persist, enqueue.
//!
//! The write order is record first, message second. If the enqueue fails the
//! coordinator compensates by moving the just-created record straight to
//! `Failed`: an orphaned `Pending` record with no in-flight message would be
//! a stuck job, and `Failed` is visible and retryable.

use std::sync::Arc;

use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::{StoreError, SubmitError};
use crate::events::{counters, EventSink, JobEvent, TracingSink};
use crate::job::{JobPriority, JobRecord, JobStatus, JobView};
use crate::queue::{WorkMessage, WorkQueue};
use crate::store::{JobStore, TransitionUpdate};

/// A client submission.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct SubmitRequest {
    pub job_type: String,

    #[builder(default)]
    pub priority: JobPriority,

    pub params: serde_json::Value,

    #[builder(default, setter(strip_option))]
    pub metadata: Option<serde_json::Value>,

    #[builder(default, setter(strip_option))]
    pub idempotency_key: Option<String>,

    #[builder(default, setter(strip_option))]
    pub trace_id: Option<String>,
}

/// Accepts job submissions, enforces idempotency against the store, and
/// enqueues work messages.
pub struct SubmissionCoordinator {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
    events: Arc<dyn EventSink>,
}

impl SubmissionCoordinator {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn WorkQueue>) -> Self {
        Self {
            store,
            queue,
            events: Arc::new(TracingSink),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Submit a job. Idempotent under client retries when the request
    /// carries an idempotency key: the same key returns the same job with no
    /// new side effect.
    pub async fn submit(&self, request: SubmitRequest) -> Result<JobView, SubmitError> {
        validate(&request)?;

        let record = JobRecord::create(
            request.job_type,
            request.priority,
            request.params,
            request.metadata,
            request.idempotency_key,
            request.trace_id,
        );
        let submitted_hash = record.payload_hash.clone();

        let (stored, is_new) = self.store.create_if_absent(record).await?;

        if !is_new {
            let key = stored.idempotency_key.clone().unwrap_or_default();
            info!(
                job_id = %stored.job_id,
                idempotency_key = %key,
                status = stored.status.as_str(),
                trace_id = %stored.trace_id,
                "submission collapsed onto existing job"
            );
            if stored.payload_hash != submitted_hash {
                warn!(
                    job_id = %stored.job_id,
                    "payload differs from the record bound to this idempotency key"
                );
                self.events
                    .emit(&JobEvent::PayloadDrift { job_id: stored.job_id });
            }
            self.events.emit(&JobEvent::Deduplicated {
                job_id: stored.job_id,
                idempotency_key: key,
            });
            self.events.counter(counters::JOBS_DEDUPLICATED, 1.0);
            return Ok(stored.view());
        }

        debug!(job_id = %stored.job_id, trace_id = %stored.trace_id, "job record created");

        let message = WorkMessage::for_job(&stored);
        if let Err(enqueue_err) = self.queue.send(&message).await {
            return self.compensate(stored, enqueue_err.to_string()).await;
        }

        info!(
            job_id = %stored.job_id,
            job_type = %stored.job_type,
            trace_id = %stored.trace_id,
            "job submitted and enqueued"
        );
        self.events.emit(&JobEvent::Submitted {
            job_id: stored.job_id,
            job_type: stored.job_type.clone(),
            trace_id: stored.trace_id.clone(),
        });
        self.events.counter(counters::JOBS_CREATED, 1.0);

        Ok(stored.view())
    }

    /// Fetch the current view of a job.
    pub async fn get(&self, job_id: Uuid) -> Result<JobView, SubmitError> {
        let record = self.store.get(job_id).await?;
        Ok(record.view())
    }

    /// Re-enqueue the work message for a stuck job.
    ///
    /// Eligible for jobs in `Pending` (written but never enqueued) or
    /// `Failed` with no live message. Mutates neither `status` nor
    /// `attempts`; produces exactly one new message.
    pub async fn retry(&self, job_id: Uuid) -> Result<JobView, SubmitError> {
        let record = self.store.get(job_id).await?;

        if !matches!(record.status, JobStatus::Pending | JobStatus::Failed) {
            return Err(SubmitError::InvalidState {
                status: record.status,
            });
        }

        self.queue.send(&WorkMessage::for_job(&record)).await?;
        info!(
            job_id = %record.job_id,
            status = record.status.as_str(),
            trace_id = %record.trace_id,
            "work message re-enqueued"
        );

        Ok(record.view())
    }

    /// The compensation pattern: the record exists but its message does not,
    /// so transition `Pending -> Failed` and hand the failed view back.
    async fn compensate(
        &self,
        stored: JobRecord,
        enqueue_err: String,
    ) -> Result<JobView, SubmitError> {
        warn!(
            job_id = %stored.job_id,
            trace_id = %stored.trace_id,
            error = %enqueue_err,
            "enqueue failed after record write; marking job failed"
        );
        self.events.counter(counters::JOBS_CREATED_FAILED, 1.0);

        let error = format!("enqueue failed: {}", enqueue_err);
        match self
            .store
            .compare_and_transition(
                stored.job_id,
                &[JobStatus::Pending],
                JobStatus::Failed,
                TransitionUpdate::with_error(error.clone()),
            )
            .await
        {
            Ok(failed) => {
                self.events.emit(&JobEvent::SubmitCompensated {
                    job_id: failed.job_id,
                    error,
                });
                Ok(failed.view())
            }
            // Another actor advanced the job in the meantime; its word wins.
            Err(StoreError::Conflict) => {
                debug!(job_id = %stored.job_id, "compensation lost a race; returning current view");
                let current = self.store.get(stored.job_id).await?;
                Ok(current.view())
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn validate(request: &SubmitRequest) -> Result<(), SubmitError> {
    if request.job_type.trim().is_empty() {
        return Err(SubmitError::InvalidRequest(
            "job_type must not be empty".to_string(),
        ));
    }

    let params_empty = match &request.params {
        serde_json::Value::Null => true,
        serde_json::Value::Object(map) => map.is_empty(),
        _ => false,
    };
    if params_empty {
        return Err(SubmitError::InvalidRequest(
            "params cannot be empty - at least one parameter is required".to_string(),
        ));
    }

    if matches!(&request.idempotency_key, Some(key) if key.trim().is_empty()) {
        return Err(SubmitError::InvalidRequest(
            "idempotency key must not be blank".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(params: serde_json::Value) -> SubmitRequest {
        SubmitRequest::builder()
            .job_type("process_document")
            .params(params)
            .build()
    }

    #[test]
    fn validate_rejects_empty_params() {
        let err = validate(&request(serde_json::json!({}))).unwrap_err();
        assert!(matches!(err, SubmitError::InvalidRequest(_)));

        let err = validate(&request(serde_json::Value::Null)).unwrap_err();
        assert!(matches!(err, SubmitError::InvalidRequest(_)));
    }

    #[test]
    fn validate_rejects_blank_job_type() {
        let mut req = request(serde_json::json!({"a": 1}));
        req.job_type = "  ".to_string();
        assert!(validate(&req).is_err());
    }

    #[test]
    fn validate_rejects_blank_idempotency_key() {
        let mut req = request(serde_json::json!({"a": 1}));
        req.idempotency_key = Some(String::new());
        assert!(validate(&req).is_err());
    }

    #[test]
    fn validate_accepts_non_object_params() {
        assert!(validate(&request(serde_json::json!([1, 2, 3]))).is_ok());
        assert!(validate(&request(serde_json::json!({"a": 1}))).is_ok());
    }

    #[test]
    fn request_builder_defaults() {
        let req = request(serde_json::json!({"a": 1}));
        assert_eq!(req.priority, JobPriority::Normal);
        assert!(req.idempotency_key.is_none());
        assert!(req.trace_id.is_none());
        assert!(req.metadata.is_none());
    }
}
