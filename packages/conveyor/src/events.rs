//! Job lifecycle events and counters.
//!
//! The engine emits facts about the lifecycle through [`EventSink`]; where
//! they are shipped (metrics backend, log pipeline) is the host's concern.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Counter names emitted alongside lifecycle events.
pub mod counters {
    pub const JOBS_CREATED: &str = "jobs_created";
    pub const JOBS_CREATED_FAILED: &str = "jobs_created_failed";
    pub const JOBS_DEDUPLICATED: &str = "jobs_deduplicated";
    pub const JOBS_PROCESSED: &str = "jobs_processed";
    pub const JOBS_PROCESSED_FAILED: &str = "jobs_processed_failed";
    pub const JOBS_FINALIZED: &str = "jobs_finalized";
}

/// Facts about the job lifecycle, not commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobEvent {
    /// A new record was written and its work message enqueued.
    Submitted {
        job_id: Uuid,
        job_type: String,
        trace_id: String,
    },

    /// A submission collapsed onto an existing record via its idempotency key.
    Deduplicated {
        job_id: Uuid,
        idempotency_key: String,
    },

    /// Enqueue failed after the record was written; the record was moved to
    /// `Failed` so no orphaned `Pending` survives.
    SubmitCompensated { job_id: Uuid, error: String },

    /// A worker won the claim for a delivery.
    Claimed {
        job_id: Uuid,
        job_type: String,
        worker_id: String,
        attempt: i32,
    },

    /// Handler success recorded.
    Succeeded {
        job_id: Uuid,
        job_type: String,
        duration_ms: u64,
    },

    /// Handler failure recorded; the message was left to queue-level redrive.
    Failed {
        job_id: Uuid,
        job_type: String,
        error: String,
        will_redrive: bool,
    },

    /// The dead-letter finalizer wrote the terminal failed status.
    Finalized { job_id: Uuid, error: String },

    /// A live message referenced a job the store does not know.
    OrphanedMessage { job_id: Uuid },

    /// A message's payload hash no longer matches the stored record.
    PayloadDrift { job_id: Uuid },
}

/// Destination for lifecycle events and counters.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &JobEvent);

    fn counter(&self, name: &'static str, delta: f64);
}

/// Default sink: events and counters go to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &JobEvent) {
        tracing::debug!(?event, "job lifecycle event");
    }

    fn counter(&self, name: &'static str, delta: f64) {
        tracing::trace!(counter = name, delta, "counter");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_submitted_serializes() {
        let event = JobEvent::Submitted {
            job_id: Uuid::new_v4(),
            job_type: "process_document".to_string(),
            trace_id: "trace-1".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("Submitted"));
        assert!(json.contains("process_document"));
    }

    #[test]
    fn event_failed_carries_redrive_flag() {
        let event = JobEvent::Failed {
            job_id: Uuid::new_v4(),
            job_type: "x".to_string(),
            error: "boom".to_string(),
            will_redrive: true,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("will_redrive"));
        assert!(json.contains("boom"));
    }

    #[test]
    fn events_round_trip_serialize() {
        let events = vec![
            JobEvent::Deduplicated {
                job_id: Uuid::new_v4(),
                idempotency_key: "k1".to_string(),
            },
            JobEvent::SubmitCompensated {
                job_id: Uuid::new_v4(),
                error: "enqueue failed".to_string(),
            },
            JobEvent::Claimed {
                job_id: Uuid::new_v4(),
                job_type: "t".to_string(),
                worker_id: "worker-1".to_string(),
                attempt: 1,
            },
            JobEvent::Finalized {
                job_id: Uuid::new_v4(),
                error: "redrive exhausted".to_string(),
            },
            JobEvent::OrphanedMessage {
                job_id: Uuid::new_v4(),
            },
            JobEvent::PayloadDrift {
                job_id: Uuid::new_v4(),
            },
        ];
        for event in events {
            let json = serde_json::to_string(&event).unwrap();
            let _: JobEvent = serde_json::from_str(&json).unwrap();
        }
    }
}
