//! Work queue contract: at-least-once delivery with visibility leases and a
//! max-delivery-count redrive policy.
//!
//! The queue message is a disposable pointer to the job record; it owns no
//! job state. A delivery hides the message for the visibility lease; deleting
//! resolves it, and letting the lease lapse makes it redeliverable. That
//! expiry is the engine's sole cancellation mechanism. Implementations route
//! messages whose delivery count exceeds the configured maximum onto a
//! companion dead-letter queue exposing this same trait.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;
use crate::job::JobRecord;

/// Wire schema of a work (and dead-letter) message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkMessage {
    pub job_id: Uuid,
    pub trace_id: String,
    pub payload_hash: String,
}

impl WorkMessage {
    /// The pointer message for a stored record.
    pub fn for_job(job: &JobRecord) -> Self {
        Self {
            job_id: job.job_id,
            trace_id: job.trace_id.clone(),
            payload_hash: job.payload_hash.clone(),
        }
    }
}

/// Opaque token identifying one delivery's lease. Valid only while that
/// lease is live; a stale receipt makes `delete` a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One leased delivery of a message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: WorkMessage,
    pub receipt: ReceiptHandle,
    /// How many times this message has been delivered, this one included.
    pub delivery_count: i32,
}

/// At-least-once delivery channel with per-message visibility leases.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueue a message, visible immediately.
    async fn send(&self, message: &WorkMessage) -> Result<(), QueueError>;

    /// Long-poll for up to `max_messages` deliveries, waiting at most `wait`.
    /// An empty result on timeout is not an error. Each returned delivery
    /// starts a visibility lease; the message stays hidden until the lease
    /// lapses or the delivery is deleted.
    async fn receive(&self, max_messages: usize, wait: Duration)
        -> Result<Vec<Delivery>, QueueError>;

    /// Resolve a delivery, removing the message. Idempotent: a stale or
    /// unknown receipt is a logged no-op, so racing a lease expiry is safe.
    async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), QueueError>;
}
