//! In-memory store, queue, and event sink.
//!
//! Available with the `testing` feature (and always under `cfg(test)`).
//! These honor the same contracts as the durable implementations: atomic
//! create-if-absent, conditional transitions, visibility leases, and
//! max-delivery-count redrive onto a linked dead-letter queue. Leases run on
//! tokio time, so paused-clock tests can drive expiry deterministically.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use crate::error::{QueueError, StoreError};
use crate::events::{EventSink, JobEvent};
use crate::job::{is_valid_transition, JobRecord, JobStatus};
use crate::queue::{Delivery, ReceiptHandle, WorkMessage, WorkQueue};
use crate::store::{JobStore, TransitionUpdate};

// ============================================================================
// Store
// ============================================================================

/// In-memory job store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: Mutex<HashMap<Uuid, JobRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record directly, bypassing the dedup contract.
    /// Test setup only.
    pub fn put(&self, record: JobRecord) {
        self.jobs.lock().unwrap().insert(record.job_id, record);
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_if_absent(&self, record: JobRecord) -> Result<(JobRecord, bool), StoreError> {
        let mut jobs = self.jobs.lock().unwrap();

        if let Some(key) = &record.idempotency_key {
            let now = Utc::now();
            let existing = jobs
                .values()
                .find(|job| job.idempotency_key.as_deref() == Some(key) && !job.is_expired(now));
            if let Some(existing) = existing {
                return Ok((existing.clone(), false));
            }
        }

        jobs.insert(record.job_id, record.clone());
        Ok((record, true))
    }

    async fn get(&self, job_id: Uuid) -> Result<JobRecord, StoreError> {
        self.jobs
            .lock()
            .unwrap()
            .get(&job_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn get_by_idempotency_key(&self, key: &str) -> Result<Option<JobRecord>, StoreError> {
        let now = Utc::now();
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .values()
            .find(|job| job.idempotency_key.as_deref() == Some(key) && !job.is_expired(now))
            .cloned())
    }

    async fn compare_and_transition(
        &self,
        job_id: Uuid,
        from: &[JobStatus],
        to: JobStatus,
        update: TransitionUpdate,
    ) -> Result<JobRecord, StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound)?;

        if !from.contains(&job.status) {
            return Err(StoreError::Conflict);
        }
        debug_assert!(
            is_valid_transition(job.status, to),
            "transition {:?} -> {:?} is not an edge of the state machine",
            job.status,
            to
        );

        job.status = to;
        if update.increment_attempts {
            job.attempts += 1;
        }
        if let Some(result) = update.result {
            job.result = Some(result);
        }
        if let Some(error) = update.error {
            job.error = Some(error);
        }
        job.updated_at = Utc::now();

        Ok(job.clone())
    }
}

// ============================================================================
// Queue
// ============================================================================

/// Tuning for [`MemoryQueue`].
#[derive(Debug, Clone)]
pub struct MemoryQueueConfig {
    /// How long a delivery hides its message.
    pub visibility_timeout: Duration,
    /// Deliveries allowed before a message is redriven to the dead-letter
    /// queue (when one is linked).
    pub max_delivery_count: i32,
}

impl Default for MemoryQueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(30),
            max_delivery_count: 5,
        }
    }
}

#[derive(Debug)]
struct QueuedMessage {
    message: WorkMessage,
    visible_at: tokio::time::Instant,
    delivery_count: i32,
    receipt: Option<ReceiptHandle>,
}

/// In-memory work queue with visibility leases and redrive.
#[derive(Debug)]
pub struct MemoryQueue {
    messages: Mutex<Vec<QueuedMessage>>,
    config: MemoryQueueConfig,
    dead_letters: Option<Arc<MemoryQueue>>,
}

const RECEIVE_TICK: Duration = Duration::from_millis(20);

impl MemoryQueue {
    /// A standalone queue with no dead-letter routing.
    pub fn new(config: MemoryQueueConfig) -> Arc<Self> {
        Arc::new(Self {
            messages: Mutex::new(Vec::new()),
            config,
            dead_letters: None,
        })
    }

    /// A work queue linked to a companion dead-letter queue: messages whose
    /// delivery count would exceed the maximum are moved there instead of
    /// being delivered. Returns `(work, dead_letter)`.
    pub fn with_redrive(config: MemoryQueueConfig) -> (Arc<Self>, Arc<Self>) {
        let dead_letters = Arc::new(Self {
            messages: Mutex::new(Vec::new()),
            config: MemoryQueueConfig {
                visibility_timeout: config.visibility_timeout,
                max_delivery_count: i32::MAX,
            },
            dead_letters: None,
        });
        let work = Arc::new(Self {
            messages: Mutex::new(Vec::new()),
            config,
            dead_letters: Some(Arc::clone(&dead_letters)),
        });
        (work, dead_letters)
    }

    /// Total messages held, leased ones included.
    pub fn len(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push_raw(&self, message: WorkMessage, delivery_count: i32) {
        self.messages.lock().unwrap().push(QueuedMessage {
            message,
            visible_at: tokio::time::Instant::now(),
            delivery_count,
            receipt: None,
        });
    }

    fn take_visible(&self, max: usize) -> Vec<Delivery> {
        let now = tokio::time::Instant::now();
        let mut redriven = Vec::new();
        let mut out = Vec::new();

        {
            let mut messages = self.messages.lock().unwrap();
            let mut i = 0;
            while i < messages.len() && out.len() < max {
                if messages[i].visible_at > now {
                    i += 1;
                    continue;
                }

                let next_count = messages[i].delivery_count + 1;
                if next_count > self.config.max_delivery_count {
                    redriven.push(messages.remove(i));
                    continue;
                }

                let slot = &mut messages[i];
                slot.delivery_count = next_count;
                slot.visible_at = now + self.config.visibility_timeout;
                let receipt = ReceiptHandle::new(Uuid::new_v4().to_string());
                slot.receipt = Some(receipt.clone());
                out.push(Delivery {
                    message: slot.message.clone(),
                    receipt,
                    delivery_count: next_count,
                });
                i += 1;
            }
        }

        for exhausted in redriven {
            match &self.dead_letters {
                Some(dlq) => dlq.push_raw(exhausted.message, exhausted.delivery_count),
                None => warn!(
                    job_id = %exhausted.message.job_id,
                    "redrive exhausted with no dead-letter queue; message dropped"
                ),
            }
        }

        out
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn send(&self, message: &WorkMessage) -> Result<(), QueueError> {
        self.push_raw(message.clone(), 0);
        Ok(())
    }

    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            let deliveries = self.take_visible(max_messages);
            if !deliveries.is_empty() {
                return Ok(deliveries);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(RECEIVE_TICK.min(deadline - now)).await;
        }
    }

    async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let mut messages = self.messages.lock().unwrap();
        let before = messages.len();
        messages.retain(|m| m.receipt.as_ref() != Some(receipt));

        if messages.len() == before {
            warn!(receipt = %receipt, "delete for stale or unknown receipt; ignoring");
        }
        Ok(())
    }
}

// ============================================================================
// Event sink
// ============================================================================

/// Records emitted events and counters for assertions.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<JobEvent>>,
    counters: Mutex<HashMap<&'static str, f64>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<JobEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn counter_total(&self, name: &str) -> f64 {
        self.counters.lock().unwrap().get(name).copied().unwrap_or(0.0)
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &JobEvent) {
        self.events.lock().unwrap().push(event.clone());
    }

    fn counter(&self, name: &'static str, delta: f64) {
        *self.counters.lock().unwrap().entry(name).or_insert(0.0) += delta;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobPriority;

    fn record() -> JobRecord {
        JobRecord::create(
            "transform_data",
            JobPriority::Normal,
            serde_json::json!({"rows": 100}),
            None,
            None,
            None,
        )
    }

    fn record_with_key(key: &str) -> JobRecord {
        JobRecord::create(
            "transform_data",
            JobPriority::Normal,
            serde_json::json!({"rows": 100}),
            None,
            Some(key.to_string()),
            None,
        )
    }

    fn message(job_id: Uuid) -> WorkMessage {
        WorkMessage {
            job_id,
            trace_id: "t".to_string(),
            payload_hash: "h".to_string(),
        }
    }

    #[tokio::test]
    async fn create_if_absent_dedups_on_key() {
        let store = MemoryStore::new();

        let (first, is_new) = store.create_if_absent(record_with_key("k1")).await.unwrap();
        assert!(is_new);

        let (second, is_new) = store.create_if_absent(record_with_key("k1")).await.unwrap();
        assert!(!is_new);
        assert_eq!(second.job_id, first.job_id);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn create_if_absent_ignores_expired_bindings() {
        let store = MemoryStore::new();

        let mut expired = record_with_key("k1");
        expired.expires_at = Utc::now() - chrono::Duration::hours(1);
        store.put(expired.clone());

        let (fresh, is_new) = store.create_if_absent(record_with_key("k1")).await.unwrap();
        assert!(is_new);
        assert_ne!(fresh.job_id, expired.job_id);
        assert!(store
            .get_by_idempotency_key("k1")
            .await
            .unwrap()
            .is_some_and(|j| j.job_id == fresh.job_id));
    }

    #[tokio::test]
    async fn jobs_without_key_never_dedup() {
        let store = MemoryStore::new();
        let (_, first_new) = store.create_if_absent(record()).await.unwrap();
        let (_, second_new) = store.create_if_absent(record()).await.unwrap();
        assert!(first_new && second_new);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn compare_and_transition_guards_status() {
        let store = MemoryStore::new();
        let (job, _) = store.create_if_absent(record()).await.unwrap();

        let claimed = store
            .compare_and_transition(
                job.job_id,
                &[JobStatus::Pending, JobStatus::Failed],
                JobStatus::Processing,
                TransitionUpdate::claim(),
            )
            .await
            .unwrap();
        assert_eq!(claimed.status, JobStatus::Processing);
        assert_eq!(claimed.attempts, 1);

        // Second claim loses.
        let err = store
            .compare_and_transition(
                job.job_id,
                &[JobStatus::Pending, JobStatus::Failed],
                JobStatus::Processing,
                TransitionUpdate::claim(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict));
    }

    #[tokio::test]
    async fn compare_and_transition_unknown_job_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .compare_and_transition(
                Uuid::new_v4(),
                &[JobStatus::Pending],
                JobStatus::Processing,
                TransitionUpdate::none(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn transition_updates_fields_and_timestamp() {
        let store = MemoryStore::new();
        let (job, _) = store.create_if_absent(record()).await.unwrap();
        let before = job.updated_at;

        store
            .compare_and_transition(
                job.job_id,
                &[JobStatus::Pending],
                JobStatus::Processing,
                TransitionUpdate::claim(),
            )
            .await
            .unwrap();
        let done = store
            .compare_and_transition(
                job.job_id,
                &[JobStatus::Processing],
                JobStatus::Succeeded,
                TransitionUpdate::with_result(serde_json::json!({"ok": true})),
            )
            .await
            .unwrap();

        assert_eq!(done.result, Some(serde_json::json!({"ok": true})));
        assert!(done.updated_at >= before);
    }

    #[tokio::test(start_paused = true)]
    async fn lease_hides_message_until_expiry() {
        let queue = MemoryQueue::new(MemoryQueueConfig {
            visibility_timeout: Duration::from_secs(5),
            max_delivery_count: 10,
        });
        queue.send(&message(Uuid::new_v4())).await.unwrap();

        let first = queue.receive(10, Duration::from_millis(50)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].delivery_count, 1);

        // Leased: nothing visible within the lease window.
        let empty = queue.receive(10, Duration::from_millis(50)).await.unwrap();
        assert!(empty.is_empty());

        // Past the lease the message comes back with a fresh receipt.
        tokio::time::sleep(Duration::from_secs(6)).await;
        let again = queue.receive(10, Duration::from_millis(50)).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].delivery_count, 2);
        assert_ne!(again[0].receipt, first[0].receipt);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_resolves_and_stale_receipt_is_noop() {
        let queue = MemoryQueue::new(MemoryQueueConfig::default());
        queue.send(&message(Uuid::new_v4())).await.unwrap();

        let delivery = queue
            .receive(10, Duration::from_millis(50))
            .await
            .unwrap()
            .remove(0);
        queue.delete(&delivery.receipt).await.unwrap();
        assert!(queue.is_empty());

        // Deleting again is harmless.
        queue.delete(&delivery.receipt).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_messages_move_to_dead_letters() {
        let (work, dlq) = MemoryQueue::with_redrive(MemoryQueueConfig {
            visibility_timeout: Duration::from_secs(1),
            max_delivery_count: 2,
        });
        work.send(&message(Uuid::new_v4())).await.unwrap();

        for expected in 1..=2 {
            let deliveries = work.receive(10, Duration::from_millis(50)).await.unwrap();
            assert_eq!(deliveries.len(), 1);
            assert_eq!(deliveries[0].delivery_count, expected);
            tokio::time::sleep(Duration::from_secs(2)).await;
        }

        // Third receive moves the message to the dead-letter queue.
        let empty = work.receive(10, Duration::from_millis(50)).await.unwrap();
        assert!(empty.is_empty());
        assert!(work.is_empty());
        assert_eq!(dlq.len(), 1);

        let dead = dlq.receive(10, Duration::from_millis(50)).await.unwrap();
        assert_eq!(dead.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn receive_respects_bounded_wait() {
        let queue = MemoryQueue::new(MemoryQueueConfig::default());
        let started = tokio::time::Instant::now();
        let empty = queue.receive(10, Duration::from_millis(200)).await.unwrap();
        assert!(empty.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn recording_sink_accumulates() {
        let sink = RecordingSink::new();
        sink.counter("jobs_created", 1.0);
        sink.counter("jobs_created", 1.0);
        sink.emit(&JobEvent::OrphanedMessage {
            job_id: Uuid::new_v4(),
        });

        assert_eq!(sink.counter_total("jobs_created"), 2.0);
        assert_eq!(sink.events().len(), 1);
    }
}
