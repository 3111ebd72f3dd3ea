//! Worker loop: claim deliveries, execute handlers, resolve messages.
//!
//! Retry strategy is dual-layer. A single delivery absorbs a few fast
//! in-process retries with exponential backoff; a persistently failing job
//! escalates through the slower queue-level redrive by leaving its message
//! unresolved, so the lease lapses and the queue's delivery counter advances
//! toward the dead-letter channel.
//!
//! Workers share no state. The store's conditional writes arbitrate every
//! transition, so concurrent workers racing on duplicate deliveries resolve
//! to exactly one winner; losers drop their message without side effects.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{QueueError, StoreError};
use crate::events::{counters, EventSink, JobEvent, TracingSink};
use crate::handler::{HandlerError, JobContext, SharedHandlerRegistry};
use crate::job::{JobRecord, JobStatus};
use crate::queue::{Delivery, ReceiptHandle, WorkQueue};
use crate::store::{JobStore, TransitionUpdate};

/// Configuration for the worker loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Worker ID for this instance.
    pub worker_id: String,
    /// Maximum deliveries to take per receive call.
    pub max_messages: usize,
    /// Long-poll bound; an empty receive after this wait is not an error.
    pub wait_time: Duration,
    /// In-process executions per delivery before giving up on it.
    pub local_retry_limit: u32,
    /// First backoff delay; doubles per retry.
    pub initial_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
    /// Pause after a receive error before polling again.
    pub error_pause: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            max_messages: 10,
            wait_time: Duration::from_secs(20),
            local_retry_limit: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            error_pause: Duration::from_secs(5),
        }
    }
}

impl WorkerConfig {
    /// Create a new config with a specific worker ID.
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    /// Delay before in-process retry `retry` (0-based): doubling from the
    /// base interval, capped at the ceiling.
    fn backoff_delay(&self, retry: u32) -> Duration {
        let exp = self
            .initial_backoff
            .as_secs_f64()
            * 2f64.powi(retry.min(31) as i32);
        Duration::from_secs_f64(exp.min(self.max_backoff.as_secs_f64()))
    }
}

/// Long-polls the work queue and drives claimed jobs through the handler.
pub struct WorkerLoop {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
    registry: SharedHandlerRegistry,
    events: Arc<dyn EventSink>,
    config: WorkerConfig,
}

impl WorkerLoop {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn WorkQueue>,
        registry: SharedHandlerRegistry,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            events: Arc::new(TracingSink),
            config: WorkerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Run until the token is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            max_messages = self.config.max_messages,
            "worker starting"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.poll_once() => result,
            };

            if let Err(e) = received {
                error!(error = %e, "failed to receive deliveries");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.error_pause) => {}
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "worker stopped");
        Ok(())
    }

    /// Run until a shutdown signal is received.
    ///
    /// Convenience method that listens for Ctrl+C.
    pub async fn run_until_shutdown(&self) -> Result<()> {
        let shutdown = CancellationToken::new();

        let signal_token = shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("received shutdown signal");
            signal_token.cancel();
        });

        self.run(shutdown).await
    }

    /// Drive a single receive-process cycle; returns how many deliveries
    /// were handled. Useful for embedding and deterministic tests.
    pub async fn poll_once(&self) -> Result<usize, QueueError> {
        let deliveries = self
            .queue
            .receive(self.config.max_messages, self.config.wait_time)
            .await?;

        if deliveries.is_empty() {
            return Ok(0);
        }

        debug!(count = deliveries.len(), "received deliveries");

        let mut handled = 0;
        for delivery in deliveries {
            self.process_delivery(delivery).await;
            handled += 1;
        }
        Ok(handled)
    }

    async fn process_delivery(&self, delivery: Delivery) {
        let job_id = delivery.message.job_id;

        // A live message whose job the store does not know means the store
        // and queue desynchronized; it must not be retried indefinitely.
        let job = match self.store.get(job_id).await {
            Ok(job) => job,
            Err(StoreError::NotFound) => {
                warn!(job_id = %job_id, "message references unknown job; dropping");
                self.events.emit(&JobEvent::OrphanedMessage { job_id });
                self.resolve(&delivery.receipt, job_id).await;
                return;
            }
            Err(e) => {
                // Leave the lease; redelivery retries once the store recovers.
                error!(job_id = %job_id, error = %e, "failed to load job for delivery");
                return;
            }
        };

        // Idempotency short-circuit: duplicate delivery of a finished job.
        if job.status.is_terminal() {
            info!(
                job_id = %job_id,
                status = job.status.as_str(),
                trace_id = %job.trace_id,
                "job already finished; dropping duplicate delivery"
            );
            self.resolve(&delivery.receipt, job_id).await;
            return;
        }

        if delivery.message.payload_hash != job.payload_hash {
            warn!(
                job_id = %job_id,
                "message payload hash differs from record; proceeding from the record"
            );
            self.events.emit(&JobEvent::PayloadDrift { job_id });
        }

        // Claim. The store guard, not the lease, is the arbiter: exactly one
        // concurrent claimant wins.
        let claimed = match self
            .store
            .compare_and_transition(
                job_id,
                &[JobStatus::Pending, JobStatus::Failed],
                JobStatus::Processing,
                TransitionUpdate::claim(),
            )
            .await
        {
            Ok(job) => job,
            Err(StoreError::Conflict) => {
                debug!(job_id = %job_id, "lost claim race; another worker owns this job");
                self.resolve(&delivery.receipt, job_id).await;
                return;
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "failed to claim job");
                return;
            }
        };

        info!(
            job_id = %job_id,
            job_type = %claimed.job_type,
            attempt = claimed.attempts,
            trace_id = %claimed.trace_id,
            worker_id = %self.config.worker_id,
            "processing job"
        );
        self.events.emit(&JobEvent::Claimed {
            job_id,
            job_type: claimed.job_type.clone(),
            worker_id: self.config.worker_id.clone(),
            attempt: claimed.attempts,
        });

        let started = tokio::time::Instant::now();
        match self.execute_with_backoff(&claimed).await {
            Ok(result) => {
                self.record_success(&claimed, result, started.elapsed(), &delivery.receipt)
                    .await;
            }
            Err(err) => {
                self.record_failure(&claimed, err).await;
                // No resolve: the lease lapses and queue-level redrive takes
                // over, eventually routing to the dead-letter channel.
            }
        }
    }

    /// Execute the handler, absorbing transient failures with exponential
    /// backoff within this delivery. Permanent failures stop immediately.
    async fn execute_with_backoff(&self, job: &JobRecord) -> Result<serde_json::Value, HandlerError> {
        let ctx = JobContext {
            job_id: job.job_id,
            trace_id: job.trace_id.clone(),
            attempt: job.attempts,
        };

        let mut executions = 0u32;
        loop {
            match self
                .registry
                .execute(&job.job_type, job.params.clone(), ctx.clone())
                .await
            {
                Ok(result) => return Ok(result),
                Err(err @ HandlerError::Permanent(_)) => {
                    warn!(
                        job_id = %job.job_id,
                        job_type = %job.job_type,
                        error = %err,
                        "permanent handler failure"
                    );
                    return Err(err);
                }
                Err(err @ HandlerError::Transient(_)) => {
                    executions += 1;
                    if executions >= self.config.local_retry_limit {
                        warn!(
                            job_id = %job.job_id,
                            executions,
                            error = %err,
                            "local retries exhausted for this delivery"
                        );
                        return Err(err);
                    }

                    let delay = self.config.backoff_delay(executions - 1);
                    info!(
                        job_id = %job.job_id,
                        execution = executions,
                        delay_ms = delay.as_millis() as u64,
                        "transient handler failure; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn record_success(
        &self,
        job: &JobRecord,
        result: serde_json::Value,
        elapsed: Duration,
        receipt: &ReceiptHandle,
    ) {
        match self
            .store
            .compare_and_transition(
                job.job_id,
                &[JobStatus::Processing],
                JobStatus::Succeeded,
                TransitionUpdate::with_result(result),
            )
            .await
        {
            Ok(_) => {
                info!(
                    job_id = %job.job_id,
                    job_type = %job.job_type,
                    duration_ms = elapsed.as_millis() as u64,
                    trace_id = %job.trace_id,
                    "job succeeded"
                );
                self.events.emit(&JobEvent::Succeeded {
                    job_id: job.job_id,
                    job_type: job.job_type.clone(),
                    duration_ms: elapsed.as_millis() as u64,
                });
                self.events.counter(counters::JOBS_PROCESSED, 1.0);
            }
            Err(StoreError::Conflict) => {
                // The finalizer beat us to a terminal write; its word stands.
                warn!(job_id = %job.job_id, "job advanced concurrently; success write dropped");
            }
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "failed to record success");
                return;
            }
        }
        self.resolve(receipt, job.job_id).await;
    }

    async fn record_failure(&self, job: &JobRecord, err: HandlerError) {
        let error = err.to_string();
        match self
            .store
            .compare_and_transition(
                job.job_id,
                &[JobStatus::Processing],
                JobStatus::Failed,
                TransitionUpdate::with_error(error.clone()),
            )
            .await
        {
            Ok(_) => {
                warn!(
                    job_id = %job.job_id,
                    job_type = %job.job_type,
                    error = %error,
                    trace_id = %job.trace_id,
                    "job failed; leaving message to queue-level redrive"
                );
                self.events.emit(&JobEvent::Failed {
                    job_id: job.job_id,
                    job_type: job.job_type.clone(),
                    error,
                    will_redrive: true,
                });
                self.events.counter(counters::JOBS_PROCESSED_FAILED, 1.0);
            }
            Err(StoreError::Conflict) => {
                warn!(job_id = %job.job_id, "job advanced concurrently; failure write dropped");
            }
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "failed to record failure");
            }
        }
    }

    async fn resolve(&self, receipt: &ReceiptHandle, job_id: Uuid) {
        if let Err(e) = self.queue.delete(receipt).await {
            warn!(job_id = %job_id, error = %e, "failed to delete message");
        }
    }
}
