//! Dead-letter finalizer: the only writer of `FailedFinal`.
//!
//! Consumes messages the queue routed to its dead-letter channel after
//! exhausting the redrive budget and pins the corresponding job to its
//! terminal failed status. The dead-letter message itself is resolved
//! unconditionally; it is never retried or re-driven.

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{QueueError, StoreError};
use crate::events::{counters, EventSink, JobEvent, TracingSink};
use crate::job::JobStatus;
use crate::queue::{Delivery, WorkQueue};
use crate::store::{JobStore, TransitionUpdate};

/// Configuration for the dead-letter finalizer.
#[derive(Debug, Clone)]
pub struct FinalizerConfig {
    pub max_messages: usize,
    pub wait_time: std::time::Duration,
    pub error_pause: std::time::Duration,
}

impl Default for FinalizerConfig {
    fn default() -> Self {
        Self {
            max_messages: 10,
            wait_time: std::time::Duration::from_secs(20),
            error_pause: std::time::Duration::from_secs(5),
        }
    }
}

/// Consumes the dead-letter queue and transitions exhausted jobs to
/// `FailedFinal` with diagnostic detail.
pub struct DeadLetterFinalizer {
    store: Arc<dyn JobStore>,
    dead_letters: Arc<dyn WorkQueue>,
    events: Arc<dyn EventSink>,
    config: FinalizerConfig,
}

impl DeadLetterFinalizer {
    pub fn new(store: Arc<dyn JobStore>, dead_letters: Arc<dyn WorkQueue>) -> Self {
        Self {
            store,
            dead_letters,
            events: Arc::new(TracingSink),
            config: FinalizerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: FinalizerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Run until the token is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!("dead-letter finalizer starting");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.poll_once() => result,
            };

            if let Err(e) = received {
                error!(error = %e, "failed to receive dead-letter messages");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.error_pause) => {}
                }
            }
        }

        info!("dead-letter finalizer stopped");
        Ok(())
    }

    /// Drive a single receive-finalize cycle; returns how many dead-letter
    /// messages were handled.
    pub async fn poll_once(&self) -> Result<usize, QueueError> {
        let deliveries = self
            .dead_letters
            .receive(self.config.max_messages, self.config.wait_time)
            .await?;

        let mut handled = 0;
        for delivery in deliveries {
            self.finalize(delivery).await;
            handled += 1;
        }
        Ok(handled)
    }

    async fn finalize(&self, delivery: Delivery) {
        let job_id = delivery.message.job_id;
        let error = format!(
            "job failed after {} deliveries; redrive exhausted",
            delivery.delivery_count.max(1)
        );

        // Unconditional terminal writer: wins from any non-terminal status,
        // irrespective of a racing worker's view.
        match self
            .store
            .compare_and_transition(
                job_id,
                &[JobStatus::Pending, JobStatus::Processing, JobStatus::Failed],
                JobStatus::FailedFinal,
                TransitionUpdate::with_error(error.clone()),
            )
            .await
        {
            Ok(job) => {
                warn!(
                    job_id = %job_id,
                    job_type = %job.job_type,
                    attempts = job.attempts,
                    trace_id = %job.trace_id,
                    "job finalized after redrive exhaustion"
                );
                self.events.emit(&JobEvent::Finalized { job_id, error });
                self.events.counter(counters::JOBS_FINALIZED, 1.0);
            }
            Err(StoreError::Conflict) => {
                debug!(job_id = %job_id, "job already terminal; nothing to finalize");
            }
            Err(StoreError::NotFound) => {
                warn!(job_id = %job_id, "dead-letter message references unknown job");
                self.events.emit(&JobEvent::OrphanedMessage { job_id });
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "failed to finalize job");
            }
        }

        // Resolve unconditionally; a dead-letter message is never re-driven.
        if let Err(e) = self.dead_letters.delete(&delivery.receipt).await {
            warn!(job_id = %job_id, error = %e, "failed to delete dead-letter message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = FinalizerConfig::default();
        assert_eq!(config.max_messages, 10);
        assert_eq!(config.wait_time, std::time::Duration::from_secs(20));
    }
}
