//! PostgreSQL-backed work queue.
//!
//! Work and dead-letter channels share the `queue_messages` table. Receiving
//! first sweeps exhausted messages onto the dead-letter channel, then claims
//! visible rows with `FOR UPDATE SKIP LOCKED`, stamping each with a fresh
//! receipt and pushing `visible_at` out by the visibility lease. Long-poll is
//! emulated by ticking the claim query until the bounded wait elapses.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, warn};
use uuid::Uuid;

use conveyor::{Delivery, QueueError, ReceiptHandle, WorkMessage, WorkQueue};

const WORK_CHANNEL: &str = "work";
const DEAD_LETTER_CHANNEL: &str = "dead_letter";
const POLL_TICK: Duration = Duration::from_millis(250);

/// Queue policy the engine depends on.
#[derive(Debug, Clone)]
pub struct PostgresQueueConfig {
    /// Visibility lease; must exceed expected handler execution time.
    pub visibility_timeout: Duration,
    /// Deliveries before a message is redriven to the dead-letter channel.
    pub max_delivery_count: i32,
}

impl Default for PostgresQueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(60),
            max_delivery_count: 5,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    job_id: Uuid,
    trace_id: String,
    payload_hash: String,
    delivery_count: i32,
    receipt: Uuid,
}

/// One channel of the `queue_messages` table.
pub struct PostgresWorkQueue {
    pool: PgPool,
    channel: &'static str,
    config: PostgresQueueConfig,
    redrive_to: Option<&'static str>,
}

impl PostgresWorkQueue {
    /// The primary work channel, redriving exhausted messages to the
    /// dead-letter channel.
    pub fn work(pool: PgPool, config: PostgresQueueConfig) -> Self {
        Self {
            pool,
            channel: WORK_CHANNEL,
            config,
            redrive_to: Some(DEAD_LETTER_CHANNEL),
        }
    }

    /// The dead-letter channel, consumed by the finalizer. No further
    /// redrive.
    pub fn dead_letters(pool: PgPool, config: PostgresQueueConfig) -> Self {
        Self {
            pool,
            channel: DEAD_LETTER_CHANNEL,
            config,
            redrive_to: None,
        }
    }

    /// Move messages that spent their delivery budget onto the dead-letter
    /// channel, visible immediately.
    async fn sweep_exhausted(&self) -> Result<(), QueueError> {
        let Some(target) = self.redrive_to else {
            return Ok(());
        };

        let moved = sqlx::query(
            r#"
            UPDATE queue_messages
            SET channel = $1, visible_at = NOW(), receipt = NULL
            WHERE message_id IN (
                SELECT message_id
                FROM queue_messages
                WHERE channel = $2 AND visible_at <= NOW() AND delivery_count >= $3
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(target)
        .bind(self.channel)
        .bind(self.config.max_delivery_count)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(e.into()))?;

        if moved.rows_affected() > 0 {
            debug!(
                count = moved.rows_affected(),
                "redrove exhausted messages to dead-letter channel"
            );
        }
        Ok(())
    }

    async fn claim(&self, max_messages: usize) -> Result<Vec<Delivery>, QueueError> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            WITH next_messages AS (
                SELECT message_id
                FROM queue_messages
                WHERE channel = $1 AND visible_at <= NOW()
                ORDER BY enqueued_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE queue_messages
            SET visible_at = NOW() + ($3 || ' milliseconds')::INTERVAL,
                delivery_count = delivery_count + 1,
                receipt = gen_random_uuid()
            WHERE message_id IN (SELECT message_id FROM next_messages)
            RETURNING job_id, trace_id, payload_hash, delivery_count, receipt
            "#,
        )
        .bind(self.channel)
        .bind(max_messages as i64)
        .bind((self.config.visibility_timeout.as_millis() as i64).to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(e.into()))?;

        Ok(rows
            .into_iter()
            .map(|row| Delivery {
                message: WorkMessage {
                    job_id: row.job_id,
                    trace_id: row.trace_id,
                    payload_hash: row.payload_hash,
                },
                receipt: ReceiptHandle::new(row.receipt.to_string()),
                delivery_count: row.delivery_count,
            })
            .collect())
    }
}

#[async_trait]
impl WorkQueue for PostgresWorkQueue {
    async fn send(&self, message: &WorkMessage) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            INSERT INTO queue_messages (
                message_id, channel, job_id, trace_id, payload_hash,
                visible_at, delivery_count, enqueued_at
            )
            VALUES ($1, $2, $3, $4, $5, NOW(), 0, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(self.channel)
        .bind(message.job_id)
        .bind(&message.trace_id)
        .bind(&message.payload_hash)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(e.into()))?;

        Ok(())
    }

    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            self.sweep_exhausted().await?;

            let deliveries = self.claim(max_messages).await?;
            if !deliveries.is_empty() {
                return Ok(deliveries);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(POLL_TICK.min(deadline - now)).await;
        }
    }

    async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let Ok(receipt_id) = Uuid::parse_str(receipt.as_str()) else {
            warn!(receipt = %receipt, "malformed receipt; ignoring delete");
            return Ok(());
        };

        let deleted = sqlx::query("DELETE FROM queue_messages WHERE channel = $1 AND receipt = $2")
            .bind(self.channel)
            .bind(receipt_id)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.into()))?;

        if deleted.rows_affected() == 0 {
            warn!(receipt = %receipt, "delete for stale or unknown receipt; ignoring");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = PostgresQueueConfig::default();
        assert_eq!(config.visibility_timeout, Duration::from_secs(60));
        assert_eq!(config.max_delivery_count, 5);
    }

    #[test]
    fn channels_are_distinct() {
        assert_ne!(WORK_CHANNEL, DEAD_LETTER_CHANNEL);
    }
}
