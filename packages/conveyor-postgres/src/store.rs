//! PostgreSQL-backed job store.
//!
//! `create_if_absent` rides the partial unique index on `idempotency_key`
//! (`ON CONFLICT DO NOTHING` + fallback select), and
//! `compare_and_transition` is a single conditional `UPDATE .. WHERE status =
//! ANY($from) RETURNING`, so both contract operations stay atomic without
//! multi-statement transactions.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use conveyor::{JobPriority, JobRecord, JobStatus, JobStore, StoreError, TransitionUpdate};

const JOB_COLUMNS: &str = "job_id, idempotency_key, status, job_type, priority, params, metadata, \
                           attempts, trace_id, payload_hash, result, error, \
                           created_at, updated_at, expires_at";

/// Row image of a job record; statuses and priorities travel as text.
#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    job_id: Uuid,
    idempotency_key: Option<String>,
    status: String,
    job_type: String,
    priority: String,
    params: serde_json::Value,
    metadata: Option<serde_json::Value>,
    attempts: i32,
    trace_id: String,
    payload_hash: String,
    result: Option<serde_json::Value>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl JobRow {
    fn into_record(self) -> Result<JobRecord, StoreError> {
        let status = JobStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Backend(anyhow!("unknown status in row: {}", self.status)))?;
        let priority = JobPriority::parse(&self.priority).ok_or_else(|| {
            StoreError::Backend(anyhow!("unknown priority in row: {}", self.priority))
        })?;

        Ok(JobRecord {
            job_id: self.job_id,
            idempotency_key: self.idempotency_key,
            status,
            job_type: self.job_type,
            priority,
            params: self.params,
            metadata: self.metadata,
            attempts: self.attempts,
            trace_id: self.trace_id,
            payload_hash: self.payload_hash,
            result: self.result,
            error: self.error,
            created_at: self.created_at,
            updated_at: self.updated_at,
            expires_at: self.expires_at,
        })
    }
}

/// Job store over a `jobs` table (see `migrations/`).
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, job_id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;

        row.map(JobRow::into_record).transpose()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn create_if_absent(&self, record: JobRecord) -> Result<(JobRecord, bool), StoreError> {
        let inserted = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            INSERT INTO jobs (
                job_id, idempotency_key, status, job_type, priority, params, metadata,
                attempts, trace_id, payload_hash, result, error,
                created_at, updated_at, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (idempotency_key) WHERE idempotency_key IS NOT NULL DO NOTHING
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(record.job_id)
        .bind(&record.idempotency_key)
        .bind(record.status.as_str())
        .bind(&record.job_type)
        .bind(record.priority.as_str())
        .bind(&record.params)
        .bind(&record.metadata)
        .bind(record.attempts)
        .bind(&record.trace_id)
        .bind(&record.payload_hash)
        .bind(&record.result)
        .bind(&record.error)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.expires_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;

        if let Some(row) = inserted {
            return Ok((row.into_record()?, true));
        }

        // Insert conflicted, so a record already holds this key.
        let key = record
            .idempotency_key
            .as_deref()
            .ok_or_else(|| StoreError::Backend(anyhow!("insert without key returned no row")))?;
        let existing = self
            .get_by_idempotency_key_any(key)
            .await?
            .ok_or_else(|| StoreError::Backend(anyhow!("conflicting record vanished")))?;

        Ok((existing, false))
    }

    async fn get(&self, job_id: Uuid) -> Result<JobRecord, StoreError> {
        self.fetch(job_id).await?.ok_or(StoreError::NotFound)
    }

    async fn get_by_idempotency_key(&self, key: &str) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE idempotency_key = $1 AND expires_at > NOW()
            LIMIT 1
            "#
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;

        row.map(JobRow::into_record).transpose()
    }

    async fn compare_and_transition(
        &self,
        job_id: Uuid,
        from: &[JobStatus],
        to: JobStatus,
        update: TransitionUpdate,
    ) -> Result<JobRecord, StoreError> {
        let from_strings: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let attempt_delta: i32 = if update.increment_attempts { 1 } else { 0 };

        let updated = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE jobs
            SET status = $2,
                attempts = attempts + $3,
                result = COALESCE($4, result),
                error = COALESCE($5, error),
                updated_at = NOW()
            WHERE job_id = $1 AND status = ANY($6)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(to.as_str())
        .bind(attempt_delta)
        .bind(&update.result)
        .bind(&update.error)
        .bind(&from_strings)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;

        match updated {
            Some(row) => row.into_record(),
            // Disambiguate: a present row lost the guard, an absent row is gone.
            None => match self.fetch(job_id).await? {
                Some(_) => Err(StoreError::Conflict),
                None => Err(StoreError::NotFound),
            },
        }
    }
}

impl PostgresJobStore {
    /// Key lookup without the expiry filter, used to resolve an insert
    /// conflict against whatever row actually holds the unique index slot.
    async fn get_by_idempotency_key_any(&self, key: &str) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE idempotency_key = $1 LIMIT 1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;

        row.map(JobRow::into_record).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> JobRow {
        JobRow {
            job_id: Uuid::new_v4(),
            idempotency_key: Some("k1".to_string()),
            status: "PENDING".to_string(),
            job_type: "process_document".to_string(),
            priority: "normal".to_string(),
            params: serde_json::json!({"a": 1}),
            metadata: None,
            attempts: 0,
            trace_id: "t".to_string(),
            payload_hash: "h".to_string(),
            result: None,
            error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            expires_at: Utc::now(),
        }
    }

    #[test]
    fn row_maps_to_record() {
        let record = row().into_record().unwrap();
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.priority, JobPriority::Normal);
        assert_eq!(record.idempotency_key.as_deref(), Some("k1"));
    }

    #[test]
    fn row_with_unknown_status_is_a_backend_error() {
        let mut bad = row();
        bad.status = "LIMBO".to_string();
        assert!(matches!(
            bad.into_record(),
            Err(StoreError::Backend(_))
        ));
    }

    #[test]
    fn row_with_unknown_priority_is_a_backend_error() {
        let mut bad = row();
        bad.priority = "urgent".to_string();
        assert!(matches!(bad.into_record(), Err(StoreError::Backend(_))));
    }
}
