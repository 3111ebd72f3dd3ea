//! Job model: the record the store owns and the view clients poll.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Hours a record (and its idempotency-key binding) is retained before an
/// external purge may remove it.
pub const RETENTION_HOURS: i64 = 24;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Succeeded,
    Failed,
    FailedFinal,
}

impl JobStatus {
    /// Terminal statuses admit no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::FailedFinal)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
            JobStatus::FailedFinal => "FAILED_FINAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(JobStatus::Pending),
            "PROCESSING" => Some(JobStatus::Processing),
            "SUCCEEDED" => Some(JobStatus::Succeeded),
            "FAILED" => Some(JobStatus::Failed),
            "FAILED_FINAL" => Some(JobStatus::FailedFinal),
            _ => None,
        }
    }
}

/// Whether `from -> to` is an edge of the job state machine.
///
/// Edges: workers claim `Pending|Failed -> Processing` and resolve
/// `Processing -> Succeeded|Failed`; submission compensation takes
/// `Pending -> Failed`; only the dead-letter finalizer writes `FailedFinal`,
/// from any non-terminal status.
pub fn is_valid_transition(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    matches!(
        (from, to),
        (Pending, Processing)
            | (Pending, Failed)
            | (Pending, FailedFinal)
            | (Processing, Succeeded)
            | (Processing, Failed)
            | (Processing, FailedFinal)
            | (Failed, Processing)
            | (Failed, FailedFinal)
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
}

impl JobPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::Low => "low",
            JobPriority::Normal => "normal",
            JobPriority::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(JobPriority::Low),
            "normal" => Some(JobPriority::Normal),
            "high" => Some(JobPriority::High),
            _ => None,
        }
    }
}

// ============================================================================
// Job Record
// ============================================================================

/// The durable job record. The store exclusively owns it; queue messages are
/// disposable pointers carrying `job_id`, `trace_id`, `payload_hash` only.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct JobRecord {
    #[builder(default = Uuid::new_v4())]
    pub job_id: Uuid,

    #[builder(default, setter(strip_option))]
    pub idempotency_key: Option<String>,

    #[builder(default)]
    pub status: JobStatus,

    pub job_type: String,

    #[builder(default)]
    pub priority: JobPriority,

    /// Opaque payload; never interpreted beyond hashing.
    pub params: serde_json::Value,

    #[builder(default, setter(strip_option))]
    pub metadata: Option<serde_json::Value>,

    /// Execution attempts; incremented once per delivery, at claim time.
    #[builder(default = 0)]
    pub attempts: i32,

    pub trace_id: String,

    pub payload_hash: String,

    #[builder(default, setter(strip_option))]
    pub result: Option<serde_json::Value>,

    #[builder(default, setter(strip_option))]
    pub error: Option<String>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,

    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,

    #[builder(default = Utc::now() + Duration::hours(RETENTION_HOURS))]
    pub expires_at: DateTime<Utc>,
}

impl JobRecord {
    /// Create a fresh `Pending` record for a submission.
    ///
    /// Generates the job id and, when absent, the trace id; stamps the
    /// payload hash and the retention horizon.
    pub fn create(
        job_type: impl Into<String>,
        priority: JobPriority,
        params: serde_json::Value,
        metadata: Option<serde_json::Value>,
        idempotency_key: Option<String>,
        trace_id: Option<String>,
    ) -> Self {
        let job_type = job_type.into();
        let hash = payload_hash(&job_type, priority, &params);
        let now = Utc::now();

        Self {
            job_id: Uuid::new_v4(),
            idempotency_key,
            status: JobStatus::Pending,
            job_type,
            priority,
            params,
            metadata,
            attempts: 0,
            trace_id: trace_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            payload_hash: hash,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            expires_at: now + Duration::hours(RETENTION_HOURS),
        }
    }

    /// Whether the retention horizon has passed. Expired records no longer
    /// participate in idempotency dedup; physical purge is external.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// The external projection returned to submitting/polling clients.
    pub fn view(&self) -> JobView {
        JobView {
            job_id: self.job_id,
            status: self.status,
            job_type: self.job_type.clone(),
            priority: self.priority,
            attempts: self.attempts,
            trace_id: self.trace_id.clone(),
            result: self.result.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Digest of the logical payload, used to detect drift when an idempotency
/// key or the retry endpoint is reused with different content.
///
/// Canonical form: JSON object `{params, priority, type}`; serde_json object
/// keys are ordered, so the digest is stable under caller key order.
pub fn payload_hash(job_type: &str, priority: JobPriority, params: &serde_json::Value) -> String {
    let canonical = serde_json::json!({
        "type": job_type,
        "priority": priority.as_str(),
        "params": params,
    });
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

// ============================================================================
// Job View
// ============================================================================

/// Client-facing projection of a job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub job_type: String,
    pub priority: JobPriority,
    pub attempts: i32,
    pub trace_id: String,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
