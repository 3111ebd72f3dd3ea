//! # Conveyor
//!
//! A job lifecycle and delivery-reliability engine: durable submission,
//! at-least-once dispatch to pluggable handlers, and guaranteed terminal
//! outcomes under worker crashes, duplicate deliveries, and transient
//! failures.
//!
//! ## Architecture
//!
//! ```text
//! client
//!   │
//!   ▼ submit()
//! SubmissionCoordinator ──► JobStore (create_if_absent, dedup)
//!   │                           ▲
//!   ▼ send()                    │ compare_and_transition
//! WorkQueue ◄──────────────┐    │
//!   │ receive()            │    │
//!   ▼                      │    │
//! WorkerLoop ── HandlerRegistry.execute()
//!   │   │
//!   │   └─ success: delete message
//!   │   └─ failure: leave lease ─► queue redrive ─► dead-letter queue
//!   │                                                    │
//!   ▼                                                    ▼ receive()
//! JobStore (Succeeded/Failed)                 DeadLetterFinalizer ─► FailedFinal
//! ```
//!
//! ## Key Invariants
//!
//! 1. **The store is the single arbiter** - every status change goes through
//!    `compare_and_transition`; a queue lease alone never authorizes a write
//! 2. **At most one record per live idempotency key** - duplicate submissions
//!    collapse onto the existing job with no new side effect
//! 3. **Terminal states are absorbing** - no delivery re-invokes the handler
//!    for a `Succeeded` or `FailedFinal` job
//! 4. **Every job terminates** - persistent failures escalate through
//!    queue-level redrive to the dead-letter finalizer, the only writer of
//!    `FailedFinal`
//!
//! ## Guarantees
//!
//! - **At-least-once execution**: handlers must be safe to re-invoke; the
//!   engine does not make side effects idempotent on their behalf
//! - **No cross-job ordering**: jobs are independent
//! - **Monotonic client view**: polling observes
//!   `PENDING → PROCESSING → {SUCCEEDED | FAILED | FAILED_FINAL}`, where
//!   `FAILED` is retryable and not terminal

// Core modules
mod error;
mod events;
mod finalizer;
mod handler;
mod job;
mod queue;
mod store;
mod submit;
mod worker;

// In-memory implementations (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod memory;


// Re-export error types
pub use error::{QueueError, StoreError, SubmitError};

// Re-export event types
pub use events::{counters, EventSink, JobEvent, TracingSink};

// Re-export the job model
pub use job::{
    is_valid_transition, payload_hash, JobPriority, JobRecord, JobStatus, JobView,
    RETENTION_HOURS,
};

// Re-export store and queue contracts
pub use queue::{Delivery, ReceiptHandle, WorkMessage, WorkQueue};
pub use store::{JobStore, TransitionUpdate};

// Re-export the submission surface
pub use submit::{SubmissionCoordinator, SubmitRequest};

// Re-export handler plumbing
pub use handler::{HandlerError, HandlerRegistry, JobContext, SharedHandlerRegistry};

// Re-export the services
pub use finalizer::{DeadLetterFinalizer, FinalizerConfig};
pub use worker::{WorkerConfig, WorkerLoop};

// Re-export commonly used external types
pub use async_trait::async_trait;
