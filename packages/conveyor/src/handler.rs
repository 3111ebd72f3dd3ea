//! Pluggable job execution.
//!
//! The registry maps job type strings (e.g. "process_document") to async
//! handlers that receive the typed, deserialized params. Handlers signal
//! [`HandlerError::Transient`] for failures worth retrying and
//! [`HandlerError::Permanent`] for failures that never will succeed; unknown
//! job types and undeserializable params are permanent at execution time.
//!
//! Handlers run under at-least-once delivery and must be safe to re-invoke:
//! either naturally idempotent or using [`JobContext`] (`job_id`, `attempt`)
//! to detect replays. The engine does not deduplicate their side effects.
//!
//! # Example
//!
//! ```ignore
//! let mut registry = HandlerRegistry::new();
//! registry.register::<ProcessDocumentParams, _, _>(
//!     "process_document",
//!     |params, ctx| async move {
//!         let output = process(&params.source).await.map_err(HandlerError::transient)?;
//!         Ok(serde_json::json!({ "output": output, "attempt": ctx.attempt }))
//!     },
//! );
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::anyhow;
use serde::de::DeserializeOwned;
use thiserror::Error;
use uuid::Uuid;

/// Handler failure, classified for the retry decision.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Expected to succeed on retry (network timeout, throttling, 5xx).
    /// Drives in-process backoff, then queue-level redrive.
    #[error("transient handler failure: {0}")]
    Transient(#[source] anyhow::Error),

    /// Will never succeed (invalid input, unknown type). Still transitions
    /// the job to `Failed` and escalates through redrive like any other
    /// failure, keeping the finalization path singular.
    #[error("permanent handler failure: {0}")]
    Permanent(#[source] anyhow::Error),
}

impl HandlerError {
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        HandlerError::Transient(err.into())
    }

    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        HandlerError::Permanent(err.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

/// Execution context handed to handlers for replay detection and tracing.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub trace_id: String,
    /// Delivery attempt (1-based); stable across in-process retries within
    /// one delivery.
    pub attempt: i32,
}

type BoxedHandler = Box<
    dyn Fn(
            serde_json::Value,
            JobContext,
        ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, HandlerError>> + Send>>
        + Send
        + Sync,
>;

/// Registry mapping `job_type` to its handler, resolved once at startup.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, BoxedHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a job type.
    ///
    /// The handler receives the params deserialized to `P` and the job
    /// context, and returns the result payload stored on success.
    ///
    /// # Panics
    ///
    /// Panics if a handler is already registered for this job type.
    pub fn register<P, F, Fut>(&mut self, job_type: &'static str, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P, JobContext) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'static,
    {
        if self.handlers.contains_key(job_type) {
            panic!("handler already registered for job type: {}", job_type);
        }

        let boxed: BoxedHandler = Box::new(move |params, ctx| {
            let handler = handler.clone();
            Box::pin(async move {
                let params: P = serde_json::from_value(params).map_err(|e| {
                    HandlerError::permanent(anyhow!("invalid params for {}: {}", job_type, e))
                })?;
                handler(params, ctx).await
            })
        });

        self.handlers.insert(job_type, boxed);
    }

    /// Execute the handler registered for `job_type`.
    ///
    /// An unknown job type is a permanent failure.
    pub async fn execute(
        &self,
        job_type: &str,
        params: serde_json::Value,
        ctx: JobContext,
    ) -> Result<serde_json::Value, HandlerError> {
        let handler = self
            .handlers
            .get(job_type)
            .ok_or_else(|| HandlerError::permanent(anyhow!("unknown job type: {}", job_type)))?;

        handler(params, ctx).await
    }

    pub fn has(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn registered_types(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("registered_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Thread-safe registry wrapped in Arc.
pub type SharedHandlerRegistry = Arc<HandlerRegistry>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct EchoParams {
        message: String,
    }

    fn ctx() -> JobContext {
        JobContext {
            job_id: Uuid::new_v4(),
            trace_id: "trace-1".to_string(),
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn executes_registered_handler_with_typed_params() {
        let mut registry = HandlerRegistry::new();
        registry.register::<EchoParams, _, _>("echo", |params, _ctx| async move {
            Ok(serde_json::json!({ "echoed": params.message }))
        });

        let result = registry
            .execute("echo", serde_json::json!({"message": "hi"}), ctx())
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"echoed": "hi"}));
    }

    #[tokio::test]
    async fn unknown_job_type_is_permanent() {
        let registry = HandlerRegistry::new();
        let err = registry
            .execute("nope", serde_json::json!({}), ctx())
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("permanent"));
    }

    #[tokio::test]
    async fn undeserializable_params_are_permanent() {
        let mut registry = HandlerRegistry::new();
        registry.register::<EchoParams, _, _>("echo", |_params, _ctx| async move {
            Ok(serde_json::Value::Null)
        });

        let err = registry
            .execute("echo", serde_json::json!({"wrong": 1}), ctx())
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn handler_sees_job_context() {
        let mut registry = HandlerRegistry::new();
        registry.register::<serde_json::Value, _, _>("ctx", |_params, ctx| async move {
            Ok(serde_json::json!({ "attempt": ctx.attempt }))
        });

        let mut context = ctx();
        context.attempt = 3;
        let result = registry
            .execute("ctx", serde_json::json!({}), context)
            .await
            .unwrap();
        assert_eq!(result["attempt"], 3);
    }

    #[test]
    fn has_and_registered_types() {
        let mut registry = HandlerRegistry::new();
        registry
            .register::<serde_json::Value, _, _>("a", |_p, _c| async move { Ok(serde_json::Value::Null) });

        assert!(registry.has("a"));
        assert!(!registry.has("b"));
        assert_eq!(registry.registered_types(), vec!["a"]);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn duplicate_registration_panics() {
        let mut registry = HandlerRegistry::new();
        registry
            .register::<serde_json::Value, _, _>("a", |_p, _c| async move { Ok(serde_json::Value::Null) });
        registry
            .register::<serde_json::Value, _, _>("a", |_p, _c| async move { Ok(serde_json::Value::Null) });
    }

    #[test]
    fn transient_constructor_classifies() {
        assert!(HandlerError::transient(anyhow!("timeout")).is_transient());
        assert!(!HandlerError::permanent(anyhow!("bad input")).is_transient());
    }
}
