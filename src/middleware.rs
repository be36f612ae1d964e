//! Tool invocation middleware
//!
//! Uniform wrapper around every externally reachable operation:
//! rate-limit, validate, execute, map errors to a stable payload. This is
//! the only path through which external callers reach the command and
//! query buses; internal sagas and workers bypass it.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use crate::failsafe::RateLimiter;
use crate::subscribers::SecurityEventHandler;
use crate::validator::ValidationResult;
use crate::{Error, Result};

/// The validate -> rate-limit -> execute -> map-errors pipeline
pub struct ToolMiddleware {
    rate_limiter: Arc<RateLimiter>,
    security: Arc<SecurityEventHandler>,
}

impl ToolMiddleware {
    /// Create the middleware
    #[must_use]
    pub fn new(rate_limiter: Arc<RateLimiter>, security: Arc<SecurityEventHandler>) -> Self {
        Self {
            rate_limiter,
            security,
        }
    }

    /// Run one operation through the pipeline.
    ///
    /// Rate limiting is checked first so a flood of invalid requests still
    /// pays for admission; validation failures short-circuit before the
    /// executor runs and are routed to the security sink.
    pub async fn run<F, Fut>(
        &self,
        operation: &'static str,
        rate_key: &str,
        validation: ValidationResult,
        execute: F,
    ) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let decision = self.rate_limiter.consume(rate_key);
        if !decision.allowed {
            self.security
                .log_rate_limit_exceeded(operation, decision.limit, decision.retry_after_ms);
            return Err(Error::RateLimitExceeded {
                limit: decision.limit,
                retry_after_ms: decision.retry_after_ms,
            });
        }

        if !validation.valid() {
            for error in &validation.errors {
                self.security
                    .log_validation_failed(operation, error.field, &error.message);
            }
            return Err(Error::Validation(validation.first_message()));
        }

        execute().await
    }

    /// Map any error to the stable boundary payload and invoke the error
    /// hook for telemetry. Internals never leak: clients see the stable
    /// kind, the message, and whatever `details` the kind defines.
    #[must_use]
    pub fn error_payload(&self, operation: &'static str, error: &Error) -> Value {
        self.security.log_tool_error(operation, error);
        serde_json::json!({
            "error": error.to_string(),
            "error_type": error.kind(),
            "details": error.details(),
        })
    }

    /// Run the pipeline and flatten the outcome into a response payload
    pub async fn dispatch<F, Fut>(
        &self,
        operation: &'static str,
        rate_key: &str,
        validation: ValidationResult,
        execute: F,
    ) -> Value
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        match self.run(operation, rate_key, validation, execute).await {
            Ok(value) => value,
            Err(e) => self.error_payload(operation, &e),
        }
    }
}
