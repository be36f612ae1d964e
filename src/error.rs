//! Error types for mcp-hangar

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for mcp-hangar
pub type Result<T> = std::result::Result<T, Error>;

/// Hangar errors
///
/// Every variant maps to a stable snake_case kind via [`Error::kind`]; the
/// kind (not the Rust type name) is what boundary payloads carry.
#[derive(Error, Debug)]
pub enum Error {
    /// Syntactic input rejected before reaching any handler
    #[error("Validation error: {0}")]
    Validation(String),

    /// Admission denied by the rate limiter
    #[error("Rate limit exceeded: limit {limit} req/s, retry in {retry_after_ms}ms")]
    RateLimitExceeded {
        /// Configured requests-per-second limit
        limit: u32,
        /// Milliseconds until the next permit becomes available
        retry_after_ms: u64,
    },

    /// Unknown provider or group id
    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    /// Tool not present in the provider's catalog
    #[error("Tool '{tool_name}' not found on provider '{provider_id}'")]
    ToolNotFound {
        /// Provider that was asked
        provider_id: String,
        /// Requested tool name
        tool_name: String,
    },

    /// Provider answered the RPC with a domain-level error
    #[error("Tool invocation failed on '{provider_id}': {message} (code {code})")]
    ToolInvocation {
        /// Provider that answered
        provider_id: String,
        /// Tool that was invoked
        tool_name: String,
        /// JSON-RPC error code returned by the provider
        code: i64,
        /// JSON-RPC error message returned by the provider
        message: String,
    },

    /// RPC exceeded the caller's timeout
    #[error("Tool '{tool_name}' on '{provider_id}' timed out after {timeout:?}")]
    ToolTimeout {
        /// Provider that was invoked
        provider_id: String,
        /// Tool that was invoked
        tool_name: String,
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// Transport-level timeout (non-tool RPC)
    #[error("Client timeout: {0}")]
    ClientTimeout(String),

    /// Transport fault: the client is closed, the write failed, or the
    /// child process died under us
    #[error("Client not connected: {0}")]
    ClientNotConnected(String),

    /// Provider could not be brought up
    #[error("Provider '{provider_id}' failed to start: {reason}")]
    ProviderStart {
        /// Provider that failed
        provider_id: String,
        /// What went wrong
        reason: String,
        /// Operator-facing hint derived from the failure text
        suggestion: String,
    },

    /// Provider is in its backoff window; retry later
    #[error("Provider '{provider_id}' cannot start yet, retry in {retry_in:?}")]
    CannotStartProvider {
        /// Provider in backoff
        provider_id: String,
        /// Remaining backoff
        retry_in: Duration,
    },

    /// Provider is degraded and currently unusable
    #[error("Provider '{provider_id}' is degraded")]
    ProviderDegraded {
        /// Degraded provider
        provider_id: String,
    },

    /// Group has no member able to take the call
    #[error("No healthy members in group '{0}'")]
    NoHealthyMembers(String),

    /// Group is not available for invocation
    #[error("Group '{group_id}' is not available (state {state})")]
    GroupUnavailable {
        /// Group that was addressed
        group_id: String,
        /// Group state label at rejection time
        state: String,
    },

    /// Illegal state-machine transition; an implementation bug, never a
    /// runtime condition
    #[error("Invalid state transition for '{provider_id}': {from} -> {to}")]
    InvalidStateTransition {
        /// Provider whose state machine was violated
        provider_id: String,
        /// State the provider was in
        from: String,
        /// State that was requested
        to: String,
    },

    /// Configuration load or reload rejected
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Transport error (spawn, pipe, socket)
    #[error("Transport error: {0}")]
    Transport(String),

    /// MCP protocol violation
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable snake_case label for boundary payloads.
    ///
    /// These labels are part of the public contract: clients match on them,
    /// so renaming one is a breaking change.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::ProviderNotFound(_) => "provider_not_found",
            Self::ToolNotFound { .. } => "tool_not_found",
            Self::ToolInvocation { .. } => "tool_invocation_error",
            Self::ToolTimeout { .. } => "tool_timeout",
            Self::ClientTimeout(_) => "client_timeout",
            Self::ClientNotConnected(_) => "client_not_connected",
            Self::ProviderStart { .. } => "provider_start_error",
            Self::CannotStartProvider { .. } => "cannot_start_provider",
            Self::ProviderDegraded { .. } => "provider_degraded",
            Self::NoHealthyMembers(_) => "no_healthy_members",
            Self::GroupUnavailable { .. } => "group_unavailable",
            Self::InvalidStateTransition { .. } => "internal_error",
            Self::Configuration(_) => "configuration_error",
            Self::Transport(_) => "transport_error",
            Self::Protocol(_) => "protocol_error",
            Self::Io(_) | Self::Json(_) | Self::Http(_) | Self::Internal(_) => "internal_error",
        }
    }

    /// Structured details attached to the boundary payload, when the
    /// variant carries machine-usable fields.
    #[must_use]
    pub fn details(&self) -> serde_json::Value {
        match self {
            Self::RateLimitExceeded {
                limit,
                retry_after_ms,
            } => serde_json::json!({"limit": limit, "retry_after_ms": retry_after_ms}),
            Self::CannotStartProvider { retry_in, .. } => {
                serde_json::json!({"retry_in_s": retry_in.as_secs_f64()})
            }
            Self::ProviderStart { suggestion, .. } => {
                serde_json::json!({"suggestion": suggestion})
            }
            Self::ToolInvocation { code, .. } => serde_json::json!({"rpc_code": code}),
            _ => serde_json::json!({}),
        }
    }
}
