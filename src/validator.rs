//! Syntactic input validation
//!
//! The gate in front of every externally reachable operation. Validation
//! outcomes are values, never errors: callers inspect the result and decide
//! how to surface it.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde_json::Value;

/// Provider and group ids: leading alphanumeric, then `[a-zA-Z0-9_-]`,
/// at most 64 chars. Path separators never match.
static ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_-]{0,63}$").expect("valid regex"));

/// Tool names per MCP: `[a-zA-Z0-9_.-]`, 1-128 chars
static TOOL_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_.-]{1,128}$").expect("valid regex"));

/// Maximum nesting depth of tool arguments
const MAX_ARGUMENT_DEPTH: usize = 16;

/// Maximum serialized size of tool arguments
const MAX_ARGUMENT_BYTES: usize = 1024 * 1024;

/// Upper bound on caller-supplied timeouts
const MAX_TIMEOUT: Duration = Duration::from_secs(300);

/// One validation failure
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Which input failed
    pub field: &'static str,
    /// Why it failed
    pub message: String,
}

/// Outcome of a validation pass
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// Accumulated failures; empty means valid
    pub errors: Vec<ValidationError>,
}

impl ValidationResult {
    /// A passing result
    #[must_use]
    pub fn ok() -> Self {
        Self::default()
    }

    /// A failing result with one error
    #[must_use]
    pub fn fail(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            errors: vec![ValidationError {
                field,
                message: message.into(),
            }],
        }
    }

    /// Whether the input passed
    #[must_use]
    pub fn valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// First failure message, or a generic fallback
    #[must_use]
    pub fn first_message(&self) -> String {
        self.errors
            .first()
            .map_or_else(|| "validation failed".to_string(), |e| e.message.clone())
    }

    /// Merge another result's failures into this one
    #[must_use]
    pub fn and(mut self, other: Self) -> Self {
        self.errors.extend(other.errors);
        self
    }
}

/// Validate a provider or group id
#[must_use]
pub fn validate_provider_id(id: &str) -> ValidationResult {
    if id.is_empty() {
        return ValidationResult::fail("provider", "provider id must not be empty");
    }
    if id.len() > 64 {
        return ValidationResult::fail("provider", "provider id exceeds 64 characters");
    }
    if !ID_RE.is_match(id) {
        return ValidationResult::fail(
            "provider",
            format!("provider id '{id}' contains invalid characters"),
        );
    }
    ValidationResult::ok()
}

/// Validate a tool name
#[must_use]
pub fn validate_tool_name(name: &str) -> ValidationResult {
    if !TOOL_NAME_RE.is_match(name) {
        return ValidationResult::fail("tool", format!("invalid tool name '{name}'"));
    }
    ValidationResult::ok()
}

fn depth_of(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + map.values().map(depth_of).max().unwrap_or(0),
        Value::Array(items) => 1 + items.iter().map(depth_of).max().unwrap_or(0),
        _ => 0,
    }
}

/// Validate tool arguments: must be a JSON object, bounded depth and size
#[must_use]
pub fn validate_arguments(arguments: &Value) -> ValidationResult {
    if !arguments.is_object() {
        return ValidationResult::fail("arguments", "arguments must be a JSON object");
    }
    if depth_of(arguments) > MAX_ARGUMENT_DEPTH {
        return ValidationResult::fail(
            "arguments",
            format!("arguments exceed maximum nesting depth of {MAX_ARGUMENT_DEPTH}"),
        );
    }
    match serde_json::to_string(arguments) {
        Ok(serialized) if serialized.len() > MAX_ARGUMENT_BYTES => ValidationResult::fail(
            "arguments",
            format!("arguments exceed maximum size of {MAX_ARGUMENT_BYTES} bytes"),
        ),
        Ok(_) => ValidationResult::ok(),
        Err(e) => ValidationResult::fail("arguments", format!("arguments not serializable: {e}")),
    }
}

/// Validate a caller-supplied timeout
#[must_use]
pub fn validate_timeout(timeout: Duration) -> ValidationResult {
    if timeout.is_zero() {
        return ValidationResult::fail("timeout", "timeout must be positive");
    }
    if timeout > MAX_TIMEOUT {
        return ValidationResult::fail(
            "timeout",
            format!("timeout exceeds maximum of {}s", MAX_TIMEOUT.as_secs()),
        );
    }
    ValidationResult::ok()
}
