//! Ambient event handlers: structured logging and security telemetry

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, EventHandlerFn};
use crate::domain::events::DomainEvent;
use crate::Error;

/// Subscribe the structured-logging firehose handler.
///
/// Every domain event becomes one tracing line with its fields spread out;
/// nothing else in the system calls the logger for domain occurrences.
pub fn subscribe_logging_handler(event_bus: &EventBus) {
    let handler: EventHandlerFn = Arc::new(|event| {
        match event {
            DomainEvent::ProviderStarted {
                provider_id,
                mode,
                tools_count,
                startup_ms,
                ..
            } => info!(%provider_id, %mode, tools_count, startup_ms, "provider_started"),
            DomainEvent::ProviderStopped {
                provider_id, reason, ..
            } => info!(%provider_id, %reason, "provider_stopped"),
            DomainEvent::ProviderDegraded {
                provider_id,
                consecutive_failures,
                reason,
                ..
            } => warn!(%provider_id, consecutive_failures, %reason, "provider_degraded"),
            DomainEvent::ProviderStateChanged {
                provider_id,
                old_state,
                new_state,
                ..
            } => debug!(%provider_id, %old_state, %new_state, "provider_state_changed"),
            DomainEvent::ProviderIdleDetected {
                provider_id,
                idle_duration_s,
                ..
            } => info!(%provider_id, idle_duration_s, "provider_idle_detected"),
            DomainEvent::ToolInvocationRequested {
                provider_id,
                tool_name,
                correlation_id,
                ..
            } => debug!(%provider_id, %tool_name, %correlation_id, "tool_invocation_requested"),
            DomainEvent::ToolInvocationCompleted {
                provider_id,
                tool_name,
                correlation_id,
                duration_ms,
                ..
            } => debug!(
                %provider_id,
                %tool_name, %correlation_id, duration_ms, "tool_invocation_completed"
            ),
            DomainEvent::ToolInvocationFailed {
                provider_id,
                tool_name,
                correlation_id,
                error_type,
                error_message,
                ..
            } => warn!(
                %provider_id,
                %tool_name, %correlation_id, %error_type, %error_message, "tool_invocation_failed"
            ),
            DomainEvent::HealthCheckPassed {
                provider_id,
                duration_ms,
                ..
            } => debug!(%provider_id, duration_ms, "health_check_passed"),
            DomainEvent::HealthCheckFailed {
                provider_id,
                consecutive_failures,
                error_message,
                ..
            } => warn!(%provider_id, consecutive_failures, %error_message, "health_check_failed"),
            DomainEvent::ConfigurationReloadRequested {
                config_path,
                requested_by,
                ..
            } => info!(%config_path, %requested_by, "configuration_reload_requested"),
            DomainEvent::ConfigurationReloaded {
                config_path,
                providers_added,
                providers_removed,
                providers_updated,
                duration_ms,
                ..
            } => info!(
                %config_path,
                added = providers_added.len(),
                removed = providers_removed.len(),
                updated = providers_updated.len(),
                duration_ms,
                "configuration_reloaded"
            ),
            DomainEvent::ConfigurationReloadFailed {
                config_path,
                reason,
                ..
            } => warn!(%config_path, %reason, "configuration_reload_failed"),
            DomainEvent::GroupMemberAdded {
                group_id,
                provider_id,
                ..
            } => info!(%group_id, %provider_id, "group_member_added"),
            DomainEvent::GroupMemberRemoved {
                group_id,
                provider_id,
                ..
            } => info!(%group_id, %provider_id, "group_member_removed"),
            DomainEvent::GroupRotationChanged {
                group_id,
                provider_id,
                in_rotation,
                ..
            } => info!(%group_id, %provider_id, in_rotation, "group_rotation_changed"),
            DomainEvent::CircuitOpened {
                group_id,
                provider_id,
                ..
            } => warn!(%group_id, %provider_id, "circuit_opened"),
            DomainEvent::CircuitClosed {
                group_id,
                provider_id,
                ..
            } => info!(%group_id, %provider_id, "circuit_closed"),
        }
        Ok(())
    });
    event_bus.subscribe_all(handler);
}

/// How many security events the in-memory ring keeps
const SECURITY_RING_CAPACITY: usize = 256;

/// Sink for security-relevant observations: validation rejections,
/// rate-limit denials, tool failures. Keeps a bounded in-memory ring for
/// the details surface; persistence is an external subscriber's job.
#[derive(Default)]
pub struct SecurityEventHandler {
    recent: Mutex<VecDeque<Value>>,
}

impl SecurityEventHandler {
    /// Create an empty sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, entry: Value) {
        let mut recent = self.recent.lock();
        if recent.len() >= SECURITY_RING_CAPACITY {
            recent.pop_front();
        }
        recent.push_back(entry);
    }

    /// Record a validation rejection
    pub fn log_validation_failed(&self, operation: &str, field: &str, message: &str) {
        warn!(operation, field, message, "validation_failed");
        self.push(serde_json::json!({
            "kind": "validation_failed",
            "operation": operation,
            "field": field,
            "message": message,
            "at": Utc::now(),
        }));
    }

    /// Record a rate-limit denial
    pub fn log_rate_limit_exceeded(&self, operation: &str, limit: u32, retry_after_ms: u64) {
        warn!(operation, limit, retry_after_ms, "rate_limit_exceeded");
        self.push(serde_json::json!({
            "kind": "rate_limit_exceeded",
            "operation": operation,
            "limit": limit,
            "retry_after_ms": retry_after_ms,
            "at": Utc::now(),
        }));
    }

    /// Record a tool failure surfaced at the boundary (best effort; this
    /// path must never break the tool call itself)
    pub fn log_tool_error(&self, operation: &str, error: &Error) {
        self.push(serde_json::json!({
            "kind": "tool_error",
            "operation": operation,
            "error_type": error.kind(),
            "message": error.to_string(),
            "at": Utc::now(),
        }));
    }

    /// Snapshot of recent security events, oldest first
    #[must_use]
    pub fn recent(&self) -> Vec<Value> {
        self.recent.lock().iter().cloned().collect()
    }
}
