//! Domain events
//!
//! Immutable records of business occurrences. Every event carries a fresh
//! UUID and its occurrence timestamp; invocation events additionally carry
//! the correlation id that threads one tool call through logs and metrics.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Identity and timestamp shared by every event
#[derive(Debug, Clone, Serialize)]
pub struct EventMeta {
    /// Unique event id
    pub event_id: Uuid,
    /// When the event occurred
    pub occurred_at: DateTime<Utc>,
}

impl EventMeta {
    /// Stamp a new event
    #[must_use]
    pub fn new() -> Self {
        Self {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
        }
    }
}

impl Default for EventMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// Discriminant used for type-scoped event-bus subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A provider completed its handshake and became READY
    ProviderStarted,
    /// A provider stopped (shutdown, idle, error, reload)
    ProviderStopped,
    /// A provider crossed its consecutive-failure threshold
    ProviderDegraded,
    /// A provider's state machine transitioned
    ProviderStateChanged,
    /// The GC worker found a provider past its idle TTL
    ProviderIdleDetected,
    /// A tool invocation was accepted for dispatch
    ToolInvocationRequested,
    /// A tool invocation returned a result
    ToolInvocationCompleted,
    /// A tool invocation failed
    ToolInvocationFailed,
    /// An active health check succeeded
    HealthCheckPassed,
    /// An active health check failed
    HealthCheckFailed,
    /// A configuration reload was requested
    ConfigurationReloadRequested,
    /// A configuration reload was applied
    ConfigurationReloaded,
    /// A configuration reload was rejected
    ConfigurationReloadFailed,
    /// A member joined a group
    GroupMemberAdded,
    /// A member left a group
    GroupMemberRemoved,
    /// A member's rotation bit flipped
    GroupRotationChanged,
    /// A member's circuit breaker opened
    CircuitOpened,
    /// A member's circuit breaker closed
    CircuitClosed,
}

/// Domain event
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_type")]
pub enum DomainEvent {
    /// Provider successfully started
    ProviderStarted {
        /// Event identity
        #[serde(flatten)]
        meta: EventMeta,
        /// Provider that started
        provider_id: String,
        /// Provider mode label (subprocess, container, remote)
        mode: String,
        /// Number of tools discovered
        tools_count: usize,
        /// Wall-clock startup duration
        startup_ms: u64,
    },
    /// Provider stopped
    ProviderStopped {
        /// Event identity
        #[serde(flatten)]
        meta: EventMeta,
        /// Provider that stopped
        provider_id: String,
        /// Why it stopped ("shutdown", "idle", "error", "config_reload")
        reason: String,
    },
    /// Provider entered DEGRADED
    ProviderDegraded {
        /// Event identity
        #[serde(flatten)]
        meta: EventMeta,
        /// Degraded provider
        provider_id: String,
        /// Consecutive failures at the moment of degradation
        consecutive_failures: u32,
        /// Lifetime failure count
        total_failures: u64,
        /// What pushed it over the threshold
        reason: String,
    },
    /// Provider state transitioned
    ProviderStateChanged {
        /// Event identity
        #[serde(flatten)]
        meta: EventMeta,
        /// Provider whose state changed
        provider_id: String,
        /// State before
        old_state: String,
        /// State after
        new_state: String,
    },
    /// Provider idle past its TTL
    ProviderIdleDetected {
        /// Event identity
        #[serde(flatten)]
        meta: EventMeta,
        /// Idle provider
        provider_id: String,
        /// How long it had been idle
        idle_duration_s: u64,
        /// Epoch seconds of last use
        last_used_at: f64,
    },
    /// Tool invocation accepted
    ToolInvocationRequested {
        /// Event identity
        #[serde(flatten)]
        meta: EventMeta,
        /// Target provider
        provider_id: String,
        /// Target tool
        tool_name: String,
        /// Correlation id shared with the matching Completed/Failed event
        correlation_id: String,
    },
    /// Tool invocation completed
    ToolInvocationCompleted {
        /// Event identity
        #[serde(flatten)]
        meta: EventMeta,
        /// Target provider
        provider_id: String,
        /// Target tool
        tool_name: String,
        /// Correlation id of the invocation
        correlation_id: String,
        /// Round-trip duration
        duration_ms: u64,
        /// Serialized size of the result
        result_size_bytes: usize,
    },
    /// Tool invocation failed
    ToolInvocationFailed {
        /// Event identity
        #[serde(flatten)]
        meta: EventMeta,
        /// Target provider
        provider_id: String,
        /// Target tool
        tool_name: String,
        /// Correlation id of the invocation
        correlation_id: String,
        /// Error message
        error_message: String,
        /// Stable error kind
        error_type: String,
    },
    /// Health check passed
    HealthCheckPassed {
        /// Event identity
        #[serde(flatten)]
        meta: EventMeta,
        /// Checked provider
        provider_id: String,
        /// Probe duration
        duration_ms: u64,
    },
    /// Health check failed
    HealthCheckFailed {
        /// Event identity
        #[serde(flatten)]
        meta: EventMeta,
        /// Checked provider
        provider_id: String,
        /// Consecutive failures after this one
        consecutive_failures: u32,
        /// Error message
        error_message: String,
    },
    /// Configuration reload requested
    ConfigurationReloadRequested {
        /// Event identity
        #[serde(flatten)]
        meta: EventMeta,
        /// Config file being reloaded
        config_path: String,
        /// Who asked ("file_watcher", "api", "signal")
        requested_by: String,
    },
    /// Configuration reload applied
    ConfigurationReloaded {
        /// Event identity
        #[serde(flatten)]
        meta: EventMeta,
        /// Config file that was applied
        config_path: String,
        /// Providers created by this reload
        providers_added: Vec<String>,
        /// Providers removed by this reload
        providers_removed: Vec<String>,
        /// Providers restarted with new config
        providers_updated: Vec<String>,
        /// Providers untouched
        providers_unchanged: Vec<String>,
        /// End-to-end reload duration
        duration_ms: u64,
    },
    /// Configuration reload rejected
    ConfigurationReloadFailed {
        /// Event identity
        #[serde(flatten)]
        meta: EventMeta,
        /// Config file that failed to apply
        config_path: String,
        /// Failure reason
        reason: String,
        /// Stable error kind
        error_type: String,
    },
    /// Group member added
    GroupMemberAdded {
        /// Event identity
        #[serde(flatten)]
        meta: EventMeta,
        /// Group the member joined
        group_id: String,
        /// Member provider
        provider_id: String,
    },
    /// Group member removed
    GroupMemberRemoved {
        /// Event identity
        #[serde(flatten)]
        meta: EventMeta,
        /// Group the member left
        group_id: String,
        /// Member provider
        provider_id: String,
    },
    /// Member rotation bit flipped
    GroupRotationChanged {
        /// Event identity
        #[serde(flatten)]
        meta: EventMeta,
        /// Group that rebalanced
        group_id: String,
        /// Member whose rotation changed
        provider_id: String,
        /// New rotation state
        in_rotation: bool,
    },
    /// Member circuit breaker opened
    CircuitOpened {
        /// Event identity
        #[serde(flatten)]
        meta: EventMeta,
        /// Owning group
        group_id: String,
        /// Protected member
        provider_id: String,
    },
    /// Member circuit breaker closed
    CircuitClosed {
        /// Event identity
        #[serde(flatten)]
        meta: EventMeta,
        /// Owning group
        group_id: String,
        /// Protected member
        provider_id: String,
    },
}

impl DomainEvent {
    /// Subscription discriminant
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ProviderStarted { .. } => EventKind::ProviderStarted,
            Self::ProviderStopped { .. } => EventKind::ProviderStopped,
            Self::ProviderDegraded { .. } => EventKind::ProviderDegraded,
            Self::ProviderStateChanged { .. } => EventKind::ProviderStateChanged,
            Self::ProviderIdleDetected { .. } => EventKind::ProviderIdleDetected,
            Self::ToolInvocationRequested { .. } => EventKind::ToolInvocationRequested,
            Self::ToolInvocationCompleted { .. } => EventKind::ToolInvocationCompleted,
            Self::ToolInvocationFailed { .. } => EventKind::ToolInvocationFailed,
            Self::HealthCheckPassed { .. } => EventKind::HealthCheckPassed,
            Self::HealthCheckFailed { .. } => EventKind::HealthCheckFailed,
            Self::ConfigurationReloadRequested { .. } => EventKind::ConfigurationReloadRequested,
            Self::ConfigurationReloaded { .. } => EventKind::ConfigurationReloaded,
            Self::ConfigurationReloadFailed { .. } => EventKind::ConfigurationReloadFailed,
            Self::GroupMemberAdded { .. } => EventKind::GroupMemberAdded,
            Self::GroupMemberRemoved { .. } => EventKind::GroupMemberRemoved,
            Self::GroupRotationChanged { .. } => EventKind::GroupRotationChanged,
            Self::CircuitOpened { .. } => EventKind::CircuitOpened,
            Self::CircuitClosed { .. } => EventKind::CircuitClosed,
        }
    }

    /// Provider the event concerns, when there is one
    #[must_use]
    pub fn provider_id(&self) -> Option<&str> {
        match self {
            Self::ProviderStarted { provider_id, .. }
            | Self::ProviderStopped { provider_id, .. }
            | Self::ProviderDegraded { provider_id, .. }
            | Self::ProviderStateChanged { provider_id, .. }
            | Self::ProviderIdleDetected { provider_id, .. }
            | Self::ToolInvocationRequested { provider_id, .. }
            | Self::ToolInvocationCompleted { provider_id, .. }
            | Self::ToolInvocationFailed { provider_id, .. }
            | Self::HealthCheckPassed { provider_id, .. }
            | Self::HealthCheckFailed { provider_id, .. }
            | Self::GroupMemberAdded { provider_id, .. }
            | Self::GroupMemberRemoved { provider_id, .. }
            | Self::GroupRotationChanged { provider_id, .. }
            | Self::CircuitOpened { provider_id, .. }
            | Self::CircuitClosed { provider_id, .. } => Some(provider_id),
            _ => None,
        }
    }

    /// Correlation id, present on invocation events
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Self::ToolInvocationRequested { correlation_id, .. }
            | Self::ToolInvocationCompleted { correlation_id, .. }
            | Self::ToolInvocationFailed { correlation_id, .. } => Some(correlation_id),
            _ => None,
        }
    }

    /// Event identity and timestamp
    #[must_use]
    pub fn meta(&self) -> &EventMeta {
        match self {
            Self::ProviderStarted { meta, .. }
            | Self::ProviderStopped { meta, .. }
            | Self::ProviderDegraded { meta, .. }
            | Self::ProviderStateChanged { meta, .. }
            | Self::ProviderIdleDetected { meta, .. }
            | Self::ToolInvocationRequested { meta, .. }
            | Self::ToolInvocationCompleted { meta, .. }
            | Self::ToolInvocationFailed { meta, .. }
            | Self::HealthCheckPassed { meta, .. }
            | Self::HealthCheckFailed { meta, .. }
            | Self::ConfigurationReloadRequested { meta, .. }
            | Self::ConfigurationReloaded { meta, .. }
            | Self::ConfigurationReloadFailed { meta, .. }
            | Self::GroupMemberAdded { meta, .. }
            | Self::GroupMemberRemoved { meta, .. }
            | Self::GroupRotationChanged { meta, .. }
            | Self::CircuitOpened { meta, .. }
            | Self::CircuitClosed { meta, .. } => meta,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_carry_unique_ids() {
        let a = DomainEvent::ProviderStopped {
            meta: EventMeta::new(),
            provider_id: "p".into(),
            reason: "idle".into(),
        };
        let b = DomainEvent::ProviderStopped {
            meta: EventMeta::new(),
            provider_id: "p".into(),
            reason: "idle".into(),
        };
        assert_ne!(a.meta().event_id, b.meta().event_id);
    }

    #[test]
    fn serialization_tags_the_event_type() {
        let event = DomainEvent::ToolInvocationRequested {
            meta: EventMeta::new(),
            provider_id: "math".into(),
            tool_name: "add".into(),
            correlation_id: "c-1".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event_type"], "ToolInvocationRequested");
        assert_eq!(value["provider_id"], "math");
        assert!(value.get("event_id").is_some());
        assert!(value.get("occurred_at").is_some());
    }

    #[test]
    fn correlation_id_only_on_invocation_events() {
        let invocation = DomainEvent::ToolInvocationCompleted {
            meta: EventMeta::new(),
            provider_id: "p".into(),
            tool_name: "add".into(),
            correlation_id: "c-9".into(),
            duration_ms: 12,
            result_size_bytes: 64,
        };
        assert_eq!(invocation.correlation_id(), Some("c-9"));

        let lifecycle = DomainEvent::ProviderStarted {
            meta: EventMeta::new(),
            provider_id: "p".into(),
            mode: "subprocess".into(),
            tools_count: 1,
            startup_ms: 40,
        };
        assert_eq!(lifecycle.correlation_id(), None);
        assert_eq!(lifecycle.kind(), EventKind::ProviderStarted);
    }
}
