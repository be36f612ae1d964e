//! Provider aggregate: one managed MCP back-end and its state machine

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::config::ProviderConfig;
use crate::domain::events::{DomainEvent, EventMeta};
use crate::domain::health::{HealthSnapshot, HealthTracker};
use crate::protocol::ToolCatalog;
use crate::transport::{self, McpClient};
use crate::validator::validate_provider_id;
use crate::{Error, Result};

/// Timeout for the active health probe RPC
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Provider lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProviderState {
    /// No child process or connection; only predefined tools visible
    Cold = 0,
    /// Spawn and handshake in progress
    Starting = 1,
    /// Serving tool calls
    Ready = 2,
    /// Over the failure threshold; health checks and retries only
    Degraded = 3,
    /// Terminal for the current process; a new start attempt revives it
    Dead = 4,
}

impl ProviderState {
    /// Lowercase label used in listings and events
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cold => "cold",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Dead => "dead",
        }
    }

    /// Parse a state label (used by list filters)
    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "cold" => Some(Self::Cold),
            "starting" => Some(Self::Starting),
            "ready" => Some(Self::Ready),
            "degraded" => Some(Self::Degraded),
            "dead" => Some(Self::Dead),
            _ => None,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Ready,
            3 => Self::Degraded,
            4 => Self::Dead,
            _ => Self::Cold,
        }
    }
}

/// The allowed-transition table. Violations are implementation bugs,
/// never runtime conditions.
fn transition_allowed(from: ProviderState, to: ProviderState) -> bool {
    use ProviderState::{Cold, Dead, Degraded, Ready, Starting};
    matches!(
        (from, to),
        (Cold, Starting)
            | (Starting, Ready | Dead | Cold)
            | (Ready, Degraded | Cold | Dead)
            | (Degraded, Starting | Ready | Cold | Dead)
            | (Dead, Starting | Cold)
    )
}

/// Atomically readable state; written only under the provider's lock
#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: ProviderState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn get(&self) -> ProviderState {
        ProviderState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: ProviderState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Mutable runtime state, serialized by the provider's mutex
struct RuntimeState {
    client: Option<Arc<dyn McpClient>>,
    tools: ToolCatalog,
    health: HealthTracker,
    last_used: Option<f64>,
    metadata: HashMap<String, Value>,
    pending_events: Vec<DomainEvent>,
}

impl std::fmt::Debug for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeState")
            .field("client", &self.client.as_ref().map(|_| "<McpClient>"))
            .field("tools", &self.tools)
            .field("health", &self.health)
            .field("last_used", &self.last_used)
            .field("metadata", &self.metadata)
            .field("pending_events", &self.pending_events)
            .finish()
    }
}

/// Provider aggregate root.
///
/// Owns its configuration, state machine, transport client, tool catalog and
/// health tracker. Every mutation is serialized by the internal mutex; state
/// changes queue their events under that same lock, and the queue is drained
/// only through [`Provider::collect_events`] / [`Provider::drain_and_publish`].
#[derive(Debug)]
pub struct Provider {
    id: String,
    config: ProviderConfig,
    state: StateCell,
    runtime: Mutex<RuntimeState>,
}

impl Provider {
    /// Create a COLD provider from its configuration.
    ///
    /// The id is validated here so an invalid id can never enter the
    /// repository.
    pub fn from_config(id: &str, config: ProviderConfig) -> Result<Arc<Self>> {
        let check = validate_provider_id(id);
        if !check.valid() {
            return Err(Error::Validation(check.first_message()));
        }

        let tools = config
            .tools
            .clone()
            .map_or_else(ToolCatalog::empty, ToolCatalog::predefined);
        let health = HealthTracker::new(config.max_consecutive_failures);

        Ok(Arc::new(Self {
            id: id.to_string(),
            config,
            state: StateCell::new(ProviderState::Cold),
            runtime: Mutex::new(RuntimeState {
                client: None,
                tools,
                health,
                last_used: None,
                metadata: HashMap::new(),
                pending_events: Vec::new(),
            }),
        }))
    }

    /// Provider id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Immutable configuration
    #[must_use]
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Current state (lock-free read; written only under the lock)
    #[must_use]
    pub fn state(&self) -> ProviderState {
        self.state.get()
    }

    fn now_epoch() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }

    /// Transition the state machine; only legal while holding the lock
    fn transition_locked(&self, rt: &mut RuntimeState, to: ProviderState) -> Result<()> {
        let from = self.state.get();
        if from == to {
            return Ok(());
        }
        if !transition_allowed(from, to) {
            return Err(Error::InvalidStateTransition {
                provider_id: self.id.clone(),
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        self.state.set(to);
        rt.pending_events.push(DomainEvent::ProviderStateChanged {
            meta: EventMeta::new(),
            provider_id: self.id.clone(),
            old_state: from.as_str().to_string(),
            new_state: to.as_str().to_string(),
        });
        Ok(())
    }

    /// Spawn/dial and handshake; expects the lock to be held.
    async fn start_locked(&self, rt: &mut RuntimeState) -> Result<()> {
        let started = Instant::now();

        if let Some(old) = rt.client.take() {
            old.close().await;
        }
        if self.state.get() != ProviderState::Starting {
            self.transition_locked(rt, ProviderState::Starting)?;
        }

        match transport::connect(&self.id, &self.config).await {
            Ok((client, discovered)) => {
                // Keep a predefined catalog when discovery yields nothing;
                // otherwise the live catalog wins.
                if !discovered.is_empty() || rt.tools.is_empty() {
                    rt.tools = discovered;
                }
                rt.client = Some(client);
                rt.health.record_success();
                rt.last_used = Some(Self::now_epoch());
                self.transition_locked(rt, ProviderState::Ready)?;

                #[allow(clippy::cast_possible_truncation)]
                let startup_ms = started.elapsed().as_millis() as u64;
                rt.pending_events.push(DomainEvent::ProviderStarted {
                    meta: EventMeta::new(),
                    provider_id: self.id.clone(),
                    mode: self.config.mode.as_str().to_string(),
                    tools_count: rt.tools.len(),
                    startup_ms,
                });
                info!(provider_id = %self.id, tools = rt.tools.len(), startup_ms, "provider started");
                Ok(())
            }
            Err(e) => {
                self.transition_locked(rt, ProviderState::Dead)?;
                rt.health.record_failure();
                let reason = e.to_string();
                let suggestion = transport::startup_suggestion(&reason);
                warn!(provider_id = %self.id, error = %reason, "provider start failed");
                Err(Error::ProviderStart {
                    provider_id: self.id.clone(),
                    reason,
                    suggestion,
                })
            }
        }
    }

    async fn ensure_ready_locked(&self, rt: &mut RuntimeState) -> Result<()> {
        match self.state.get() {
            ProviderState::Ready => Ok(()),
            // DEGRADED and DEAD both sit behind the backoff clock; a new
            // start attempt is only admitted once it has elapsed.
            ProviderState::Degraded | ProviderState::Dead => {
                if !rt.health.can_retry() {
                    return Err(Error::CannotStartProvider {
                        provider_id: self.id.clone(),
                        retry_in: rt.health.time_until_retry(),
                    });
                }
                self.start_locked(rt).await
            }
            ProviderState::Cold | ProviderState::Starting => self.start_locked(rt).await,
        }
    }

    /// Bring the provider to READY; idempotent.
    ///
    /// From COLD or DEAD this spawns and handshakes. From DEGRADED it
    /// honors the backoff clock and fails with `cannot_start_provider`
    /// until a retry is allowed.
    pub async fn ensure_ready(&self) -> Result<()> {
        let mut rt = self.runtime.lock().await;
        self.ensure_ready_locked(&mut rt).await
    }

    /// Invoke a tool; the hot path.
    pub async fn invoke_tool(
        &self,
        tool_name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let correlation_id = Uuid::new_v4().to_string();

        // Bookkeeping phase: ensure readiness, validate the tool, announce
        // the invocation. The RPC itself runs outside the lock so calls on
        // the same provider proceed concurrently.
        let client = {
            let mut rt = self.runtime.lock().await;
            self.ensure_ready_locked(&mut rt).await?;

            if !rt.tools.contains(tool_name) {
                return Err(Error::ToolNotFound {
                    provider_id: self.id.clone(),
                    tool_name: tool_name.to_string(),
                });
            }

            rt.pending_events.push(DomainEvent::ToolInvocationRequested {
                meta: EventMeta::new(),
                provider_id: self.id.clone(),
                tool_name: tool_name.to_string(),
                correlation_id: correlation_id.clone(),
            });

            rt.client
                .clone()
                .ok_or_else(|| Error::ClientNotConnected("no client after start".to_string()))?
        };

        let started = Instant::now();
        let outcome = client
            .call(
                "tools/call",
                Some(serde_json::json!({"name": tool_name, "arguments": arguments})),
                timeout,
            )
            .await;
        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = started.elapsed().as_millis() as u64;

        let mut rt = self.runtime.lock().await;
        match outcome {
            Ok(response) => {
                if let Some(rpc_err) = response.error {
                    // The provider answered: the transport is healthy, the
                    // call itself was bad. Totals only.
                    rt.health.record_invocation_failure();
                    rt.pending_events.push(DomainEvent::ToolInvocationFailed {
                        meta: EventMeta::new(),
                        provider_id: self.id.clone(),
                        tool_name: tool_name.to_string(),
                        correlation_id,
                        error_message: rpc_err.message.clone(),
                        error_type: "tool_invocation_error".to_string(),
                    });
                    Err(Error::ToolInvocation {
                        provider_id: self.id.clone(),
                        tool_name: tool_name.to_string(),
                        code: rpc_err.code,
                        message: rpc_err.message,
                    })
                } else {
                    let result = response.result.unwrap_or(Value::Null);
                    rt.health.record_success();
                    rt.last_used = Some(Self::now_epoch());
                    let result_size_bytes =
                        serde_json::to_string(&result).map(|s| s.len()).unwrap_or(0);
                    rt.pending_events.push(DomainEvent::ToolInvocationCompleted {
                        meta: EventMeta::new(),
                        provider_id: self.id.clone(),
                        tool_name: tool_name.to_string(),
                        correlation_id,
                        duration_ms,
                        result_size_bytes,
                    });
                    Ok(result)
                }
            }
            Err(Error::ClientTimeout(_)) => {
                rt.health.record_failure();
                rt.pending_events.push(DomainEvent::ToolInvocationFailed {
                    meta: EventMeta::new(),
                    provider_id: self.id.clone(),
                    tool_name: tool_name.to_string(),
                    correlation_id,
                    error_message: format!("timed out after {}s", timeout.as_secs_f64()),
                    error_type: "tool_timeout".to_string(),
                });
                self.maybe_degrade_locked(&mut rt, "tool timeout")?;
                Err(Error::ToolTimeout {
                    provider_id: self.id.clone(),
                    tool_name: tool_name.to_string(),
                    timeout,
                })
            }
            Err(e) => {
                // Transport fault: the client is gone under us.
                rt.health.record_failure();
                rt.pending_events.push(DomainEvent::ToolInvocationFailed {
                    meta: EventMeta::new(),
                    provider_id: self.id.clone(),
                    tool_name: tool_name.to_string(),
                    correlation_id,
                    error_message: e.to_string(),
                    error_type: e.kind().to_string(),
                });
                if let Some(client) = rt.client.take() {
                    client.close().await;
                }
                if self.state.get() != ProviderState::Dead {
                    self.transition_locked(&mut rt, ProviderState::Dead)?;
                }
                Err(e)
            }
        }
    }

    /// Degrade when over the threshold; only from READY
    fn maybe_degrade_locked(&self, rt: &mut RuntimeState, reason: &str) -> Result<()> {
        if rt.health.should_degrade() && self.state.get() == ProviderState::Ready {
            self.transition_locked(rt, ProviderState::Degraded)?;
            rt.pending_events.push(DomainEvent::ProviderDegraded {
                meta: EventMeta::new(),
                provider_id: self.id.clone(),
                consecutive_failures: rt.health.consecutive_failures(),
                total_failures: rt.health.total_failures(),
                reason: reason.to_string(),
            });
            warn!(provider_id = %self.id, reason, "provider degraded");
        }
        Ok(())
    }

    /// Active health probe. Returns `true` when the provider is usable.
    ///
    /// COLD providers pass trivially (nothing to check), DEAD providers
    /// fail trivially. DEGRADED providers in their backoff window are not
    /// probed. A DEGRADED provider whose probe succeeds returns to READY.
    pub async fn health_check(&self) -> bool {
        match self.state.get() {
            ProviderState::Cold => return true,
            ProviderState::Dead => return false,
            _ => {}
        }

        let mut rt = self.runtime.lock().await;
        if self.state.get() == ProviderState::Degraded && !rt.health.can_retry() {
            return false;
        }

        let started = Instant::now();
        let probe: Result<()> = match rt.client.clone().filter(|c| c.is_alive()) {
            Some(client) => client
                .call("ping", None, HEALTH_PROBE_TIMEOUT)
                .await
                // An RPC error response (e.g. method not found) still proves
                // the transport round-trips; only transport faults fail.
                .map(|_| ()),
            // No live client under a live state: the transport died. Record
            // the death, then a successful re-handshake is the probe.
            None => {
                if self.state.get() == ProviderState::Ready {
                    match self.transition_locked(&mut rt, ProviderState::Dead) {
                        Ok(()) => self.start_locked(&mut rt).await,
                        Err(e) => Err(e),
                    }
                } else {
                    self.start_locked(&mut rt).await
                }
            }
        };
        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = started.elapsed().as_millis() as u64;

        match probe {
            Ok(()) => {
                rt.health.record_success();
                rt.pending_events.push(DomainEvent::HealthCheckPassed {
                    meta: EventMeta::new(),
                    provider_id: self.id.clone(),
                    duration_ms,
                });
                if self.state.get() == ProviderState::Degraded {
                    if let Err(e) = self.transition_locked(&mut rt, ProviderState::Ready) {
                        warn!(provider_id = %self.id, error = %e, "recovery transition failed");
                    }
                }
                true
            }
            Err(e) => {
                // start_locked already recorded its own failure and moved
                // the machine to DEAD; only record plain probe failures.
                let start_failure = matches!(e, Error::ProviderStart { .. });
                if !start_failure {
                    rt.health.record_failure();
                }
                let consecutive_failures = rt.health.consecutive_failures();
                rt.pending_events.push(DomainEvent::HealthCheckFailed {
                    meta: EventMeta::new(),
                    provider_id: self.id.clone(),
                    consecutive_failures,
                    error_message: e.to_string(),
                });

                let client_dead = rt.client.as_ref().is_none_or(|c| !c.is_alive());
                if start_failure {
                    // already DEAD
                } else if client_dead {
                    if let Some(client) = rt.client.take() {
                        client.close().await;
                    }
                    if self.state.get() != ProviderState::Dead {
                        let _ = self.transition_locked(&mut rt, ProviderState::Dead);
                    }
                } else if let Err(e) = self.maybe_degrade_locked(&mut rt, "health check failed") {
                    warn!(provider_id = %self.id, error = %e, "degrade transition failed");
                }
                false
            }
        }
    }

    /// Stop the provider when it has been idle past its TTL.
    ///
    /// Uses wall clock deliberately: operators expect idle GC to line up
    /// with their watches across suspend/resume.
    pub async fn maybe_shutdown_idle(&self) -> bool {
        if self.state.get() != ProviderState::Ready {
            return false;
        }
        let mut rt = self.runtime.lock().await;
        if self.state.get() != ProviderState::Ready {
            return false;
        }
        let Some(last_used) = rt.last_used else {
            return false;
        };
        let idle_s = Self::now_epoch() - last_used;
        if idle_s <= self.config.idle_ttl.as_secs_f64() {
            return false;
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let idle_duration_s = idle_s as u64;
        rt.pending_events.push(DomainEvent::ProviderIdleDetected {
            meta: EventMeta::new(),
            provider_id: self.id.clone(),
            idle_duration_s,
            last_used_at: last_used,
        });
        if let Err(e) = self.stop_locked(&mut rt, "idle").await {
            warn!(provider_id = %self.id, error = %e, "idle shutdown failed");
            return false;
        }
        true
    }

    async fn stop_locked(&self, rt: &mut RuntimeState, reason: &str) -> Result<()> {
        if self.state.get() == ProviderState::Cold {
            return Ok(());
        }
        if let Some(client) = rt.client.take() {
            client.close().await;
        }
        self.transition_locked(rt, ProviderState::Cold)?;
        rt.pending_events.push(DomainEvent::ProviderStopped {
            meta: EventMeta::new(),
            provider_id: self.id.clone(),
            reason: reason.to_string(),
        });
        info!(provider_id = %self.id, reason, "provider stopped");
        Ok(())
    }

    /// Stop the provider; idempotent (a second stop is a no-op)
    pub async fn stop(&self, reason: &str) -> Result<()> {
        let mut rt = self.runtime.lock().await;
        self.stop_locked(&mut rt, reason).await
    }

    /// Immediate shutdown (`stop` with reason "shutdown")
    pub async fn shutdown(&self) -> Result<()> {
        self.stop("shutdown").await
    }

    /// Drain and return every event queued since the previous drain.
    ///
    /// This is the only way events leave the aggregate.
    pub async fn collect_events(&self) -> Vec<DomainEvent> {
        let mut rt = self.runtime.lock().await;
        std::mem::take(&mut rt.pending_events)
    }

    /// Drain the queue and publish while still holding the provider's lock,
    /// so handlers observe this provider's events in occurrence order.
    pub async fn drain_and_publish(&self, bus: &EventBus) {
        let mut rt = self.runtime.lock().await;
        for event in rt.pending_events.drain(..) {
            bus.publish(&event);
        }
    }

    /// Current tool catalog (predefined catalogs are visible in COLD)
    pub async fn tools(&self) -> ToolCatalog {
        self.runtime.lock().await.tools.clone()
    }

    /// Health metrics snapshot
    pub async fn health_snapshot(&self) -> HealthSnapshot {
        self.runtime.lock().await.health.snapshot()
    }

    /// Set an opaque metadata entry (used by discovery and operators)
    pub async fn set_metadata(&self, key: &str, value: Value) {
        self.runtime
            .lock()
            .await
            .metadata
            .insert(key.to_string(), value);
    }

    /// One-line summary for listings
    pub async fn summary(&self) -> Value {
        let rt = self.runtime.lock().await;
        serde_json::json!({
            "provider": self.id,
            "state": self.state.get().as_str(),
            "mode": self.config.mode.as_str(),
            "tools_count": rt.tools.len(),
            "last_used_at": rt.last_used,
            "description": self.config.description,
        })
    }

    /// Full detail view for `GetProviderQuery`
    pub async fn details(&self) -> Value {
        let rt = self.runtime.lock().await;
        serde_json::json!({
            "provider": self.id,
            "state": self.state.get().as_str(),
            "mode": self.config.mode.as_str(),
            "tools": rt.tools.names(),
            "health": rt.health.snapshot(),
            "last_used_at": rt.last_used,
            "metadata": rt.metadata,
            "description": self.config.description,
            "idle_ttl_s": self.config.idle_ttl.as_secs(),
        })
    }
}
