//! Provider group aggregate: load-balanced set of interchangeable providers

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use rand::RngExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::GroupConfig;
use crate::domain::events::{DomainEvent, EventMeta};
use crate::domain::provider::{Provider, ProviderState};
use crate::failsafe::{CircuitBreaker, CircuitState};

/// Member selection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancerStrategy {
    /// Rotate through in-rotation members
    #[default]
    RoundRobin,
    /// Virtual ring sized by member weights
    Weighted,
    /// Member with the fewest in-flight calls; ties broken least-recently-used
    LeastBusy,
    /// Lowest priority number first; round-robin within a priority
    Priority,
    /// Uniform over in-rotation members
    Random,
}

impl LoadBalancerStrategy {
    /// Lowercase label for status payloads
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::Weighted => "weighted",
            Self::LeastBusy => "least_busy",
            Self::Priority => "priority",
            Self::Random => "random",
        }
    }
}

/// Group availability, a pure function of rotation counts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    /// Enough healthy members
    Ready,
    /// Some healthy members, fewer than `min_healthy`
    Degraded,
    /// No member in rotation
    Unavailable,
}

impl GroupState {
    /// Lowercase label for status payloads
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Unavailable => "unavailable",
        }
    }
}

/// One member of a group: a provider plus its balancing and protection state
pub struct GroupMember {
    provider: Arc<Provider>,
    weight: u32,
    priority: u32,
    in_rotation: AtomicBool,
    circuit: CircuitBreaker,
    in_flight: AtomicU32,
    consecutive_ok: AtomicU32,
    consecutive_fail: AtomicU32,
    last_selected_ms: AtomicU64,
}

impl GroupMember {
    /// The member's provider
    #[must_use]
    pub fn provider(&self) -> &Arc<Provider> {
        &self.provider
    }

    /// The member's provider id
    #[must_use]
    pub fn provider_id(&self) -> &str {
        self.provider.id()
    }

    /// Whether the member currently takes traffic
    #[must_use]
    pub fn in_rotation(&self) -> bool {
        self.in_rotation.load(Ordering::Relaxed)
    }

    /// Current circuit state
    #[must_use]
    pub fn circuit_state(&self) -> CircuitState {
        self.circuit.state()
    }

    /// Mark one invocation in flight
    pub fn begin_invocation(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark one invocation finished
    pub fn end_invocation(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    fn status_value(&self) -> Value {
        serde_json::json!({
            "provider": self.provider.id(),
            "state": self.provider.state().as_str(),
            "in_rotation": self.in_rotation(),
            "circuit": self.circuit.state().as_str(),
            "weight": self.weight,
            "priority": self.priority,
            "in_flight": self.in_flight.load(Ordering::Relaxed),
        })
    }
}

/// Load-balanced set of interchangeable providers with per-member circuit
/// breaking and observation-driven rotation.
///
/// Group state is derived, never stored: it is a function of the members'
/// rotation bits against `min_healthy`.
pub struct ProviderGroup {
    id: String,
    strategy: LoadBalancerStrategy,
    min_healthy: u32,
    auto_start: bool,
    healthy_threshold: u32,
    unhealthy_threshold: u32,
    cb_config: crate::config::CircuitBreakerConfig,
    members: RwLock<Vec<Arc<GroupMember>>>,
    cursor: AtomicUsize,
    pending_events: Mutex<Vec<DomainEvent>>,
}

impl ProviderGroup {
    /// Create an empty group from configuration
    #[must_use]
    pub fn new(id: &str, config: &GroupConfig) -> Self {
        Self {
            id: id.to_string(),
            strategy: config.strategy,
            min_healthy: config.min_healthy,
            auto_start: config.auto_start,
            healthy_threshold: config.health.healthy_threshold,
            unhealthy_threshold: config.health.unhealthy_threshold,
            cb_config: config.circuit_breaker.clone(),
            members: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            pending_events: Mutex::new(Vec::new()),
        }
    }

    /// Group id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether members should be started eagerly
    #[must_use]
    pub fn auto_start(&self) -> bool {
        self.auto_start
    }

    /// Add a member; new members join the rotation immediately
    pub fn add_member(&self, provider: Arc<Provider>, weight: u32, priority: u32) {
        let member = Arc::new(GroupMember {
            circuit: CircuitBreaker::new(
                &format!("{}/{}", self.id, provider.id()),
                &self.cb_config,
            ),
            provider,
            weight: weight.max(1),
            priority,
            in_rotation: AtomicBool::new(true),
            in_flight: AtomicU32::new(0),
            consecutive_ok: AtomicU32::new(0),
            consecutive_fail: AtomicU32::new(0),
            last_selected_ms: AtomicU64::new(0),
        });
        let provider_id = member.provider_id().to_string();
        self.members.write().push(member);
        self.push_event(DomainEvent::GroupMemberAdded {
            meta: EventMeta::new(),
            group_id: self.id.clone(),
            provider_id,
        });
    }

    /// Remove a member by provider id; returns whether it was present
    pub fn remove_member(&self, provider_id: &str) -> bool {
        let mut members = self.members.write();
        let before = members.len();
        members.retain(|m| m.provider_id() != provider_id);
        let removed = members.len() < before;
        drop(members);
        if removed {
            self.push_event(DomainEvent::GroupMemberRemoved {
                meta: EventMeta::new(),
                group_id: self.id.clone(),
                provider_id: provider_id.to_string(),
            });
        }
        removed
    }

    /// Snapshot of the current members
    #[must_use]
    pub fn members(&self) -> Vec<Arc<GroupMember>> {
        self.members.read().clone()
    }

    /// Find a member by provider id
    #[must_use]
    pub fn find_member(&self, provider_id: &str) -> Option<Arc<GroupMember>> {
        self.members
            .read()
            .iter()
            .find(|m| m.provider_id() == provider_id)
            .cloned()
    }

    fn push_event(&self, event: DomainEvent) {
        self.pending_events.lock().push(event);
    }

    /// Drain the group's queued events
    #[must_use]
    pub fn collect_events(&self) -> Vec<DomainEvent> {
        std::mem::take(&mut *self.pending_events.lock())
    }

    /// Number of members in rotation
    #[must_use]
    pub fn healthy_count(&self) -> u32 {
        u32::try_from(
            self.members
                .read()
                .iter()
                .filter(|m| m.in_rotation())
                .count(),
        )
        .unwrap_or(u32::MAX)
    }

    /// Total member count
    #[must_use]
    pub fn total_count(&self) -> u32 {
        u32::try_from(self.members.read().len()).unwrap_or(u32::MAX)
    }

    /// Derived group state
    #[must_use]
    pub fn state(&self) -> GroupState {
        let healthy = self.healthy_count();
        if healthy == 0 {
            GroupState::Unavailable
        } else if healthy >= self.min_healthy {
            GroupState::Ready
        } else {
            GroupState::Degraded
        }
    }

    /// Whether any member can take a call
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.state() != GroupState::Unavailable
    }

    /// Select a member per the group's strategy, excluding the given
    /// provider ids (already-tried members during a retry).
    ///
    /// Returns `None` when no in-rotation member with a passable circuit
    /// remains. An OPEN circuit whose reset timeout has elapsed competes
    /// for its single half-open probe here; losing the probe race simply
    /// excludes the member from this selection.
    #[must_use]
    pub fn select_member_excluding(&self, excluded: &[&str]) -> Option<Arc<GroupMember>> {
        let mut candidates: Vec<Arc<GroupMember>> = self
            .members
            .read()
            .iter()
            .filter(|m| m.in_rotation() && !excluded.contains(&m.provider_id()))
            .filter(|m| m.circuit.state() != CircuitState::Open || m.circuit.retry_after_ms() == 0)
            .cloned()
            .collect();

        while !candidates.is_empty() {
            let index = self.pick(&candidates);
            let chosen = candidates[index].clone();
            // can_proceed consumes the half-open probe slot, so it is only
            // asked of the member we are about to hand out.
            if chosen.circuit.can_proceed() {
                chosen
                    .last_selected_ms
                    .store(epoch_millis_now(), Ordering::Relaxed);
                return Some(chosen);
            }
            candidates.remove(index);
        }
        None
    }

    /// Select a member per the group's strategy
    #[must_use]
    pub fn select_member(&self) -> Option<Arc<GroupMember>> {
        self.select_member_excluding(&[])
    }

    /// Index into `candidates` per the configured strategy
    fn pick(&self, candidates: &[Arc<GroupMember>]) -> usize {
        match self.strategy {
            LoadBalancerStrategy::RoundRobin => {
                self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len()
            }
            LoadBalancerStrategy::Weighted => {
                let total: u64 = candidates.iter().map(|m| u64::from(m.weight)).sum();
                let slot = (self.cursor.fetch_add(1, Ordering::Relaxed) as u64) % total.max(1);
                let mut cumulative = 0u64;
                for (i, member) in candidates.iter().enumerate() {
                    cumulative += u64::from(member.weight);
                    if slot < cumulative {
                        return i;
                    }
                }
                candidates.len() - 1
            }
            LoadBalancerStrategy::LeastBusy => candidates
                .iter()
                .enumerate()
                .min_by_key(|(_, m)| {
                    (
                        m.in_flight.load(Ordering::Relaxed),
                        m.last_selected_ms.load(Ordering::Relaxed),
                    )
                })
                .map_or(0, |(i, _)| i),
            LoadBalancerStrategy::Priority => {
                let best = candidates.iter().map(|m| m.priority).min().unwrap_or(0);
                let tier: Vec<usize> = candidates
                    .iter()
                    .enumerate()
                    .filter(|(_, m)| m.priority == best)
                    .map(|(i, _)| i)
                    .collect();
                tier[self.cursor.fetch_add(1, Ordering::Relaxed) % tier.len()]
            }
            LoadBalancerStrategy::Random => rand::rng().random_range(0..candidates.len()),
        }
    }

    /// Record a successful observation for a member
    pub fn report_success(&self, provider_id: &str) {
        let Some(member) = self.find_member(provider_id) else {
            return;
        };
        let circuit_before = member.circuit.state();
        member.circuit.record_success();
        member.consecutive_fail.store(0, Ordering::Relaxed);
        let ok = member.consecutive_ok.fetch_add(1, Ordering::Relaxed) + 1;

        if circuit_before != CircuitState::Closed && member.circuit.state() == CircuitState::Closed
        {
            self.push_event(DomainEvent::CircuitClosed {
                meta: EventMeta::new(),
                group_id: self.id.clone(),
                provider_id: provider_id.to_string(),
            });
        }

        if !member.in_rotation()
            && member.provider.state() == ProviderState::Ready
            && member.circuit.state() != CircuitState::Open
            && ok >= self.healthy_threshold
        {
            self.set_rotation(&member, true);
        }
    }

    /// Record a failed observation for a member
    pub fn report_failure(&self, provider_id: &str) {
        let Some(member) = self.find_member(provider_id) else {
            return;
        };
        let circuit_before = member.circuit.state();
        member.circuit.record_failure();
        member.consecutive_ok.store(0, Ordering::Relaxed);
        let failures = member.consecutive_fail.fetch_add(1, Ordering::Relaxed) + 1;

        if circuit_before != CircuitState::Open && member.circuit.state() == CircuitState::Open {
            self.push_event(DomainEvent::CircuitOpened {
                meta: EventMeta::new(),
                group_id: self.id.clone(),
                provider_id: provider_id.to_string(),
            });
        }

        if member.in_rotation() && failures >= self.unhealthy_threshold {
            self.set_rotation(&member, false);
        }
    }

    fn set_rotation(&self, member: &GroupMember, in_rotation: bool) {
        let was = member.in_rotation.swap(in_rotation, Ordering::Relaxed);
        if was == in_rotation {
            return;
        }
        info!(
            group_id = %self.id,
            provider_id = %member.provider_id(),
            in_rotation,
            "member rotation changed"
        );
        self.push_event(DomainEvent::GroupRotationChanged {
            meta: EventMeta::new(),
            group_id: self.id.clone(),
            provider_id: member.provider_id().to_string(),
            in_rotation,
        });
    }

    /// Reconcile rotation bits with member provider states and circuits.
    ///
    /// COLD and STARTING members stay eligible: they are lazily started at
    /// invocation time. Only DEGRADED/DEAD providers, open circuits and
    /// failure streaks take a member out.
    pub fn rebalance(&self) {
        let members = self.members();
        for member in &members {
            let provider_state = member.provider.state();
            let unhealthy = matches!(
                provider_state,
                ProviderState::Degraded | ProviderState::Dead
            ) || member.circuit.state() == CircuitState::Open
                || member.consecutive_fail.load(Ordering::Relaxed) >= self.unhealthy_threshold;

            if member.in_rotation() {
                if unhealthy {
                    self.set_rotation(member, false);
                }
            } else if provider_state == ProviderState::Ready
                && member.circuit.state() != CircuitState::Open
                && member.consecutive_ok.load(Ordering::Relaxed) >= self.healthy_threshold
            {
                self.set_rotation(member, true);
            }
        }
        debug!(
            group_id = %self.id,
            healthy = self.healthy_count(),
            total = self.total_count(),
            state = self.state().as_str(),
            "group rebalanced"
        );
    }

    /// Start every member concurrently; returns how many reached READY
    pub async fn start_all(&self) -> usize {
        let starts = self.members().into_iter().map(|member| async move {
            member.provider.ensure_ready().await.is_ok()
        });
        join_all(starts).await.into_iter().filter(|ok| *ok).count()
    }

    /// Stop every member concurrently
    pub async fn stop_all(&self) {
        let stops = self.members().into_iter().map(|member| async move {
            let _ = member.provider.stop("shutdown").await;
        });
        join_all(stops).await;
    }

    /// Status payload for listings
    #[must_use]
    pub fn to_status_value(&self) -> Value {
        let members: Vec<Value> = self.members().iter().map(|m| m.status_value()).collect();
        serde_json::json!({
            "group": self.id,
            "state": self.state().as_str(),
            "strategy": self.strategy.as_str(),
            "min_healthy": self.min_healthy,
            "healthy_count": self.healthy_count(),
            "total_count": self.total_count(),
            "members": members,
        })
    }
}

/// Current time as milliseconds since UNIX epoch
#[allow(clippy::cast_possible_truncation)]
fn epoch_millis_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
