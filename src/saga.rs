//! Event-driven sagas
//!
//! Sagas react to domain events and trigger the next step of a workflow.
//! They hold no aggregate lock across dispatch and own no primary state;
//! everything they track is reconstructible from the event stream.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, EventHandlerFn};
use crate::domain::events::{DomainEvent, EventKind};
use crate::domain::group::ProviderGroup;

/// Registers and tracks the core sagas
#[derive(Default)]
pub struct SagaManager {
    registered: Mutex<Vec<&'static str>>,
}

impl SagaManager {
    /// Create an empty manager
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of registered sagas
    #[must_use]
    pub fn registered(&self) -> Vec<&'static str> {
        self.registered.lock().clone()
    }

    /// Group rebalance saga: reacts to health observations about any
    /// provider by rebalancing every group that provider is a member of.
    /// The rebalance runs outside the group's member lock, and resulting
    /// group events are published from here.
    pub fn register_group_rebalance_saga(
        &self,
        event_bus: &Arc<EventBus>,
        groups: Arc<DashMap<String, Arc<ProviderGroup>>>,
    ) {
        let bus = Arc::clone(event_bus);
        let handler: EventHandlerFn = Arc::new(move |event| {
            let Some(provider_id) = event.provider_id() else {
                return Ok(());
            };
            for entry in groups.iter() {
                let group = entry.value();
                if group.find_member(provider_id).is_none() {
                    continue;
                }
                debug!(
                    group_id = %group.id(),
                    provider_id,
                    event_kind = ?event.kind(),
                    "rebalance saga triggered"
                );
                group.rebalance();
                for group_event in group.collect_events() {
                    bus.publish(&group_event);
                }
            }
            Ok(())
        });

        for kind in [
            EventKind::ProviderDegraded,
            EventKind::HealthCheckFailed,
            EventKind::HealthCheckPassed,
            EventKind::ProviderStopped,
        ] {
            event_bus.subscribe(kind, Arc::clone(&handler));
        }
        self.registered.lock().push("group_rebalance");
        info!("group rebalance saga registered");
    }

    /// Configuration reload saga: correlates reload requests with their
    /// outcomes by config path. Tolerates replay (re-requesting an
    /// in-flight path just refreshes the timestamp) and out-of-order
    /// outcomes (an outcome without a request is logged and dropped).
    pub fn register_config_reload_saga(&self, event_bus: &Arc<EventBus>) {
        let pending: Arc<Mutex<HashMap<String, DateTime<Utc>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let on_request = {
            let pending = Arc::clone(&pending);
            let handler: EventHandlerFn = Arc::new(move |event| {
                if let DomainEvent::ConfigurationReloadRequested { config_path, .. } = event {
                    let mut pending = pending.lock();
                    if let Some(since) = pending.get(config_path) {
                        warn!(
                            %config_path,
                            pending_since = %since,
                            "reload requested while a previous reload is unresolved"
                        );
                    }
                    pending.insert(config_path.clone(), Utc::now());
                }
                Ok(())
            });
            handler
        };

        let on_outcome = {
            let pending = Arc::clone(&pending);
            let handler: EventHandlerFn = Arc::new(move |event| {
                let (config_path, success) = match event {
                    DomainEvent::ConfigurationReloaded { config_path, .. } => (config_path, true),
                    DomainEvent::ConfigurationReloadFailed { config_path, .. } => {
                        (config_path, false)
                    }
                    _ => return Ok(()),
                };
                if pending.lock().remove(config_path).is_none() {
                    debug!(%config_path, "reload outcome without a tracked request");
                }
                if !success {
                    info!(%config_path, "reload saga observed a failed reload; previous config remains active");
                }
                Ok(())
            });
            handler
        };

        event_bus.subscribe(EventKind::ConfigurationReloadRequested, on_request);
        event_bus.subscribe(EventKind::ConfigurationReloaded, Arc::clone(&on_outcome));
        event_bus.subscribe(EventKind::ConfigurationReloadFailed, on_outcome);
        self.registered.lock().push("config_reload");
        info!("config reload saga registered");
    }
}
