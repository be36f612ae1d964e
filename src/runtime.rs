//! Composition root
//!
//! Builds and wires every component: repository, buses, groups, rate
//! limiter, middleware, registry facade, sagas and workers. No globals,
//! no singletons; everything the system needs hangs off [`Runtime`].

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::application::commands::CommandKind;
use crate::application::handlers::{ProviderCommandHandler, ProviderQueryHandler};
use crate::application::queries::QueryKind;
use crate::application::reload::ReloadConfigurationHandler;
use crate::bus::{CommandBus, EventBus, QueryBus};
use crate::config::Config;
use crate::domain::group::ProviderGroup;
use crate::domain::provider::Provider;
use crate::failsafe::RateLimiter;
use crate::middleware::ToolMiddleware;
use crate::registry::Registry;
use crate::repository::ProviderRepository;
use crate::saga::SagaManager;
use crate::subscribers::{SecurityEventHandler, subscribe_logging_handler};
use crate::workers::{BackgroundWorker, ConfigWatcher, WorkerTask};
use crate::Result;

/// The wired system
pub struct Runtime {
    /// Effective configuration at build time
    pub config: Config,
    /// Config file path, when loaded from disk (enables the watcher)
    pub config_path: Option<PathBuf>,
    /// Provider collection
    pub repository: Arc<ProviderRepository>,
    /// Group collection
    pub groups: Arc<DashMap<String, Arc<ProviderGroup>>>,
    /// Domain event bus
    pub event_bus: Arc<EventBus>,
    /// Command bus
    pub command_bus: Arc<CommandBus>,
    /// Query bus
    pub query_bus: Arc<QueryBus>,
    /// Security telemetry sink
    pub security: Arc<SecurityEventHandler>,
    /// Front-door facade
    pub registry: Arc<Registry>,
    /// Saga manager
    pub saga_manager: Arc<SagaManager>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Build and wire the system from configuration.
    ///
    /// Providers and groups are instantiated COLD; nothing is spawned here.
    pub fn build(config: Config, config_path: Option<PathBuf>) -> Result<Arc<Self>> {
        config.validate()?;

        let repository = Arc::new(ProviderRepository::new());
        let groups: Arc<DashMap<String, Arc<ProviderGroup>>> = Arc::new(DashMap::new());
        let event_bus = Arc::new(EventBus::new());
        let command_bus = Arc::new(CommandBus::new());
        let query_bus = Arc::new(QueryBus::new());
        let security = Arc::new(SecurityEventHandler::new());
        let rate_limiter = Arc::new(RateLimiter::new(&config.rate_limit));

        // Ambient subscribers first so bootstrap events are observed too.
        subscribe_logging_handler(&event_bus);

        // Providers and groups from config.
        for (id, provider_config) in &config.providers {
            let provider = Provider::from_config(id, provider_config.clone())?;
            repository.add(provider)?;
        }
        for (group_id, group_config) in &config.groups {
            let group = Arc::new(ProviderGroup::new(group_id, group_config));
            for member in &group_config.members {
                if let Some(provider) = repository.get(&member.provider) {
                    group.add_member(provider, member.weight, member.priority);
                }
            }
            // Bootstrap membership events are published immediately.
            for event in group.collect_events() {
                event_bus.publish(&event);
            }
            groups.insert(group_id.clone(), group);
        }

        // Command and query handlers.
        let provider_handler = Arc::new(ProviderCommandHandler::new(
            Arc::clone(&repository),
            Arc::clone(&event_bus),
        ));
        for kind in [
            CommandKind::StartProvider,
            CommandKind::StopProvider,
            CommandKind::InvokeTool,
            CommandKind::HealthCheck,
            CommandKind::ShutdownIdleProviders,
            CommandKind::LoadProvider,
            CommandKind::UnloadProvider,
        ] {
            command_bus.register(kind, Arc::clone(&provider_handler) as _)?;
        }
        command_bus.register(
            CommandKind::ReloadConfiguration,
            Arc::new(ReloadConfigurationHandler::new(
                Arc::clone(&repository),
                Arc::clone(&groups),
                Arc::clone(&event_bus),
            )),
        )?;

        let query_handler = Arc::new(ProviderQueryHandler::new(Arc::clone(&repository)));
        for kind in [
            QueryKind::ListProviders,
            QueryKind::GetProvider,
            QueryKind::GetProviderTools,
        ] {
            query_bus.register(kind, Arc::clone(&query_handler) as _)?;
        }

        // Sagas.
        let saga_manager = Arc::new(SagaManager::new());
        saga_manager.register_group_rebalance_saga(&event_bus, Arc::clone(&groups));
        saga_manager.register_config_reload_saga(&event_bus);

        // Front door.
        let middleware = ToolMiddleware::new(rate_limiter, Arc::clone(&security));
        let registry = Arc::new(Registry::new(
            Arc::clone(&repository),
            Arc::clone(&groups),
            Arc::clone(&command_bus),
            Arc::clone(&query_bus),
            Arc::clone(&event_bus),
            middleware,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            providers = repository.count(),
            groups = groups.len(),
            "runtime assembled"
        );

        Ok(Arc::new(Self {
            config,
            config_path,
            repository,
            groups,
            event_bus,
            command_bus,
            query_bus,
            security,
            registry,
            saga_manager,
            shutdown_tx,
            shutdown_rx,
            workers: Mutex::new(Vec::new()),
        }))
    }

    /// Start background workers and auto-start groups that ask for it
    pub async fn start(&self) {
        // Snapshot first: group startup suspends, and map guards must not
        // be held across await points.
        let groups: Vec<Arc<ProviderGroup>> = self
            .groups
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for group in groups {
            if group.auto_start() {
                let started = group.start_all().await;
                for member in group.members() {
                    member.provider().drain_and_publish(&self.event_bus).await;
                }
                group.rebalance();
                for event in group.collect_events() {
                    self.event_bus.publish(&event);
                }
                info!(group_id = %group.id(), started, "group auto-started");
            }
        }

        let mut workers = self.workers.lock();
        workers.push(
            BackgroundWorker::new(
                Arc::clone(&self.repository),
                Arc::clone(&self.event_bus),
                self.config.workers.gc_interval,
                WorkerTask::Gc,
            )
            .spawn(self.shutdown_rx.clone()),
        );
        workers.push(
            BackgroundWorker::new(
                Arc::clone(&self.repository),
                Arc::clone(&self.event_bus),
                self.config.workers.health_interval,
                WorkerTask::HealthCheck,
            )
            .spawn(self.shutdown_rx.clone()),
        );

        if self.config.workers.watch_config {
            if let Some(ref path) = self.config_path {
                workers.push(
                    ConfigWatcher::new(
                        path.clone(),
                        Arc::clone(&self.command_bus),
                        self.config.workers.watch_interval,
                    )
                    .spawn(self.shutdown_rx.clone()),
                );
            }
        }
    }

    /// Graceful shutdown: stop workers, then stop every provider
    pub async fn shutdown(&self) {
        info!("runtime shutting down");
        let _ = self.shutdown_tx.send(true);

        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "worker did not shut down cleanly");
            }
        }

        for provider in self.repository.get_all() {
            if let Err(e) = provider.shutdown().await {
                warn!(provider_id = %provider.id(), error = %e, "provider shutdown failed");
            }
            provider.drain_and_publish(&self.event_bus).await;
        }
        info!("runtime shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_yaml(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn build_wires_providers_and_groups() {
        let config = config_yaml(
            r#"
providers:
  a:
    mode: subprocess
    command: ["true"]
  b:
    mode: subprocess
    command: ["true"]
groups:
  workers:
    members:
      - provider: a
      - provider: b
"#,
        );
        let runtime = Runtime::build(config, None).unwrap();
        assert_eq!(runtime.repository.count(), 2);
        assert_eq!(runtime.groups.get("workers").unwrap().total_count(), 2);
        assert_eq!(
            runtime.saga_manager.registered(),
            vec!["group_rebalance", "config_reload"]
        );
    }

    #[test]
    fn build_rejects_invalid_config() {
        let config = config_yaml(
            r#"
providers:
  bad:
    mode: subprocess
"#,
        );
        assert!(Runtime::build(config, None).is_err());
    }

    #[tokio::test]
    async fn start_and_shutdown_are_clean() {
        let config = config_yaml(
            r#"
providers:
  a:
    mode: subprocess
    command: ["true"]
"#,
        );
        let runtime = Runtime::build(config, None).unwrap();
        runtime.start().await;
        runtime.shutdown().await;
        // All providers end COLD after shutdown.
        for provider in runtime.repository.get_all() {
            assert_eq!(provider.state(), crate::domain::ProviderState::Cold);
        }
    }
}
