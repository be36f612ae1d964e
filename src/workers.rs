//! Background workers: idle GC, health sweeps, config-file watching
//!
//! One snapshot sweep per cycle over N providers instead of a timer per
//! provider; the repository lock is never held across provider I/O. Worker
//! cycles never propagate errors: every failure is logged and counted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use notify::{Event, EventKind as NotifyEventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::application::commands::{Command, ReloadConfigurationCommand};
use crate::bus::{CommandBus, EventBus};
use crate::domain::ProviderState;
use crate::repository::ProviderRepository;

/// Debounce window for file-change notifications; editors save in bursts
const WATCH_DEBOUNCE: Duration = Duration::from_secs(1);

/// What a background worker does on each cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerTask {
    /// Shut down providers idle past their TTL
    Gc,
    /// Actively health-check every provider
    HealthCheck,
}

impl WorkerTask {
    fn name(self) -> &'static str {
        match self {
            Self::Gc => "gc",
            Self::HealthCheck => "health_check",
        }
    }
}

/// Periodic sweep worker parameterized by task
pub struct BackgroundWorker {
    repository: Arc<ProviderRepository>,
    event_bus: Arc<EventBus>,
    interval: Duration,
    task: WorkerTask,
}

impl BackgroundWorker {
    /// Create a worker
    #[must_use]
    pub fn new(
        repository: Arc<ProviderRepository>,
        event_bus: Arc<EventBus>,
        interval: Duration,
        task: WorkerTask,
    ) -> Self {
        Self {
            repository,
            event_bus,
            interval,
            task,
        }
    }

    /// Spawn the worker loop; it runs until the shutdown signal flips
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(task = self.task.name(), interval_s = self.interval.as_secs(), "background worker started");
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick of a tokio interval fires immediately; swallow
            // it so the first sweep happens one full period after startup.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => self.run_cycle().await,
                    _ = shutdown.changed() => break,
                }
            }
            info!(task = self.task.name(), "background worker stopped");
        })
    }

    /// One sweep over a repository snapshot
    async fn run_cycle(&self) {
        let started = std::time::Instant::now();
        let snapshot = self.repository.get_all();
        let mut collected = 0usize;
        let mut unhealthy = 0usize;

        for provider in snapshot {
            match self.task {
                WorkerTask::Gc => {
                    if provider.maybe_shutdown_idle().await {
                        collected += 1;
                    }
                }
                WorkerTask::HealthCheck => {
                    let healthy = provider.health_check().await;
                    if !healthy && provider.state() != ProviderState::Cold {
                        unhealthy += 1;
                        warn!(provider_id = %provider.id(), "health check unhealthy");
                    }
                }
            }
            provider.drain_and_publish(&self.event_bus).await;
        }

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        debug!(
            task = self.task.name(),
            duration_ms,
            collected,
            unhealthy,
            "worker cycle complete"
        );
    }
}

/// Watches the configuration file and emits reload commands.
///
/// Prefers OS file notifications with a one-second debounce; falls back to
/// mtime polling when a watcher cannot be created.
pub struct ConfigWatcher {
    config_path: PathBuf,
    command_bus: Arc<CommandBus>,
    poll_interval: Duration,
}

impl ConfigWatcher {
    /// Create a watcher for `config_path`
    #[must_use]
    pub fn new(config_path: PathBuf, command_bus: Arc<CommandBus>, poll_interval: Duration) -> Self {
        Self {
            config_path,
            command_bus,
            poll_interval,
        }
    }

    /// Spawn the watch loop
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let (tx, mut rx) = mpsc::unbounded_channel::<()>();
            let watcher = self.try_start_notify(&tx);
            let notify_mode = watcher.is_some();
            info!(
                config_path = %self.config_path.display(),
                mode = if notify_mode { "notify" } else { "polling" },
                "config watcher started"
            );

            let mut last_mtime = self.mtime();
            loop {
                if notify_mode {
                    tokio::select! {
                        event = rx.recv() => {
                            if event.is_none() {
                                warn!("config watcher channel closed");
                                break;
                            }
                            self.debounce(&mut rx).await;
                            self.trigger_reload().await;
                        }
                        _ = shutdown.changed() => break,
                    }
                } else {
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {
                            let mtime = self.mtime();
                            if mtime > last_mtime {
                                last_mtime = mtime;
                                self.trigger_reload().await;
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }
            drop(watcher);
            info!("config watcher stopped");
        })
    }

    /// Start the OS watcher on the config file's directory (watching the
    /// file itself breaks with editors that rename-on-save)
    fn try_start_notify(&self, tx: &mpsc::UnboundedSender<()>) -> Option<RecommendedWatcher> {
        let Some(watch_dir) = self.config_path.parent().map(PathBuf::from) else {
            return None;
        };
        let file_name = self.config_path.file_name()?.to_os_string();
        let tx = tx.clone();

        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            let Ok(event) = result else { return };
            if !matches!(
                event.kind,
                NotifyEventKind::Modify(_) | NotifyEventKind::Create(_)
            ) {
                return;
            }
            if event
                .paths
                .iter()
                .any(|p| p.file_name() == Some(file_name.as_os_str()))
            {
                let _ = tx.send(());
            }
        })
        .map_err(|e| warn!(error = %e, "file watcher unavailable, falling back to polling"))
        .ok()?;

        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| warn!(error = %e, "file watch failed, falling back to polling"))
            .ok()?;
        Some(watcher)
    }

    /// Swallow the burst of events an editor save produces
    async fn debounce(&self, rx: &mut mpsc::UnboundedReceiver<()>) {
        loop {
            match tokio::time::timeout(WATCH_DEBOUNCE, rx.recv()).await {
                Ok(Some(())) => {}
                _ => break,
            }
        }
    }

    fn mtime(&self) -> SystemTime {
        std::fs::metadata(&self.config_path)
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH)
    }

    async fn trigger_reload(&self) {
        info!(config_path = %self.config_path.display(), "config change detected, reloading");
        let command = Command::ReloadConfiguration(ReloadConfigurationCommand {
            config_path: self.config_path.to_string_lossy().into_owned(),
            graceful: true,
            requested_by: "file_watcher".to_string(),
        });
        match self.command_bus.send(command).await {
            Ok(result) => info!(?result, "config reload triggered"),
            Err(e) => error!(error = %e, "config reload failed"),
        }
    }
}
