//! Configuration reload: load, diff, apply

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{info, warn};

use crate::application::commands::{Command, ReloadConfigurationCommand};
use crate::bus::{CommandHandler, EventBus};
use crate::config::Config;
use crate::domain::events::{DomainEvent, EventMeta};
use crate::domain::group::ProviderGroup;
use crate::domain::provider::Provider;
use crate::repository::ProviderRepository;
use crate::{Error, Result};

/// Applies configuration reloads.
///
/// The new file is loaded and validated before anything is touched, so a
/// broken config never commits. The diff against the running provider set:
/// *removed* providers are stopped and dropped, *added* providers are
/// instantiated, *modified* providers (per the restart-relevant field set)
/// are stopped and reinstantiated, *unchanged* providers are preserved
/// without interruption. Groups are rebuilt from the new config.
pub struct ReloadConfigurationHandler {
    repository: Arc<ProviderRepository>,
    groups: Arc<DashMap<String, Arc<ProviderGroup>>>,
    event_bus: Arc<EventBus>,
}

impl ReloadConfigurationHandler {
    /// Create the handler
    #[must_use]
    pub fn new(
        repository: Arc<ProviderRepository>,
        groups: Arc<DashMap<String, Arc<ProviderGroup>>>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            repository,
            groups,
            event_bus,
        }
    }

    async fn apply(&self, command: &ReloadConfigurationCommand) -> Result<Value> {
        let started = Instant::now();
        let new_config = Config::load(Some(Path::new(&command.config_path)))?;

        // Diff the declared providers against the running set.
        let mut added: Vec<String> = Vec::new();
        let mut removed: Vec<String> = Vec::new();
        let mut updated: Vec<String> = Vec::new();
        let mut unchanged: Vec<String> = Vec::new();

        for provider in self.repository.get_all() {
            match new_config.providers.get(provider.id()) {
                None => removed.push(provider.id().to_string()),
                Some(new_spec) => {
                    if provider.config().requires_restart(new_spec) {
                        updated.push(provider.id().to_string());
                    } else {
                        unchanged.push(provider.id().to_string());
                    }
                }
            }
        }
        for id in new_config.providers.keys() {
            if !self.repository.exists(id) {
                added.push(id.clone());
            }
        }
        added.sort();
        removed.sort();
        updated.sort();
        unchanged.sort();

        info!(
            added = added.len(),
            removed = removed.len(),
            updated = updated.len(),
            unchanged = unchanged.len(),
            "config reload diff calculated"
        );

        // Stop providers leaving or changing. A stop failure is logged and
        // tolerated; the stale instance is replaced regardless.
        let reason = "config_reload";
        for id in removed.iter().chain(updated.iter()) {
            if let Some(provider) = self.repository.get(id) {
                let stop = if command.graceful {
                    provider.stop(reason).await
                } else {
                    provider.shutdown().await
                };
                if let Err(e) = stop {
                    warn!(provider_id = %id, error = %e, "provider stop failed during reload");
                }
                provider.drain_and_publish(&self.event_bus).await;
            }
        }

        for id in &removed {
            self.repository.remove(id);
        }
        for id in &updated {
            self.repository.remove(id);
        }

        // Instantiate added and updated providers from the new spec.
        for id in added.iter().chain(updated.iter()) {
            let spec = new_config
                .providers
                .get(id)
                .ok_or_else(|| Error::Internal(format!("diff lost provider '{id}'")))?;
            let provider = Provider::from_config(id, spec.clone())?;
            self.repository.add(provider)?;
        }

        // Groups are cheap to rebuild: they hold no process state.
        self.groups.clear();
        for (group_id, group_config) in &new_config.groups {
            let group = Arc::new(ProviderGroup::new(group_id, group_config));
            for member in &group_config.members {
                if let Some(provider) = self.repository.get(&member.provider) {
                    group.add_member(provider, member.weight, member.priority);
                }
            }
            self.groups.insert(group_id.clone(), group);
        }

        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = started.elapsed().as_millis() as u64;

        self.event_bus.publish(&DomainEvent::ConfigurationReloaded {
            meta: EventMeta::new(),
            config_path: command.config_path.clone(),
            providers_added: added.clone(),
            providers_removed: removed.clone(),
            providers_updated: updated.clone(),
            providers_unchanged: unchanged.clone(),
            duration_ms,
        });

        info!(
            config_path = %command.config_path,
            duration_ms,
            "configuration reloaded"
        );

        Ok(serde_json::json!({
            "added": added,
            "removed": removed,
            "updated": updated,
            "unchanged": unchanged,
            "duration_ms": duration_ms,
        }))
    }
}

#[async_trait]
impl CommandHandler for ReloadConfigurationHandler {
    async fn handle(&self, command: Command) -> Result<Value> {
        let Command::ReloadConfiguration(command) = command else {
            return Err(Error::Internal(
                "reload handler received a foreign command".to_string(),
            ));
        };

        self.event_bus
            .publish(&DomainEvent::ConfigurationReloadRequested {
                meta: EventMeta::new(),
                config_path: command.config_path.clone(),
                requested_by: command.requested_by.clone(),
            });

        match self.apply(&command).await {
            Ok(result) => Ok(result),
            Err(e) => {
                self.event_bus
                    .publish(&DomainEvent::ConfigurationReloadFailed {
                        meta: EventMeta::new(),
                        config_path: command.config_path.clone(),
                        reason: e.to_string(),
                        error_type: e.kind().to_string(),
                    });
                warn!(
                    config_path = %command.config_path,
                    error = %e,
                    "configuration reload failed"
                );
                Err(Error::Configuration(format!(
                    "configuration reload failed: {e}"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    fn handler() -> (
        ReloadConfigurationHandler,
        Arc<ProviderRepository>,
        Arc<DashMap<String, Arc<ProviderGroup>>>,
    ) {
        let repository = Arc::new(ProviderRepository::new());
        let groups = Arc::new(DashMap::new());
        let event_bus = Arc::new(EventBus::new());
        (
            ReloadConfigurationHandler::new(
                Arc::clone(&repository),
                Arc::clone(&groups),
                event_bus,
            ),
            repository,
            groups,
        )
    }

    fn reload_command(path: &Path) -> Command {
        Command::ReloadConfiguration(ReloadConfigurationCommand {
            config_path: path.to_string_lossy().into_owned(),
            graceful: true,
            requested_by: "test".into(),
        })
    }

    #[tokio::test]
    async fn initial_reload_adds_all_providers() {
        let (handler, repository, _) = handler();
        let file = write_config(
            r#"
providers:
  a:
    mode: subprocess
    command: ["true"]
  b:
    mode: subprocess
    command: ["true"]
"#,
        );

        let result = handler.handle(reload_command(file.path())).await.unwrap();
        assert_eq!(result["added"], serde_json::json!(["a", "b"]));
        assert_eq!(result["removed"], serde_json::json!([]));
        assert_eq!(repository.count(), 2);
    }

    #[tokio::test]
    async fn byte_identical_reload_is_a_noop() {
        let (handler, _, _) = handler();
        let file = write_config(
            r#"
providers:
  a:
    mode: subprocess
    command: ["true"]
"#,
        );

        handler.handle(reload_command(file.path())).await.unwrap();
        let result = handler.handle(reload_command(file.path())).await.unwrap();
        assert_eq!(result["added"], serde_json::json!([]));
        assert_eq!(result["removed"], serde_json::json!([]));
        assert_eq!(result["updated"], serde_json::json!([]));
        assert_eq!(result["unchanged"], serde_json::json!(["a"]));
    }

    #[tokio::test]
    async fn diff_classifies_added_removed_updated_unchanged() {
        let (handler, repository, _) = handler();
        let before = write_config(
            r#"
providers:
  a:
    mode: subprocess
    command: ["true"]
  b:
    mode: subprocess
    command: ["true"]
  c:
    mode: subprocess
    command: ["true"]
"#,
        );
        handler.handle(reload_command(before.path())).await.unwrap();

        // A' differs in env, B unchanged, C gone, D new.
        let after = write_config(
            r#"
providers:
  a:
    mode: subprocess
    command: ["true"]
    env:
      MODE: fast
  b:
    mode: subprocess
    command: ["true"]
  d:
    mode: subprocess
    command: ["true"]
"#,
        );
        let result = handler.handle(reload_command(after.path())).await.unwrap();
        assert_eq!(result["added"], serde_json::json!(["d"]));
        assert_eq!(result["removed"], serde_json::json!(["c"]));
        assert_eq!(result["updated"], serde_json::json!(["a"]));
        assert_eq!(result["unchanged"], serde_json::json!(["b"]));

        assert!(repository.exists("a"));
        assert!(repository.exists("b"));
        assert!(!repository.exists("c"));
        assert!(repository.exists("d"));
        // The updated provider carries the new spec.
        assert_eq!(
            repository.get("a").unwrap().config().env.get("MODE"),
            Some(&"fast".to_string())
        );
    }

    #[tokio::test]
    async fn invalid_config_fails_atomically() {
        let (handler, repository, _) = handler();
        let good = write_config(
            r#"
providers:
  a:
    mode: subprocess
    command: ["true"]
"#,
        );
        handler.handle(reload_command(good.path())).await.unwrap();

        // Subprocess without a command is rejected at validation.
        let broken = write_config("providers:\n  z:\n    mode: subprocess\n");
        let err = handler
            .handle(reload_command(broken.path()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "configuration_error");
        // Previous provider set is preserved.
        assert!(repository.exists("a"));
        assert!(!repository.exists("z"));
        assert_eq!(repository.count(), 1);
    }

    #[tokio::test]
    async fn malformed_provider_id_fails_before_anything_is_stopped() {
        let (handler, repository, _) = handler();
        let good = write_config(
            r#"
providers:
  a:
    mode: subprocess
    command: ["true"]
"#,
        );
        handler.handle(reload_command(good.path())).await.unwrap();

        // The new file drops "a" and adds a provider whose key fails the
        // id format check. Load-time validation must reject it before the
        // diff touches the repository, so "a" survives untouched.
        let bad_id = write_config(
            r#"
providers:
  "has space":
    mode: subprocess
    command: ["true"]
"#,
        );
        let err = handler
            .handle(reload_command(bad_id.path()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "configuration_error");
        assert!(repository.exists("a"));
        assert_eq!(repository.count(), 1);
    }

    #[tokio::test]
    async fn groups_are_rebuilt_from_the_new_config() {
        let (handler, _, groups) = handler();
        let file = write_config(
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
    strategy: round_robin
    members:
      - provider: a
      - provider: b
"#,
        );
        handler.handle(reload_command(file.path())).await.unwrap();
        let group = groups.get("workers").unwrap();
        assert_eq!(group.total_count(), 2);
    }
}
