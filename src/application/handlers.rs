//! Command and query handlers for provider operations

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::application::commands::{
    Command, InvokeToolCommand, LoadProviderCommand, StartProviderCommand, StopProviderCommand,
};
use crate::bus::{CommandHandler, EventBus, QueryHandler};
use crate::domain::{Provider, ProviderState};
use crate::application::queries::Query;
use crate::repository::ProviderRepository;
use crate::{Error, Result};

/// Executes provider lifecycle and invocation commands.
///
/// Every operation drains the touched provider's event queue and publishes
/// it before returning, success or failure, so observers never lag behind
/// the command result.
pub struct ProviderCommandHandler {
    repository: Arc<ProviderRepository>,
    event_bus: Arc<EventBus>,
}

impl ProviderCommandHandler {
    /// Create the handler
    #[must_use]
    pub fn new(repository: Arc<ProviderRepository>, event_bus: Arc<EventBus>) -> Self {
        Self {
            repository,
            event_bus,
        }
    }

    fn provider(&self, provider_id: &str) -> Result<Arc<Provider>> {
        self.repository
            .get(provider_id)
            .ok_or_else(|| Error::ProviderNotFound(provider_id.to_string()))
    }

    async fn start(&self, command: StartProviderCommand) -> Result<Value> {
        let provider = self.provider(&command.provider_id)?;
        let outcome = provider.ensure_ready().await;
        provider.drain_and_publish(&self.event_bus).await;
        outcome?;
        let tools = provider.tools().await;
        Ok(serde_json::json!({
            "provider": provider.id(),
            "state": provider.state().as_str(),
            "tools": tools.names(),
        }))
    }

    async fn stop(&self, command: StopProviderCommand) -> Result<Value> {
        let provider = self.provider(&command.provider_id)?;
        let reason = command.reason.unwrap_or_else(|| "shutdown".to_string());
        let outcome = provider.stop(&reason).await;
        provider.drain_and_publish(&self.event_bus).await;
        outcome?;
        Ok(serde_json::json!({
            "provider": provider.id(),
            "stopped": true,
            "reason": reason,
        }))
    }

    async fn invoke(&self, command: InvokeToolCommand) -> Result<Value> {
        let provider = self.provider(&command.provider_id)?;
        let outcome = provider
            .invoke_tool(&command.tool_name, command.arguments, command.timeout)
            .await;
        provider.drain_and_publish(&self.event_bus).await;
        outcome
    }

    async fn health_check(&self, provider_id: &str) -> Result<Value> {
        let provider = self.provider(provider_id)?;
        let healthy = provider.health_check().await;
        provider.drain_and_publish(&self.event_bus).await;
        Ok(serde_json::json!({
            "provider": provider.id(),
            "healthy": healthy,
        }))
    }

    async fn shutdown_idle(&self) -> Result<Value> {
        let mut stopped = 0;
        for provider in self.repository.get_all() {
            if provider.maybe_shutdown_idle().await {
                stopped += 1;
            }
            provider.drain_and_publish(&self.event_bus).await;
        }
        Ok(serde_json::json!({"stopped": stopped}))
    }

    async fn load(&self, command: LoadProviderCommand) -> Result<Value> {
        let provider = Provider::from_config(&command.provider_id, command.config)?;
        self.repository.add(Arc::clone(&provider))?;
        info!(provider_id = %command.provider_id, "provider loaded");
        Ok(serde_json::json!({
            "provider": command.provider_id,
            "loaded": true,
            "state": provider.state().as_str(),
        }))
    }

    async fn unload(&self, provider_id: &str) -> Result<Value> {
        let provider = self
            .repository
            .remove(provider_id)
            .ok_or_else(|| Error::ProviderNotFound(provider_id.to_string()))?;
        let outcome = provider.stop("unloaded").await;
        provider.drain_and_publish(&self.event_bus).await;
        outcome?;
        info!(provider_id, "provider unloaded");
        Ok(serde_json::json!({"provider": provider_id, "unloaded": true}))
    }
}

#[async_trait]
impl CommandHandler for ProviderCommandHandler {
    async fn handle(&self, command: Command) -> Result<Value> {
        match command {
            Command::StartProvider(cmd) => self.start(cmd).await,
            Command::StopProvider(cmd) => self.stop(cmd).await,
            Command::InvokeTool(cmd) => self.invoke(cmd).await,
            Command::HealthCheck(cmd) => self.health_check(&cmd.provider_id).await,
            Command::ShutdownIdleProviders(_) => self.shutdown_idle().await,
            Command::LoadProvider(cmd) => self.load(cmd).await,
            Command::UnloadProvider(cmd) => self.unload(&cmd.provider_id).await,
            Command::ReloadConfiguration(_) => Err(Error::Internal(
                "reload commands are handled by the reload handler".to_string(),
            )),
        }
    }
}

/// Executes read-only provider queries
pub struct ProviderQueryHandler {
    repository: Arc<ProviderRepository>,
}

impl ProviderQueryHandler {
    /// Create the handler
    #[must_use]
    pub fn new(repository: Arc<ProviderRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl QueryHandler for ProviderQueryHandler {
    async fn handle(&self, query: Query) -> Result<Value> {
        match query {
            Query::ListProviders(q) => {
                let filter = q
                    .state_filter
                    .as_deref()
                    .map(|label| {
                        ProviderState::parse(label).ok_or_else(|| {
                            Error::Validation(format!("unknown state filter '{label}'"))
                        })
                    })
                    .transpose()?;

                let mut summaries = Vec::new();
                for provider in self.repository.get_all() {
                    if filter.is_some_and(|state| provider.state() != state) {
                        continue;
                    }
                    summaries.push(provider.summary().await);
                }
                summaries.sort_by(|a, b| {
                    a["provider"]
                        .as_str()
                        .unwrap_or_default()
                        .cmp(b["provider"].as_str().unwrap_or_default())
                });
                Ok(Value::Array(summaries))
            }
            Query::GetProvider(q) => {
                let provider = self
                    .repository
                    .get(&q.provider_id)
                    .ok_or_else(|| Error::ProviderNotFound(q.provider_id.clone()))?;
                Ok(provider.details().await)
            }
            Query::GetProviderTools(q) => {
                let provider = self
                    .repository
                    .get(&q.provider_id)
                    .ok_or_else(|| Error::ProviderNotFound(q.provider_id.clone()))?;
                let catalog = provider.tools().await;
                Ok(serde_json::to_value(catalog.tools())?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::queries::{GetProviderQuery, ListProvidersQuery};
    use crate::config::{ProviderConfig, ProviderMode};

    fn fixture() -> (Arc<ProviderRepository>, Arc<EventBus>) {
        let repository = Arc::new(ProviderRepository::new());
        let event_bus = Arc::new(EventBus::new());
        let provider = Provider::from_config(
            "math",
            ProviderConfig {
                mode: ProviderMode::Subprocess,
                command: vec!["true".into()],
                ..ProviderConfig::default()
            },
        )
        .unwrap();
        repository.add(provider).unwrap();
        (repository, event_bus)
    }

    #[tokio::test]
    async fn unknown_provider_maps_to_not_found() {
        let (repository, event_bus) = fixture();
        let handler = ProviderCommandHandler::new(repository, event_bus);
        let err = handler
            .handle(Command::StartProvider(StartProviderCommand {
                provider_id: "ghost".into(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "provider_not_found");
    }

    #[tokio::test]
    async fn stop_of_cold_provider_succeeds() {
        let (repository, event_bus) = fixture();
        let handler = ProviderCommandHandler::new(repository, event_bus);
        let result = handler
            .handle(Command::StopProvider(StopProviderCommand {
                provider_id: "math".into(),
                reason: None,
            }))
            .await
            .unwrap();
        assert_eq!(result["stopped"], true);
        assert_eq!(result["reason"], "shutdown");
    }

    #[tokio::test]
    async fn list_query_filters_by_state() {
        let (repository, _) = fixture();
        let handler = ProviderQueryHandler::new(repository);

        let all = handler
            .handle(Query::ListProviders(ListProvidersQuery { state_filter: None }))
            .await
            .unwrap();
        assert_eq!(all.as_array().unwrap().len(), 1);
        assert_eq!(all[0]["state"], "cold");

        let ready_only = handler
            .handle(Query::ListProviders(ListProvidersQuery {
                state_filter: Some("ready".into()),
            }))
            .await
            .unwrap();
        assert!(ready_only.as_array().unwrap().is_empty());

        let err = handler
            .handle(Query::ListProviders(ListProvidersQuery {
                state_filter: Some("bogus".into()),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[tokio::test]
    async fn get_provider_returns_details() {
        let (repository, _) = fixture();
        let handler = ProviderQueryHandler::new(repository);
        let details = handler
            .handle(Query::GetProvider(GetProviderQuery {
                provider_id: "math".into(),
            }))
            .await
            .unwrap();
        assert_eq!(details["provider"], "math");
        assert_eq!(details["mode"], "subprocess");
        assert!(details.get("health").is_some());
    }

    #[tokio::test]
    async fn load_and_unload_roundtrip() {
        let (repository, event_bus) = fixture();
        let handler = ProviderCommandHandler::new(Arc::clone(&repository), event_bus);

        let loaded = handler
            .handle(Command::LoadProvider(LoadProviderCommand {
                provider_id: "extra".into(),
                config: ProviderConfig {
                    mode: ProviderMode::Subprocess,
                    command: vec!["true".into()],
                    ..ProviderConfig::default()
                },
            }))
            .await
            .unwrap();
        assert_eq!(loaded["loaded"], true);
        assert!(repository.exists("extra"));

        let unloaded = handler
            .handle(Command::UnloadProvider(
                crate::application::commands::UnloadProviderCommand {
                    provider_id: "extra".into(),
                },
            ))
            .await
            .unwrap();
        assert_eq!(unloaded["unloaded"], true);
        assert!(!repository.exists("extra"));
    }
}
