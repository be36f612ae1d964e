//! Front-door registry facade
//!
//! The public surface an outward-facing MCP server (and the test suite)
//! consumes. Every operation runs through the tool middleware and then the
//! command/query buses; group ids share the provider namespace and are
//! routed to the owning [`ProviderGroup`] with load balancing and retry.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;

use crate::application::commands::{
    Command, DEFAULT_INVOKE_TIMEOUT, HealthCheckCommand, InvokeToolCommand,
    ReloadConfigurationCommand, ShutdownIdleProvidersCommand, StartProviderCommand,
    StopProviderCommand,
};
use crate::application::queries::{
    GetProviderQuery, GetProviderToolsQuery, ListProvidersQuery, Query,
};
use crate::bus::{CommandBus, EventBus, QueryBus};
use crate::domain::group::ProviderGroup;
use crate::middleware::ToolMiddleware;
use crate::repository::ProviderRepository;
use crate::validator::{
    ValidationResult, validate_arguments, validate_provider_id, validate_timeout,
    validate_tool_name,
};
use crate::{Error, Result};

/// Attempts per group invocation, each on a distinct member
const GROUP_MAX_ATTEMPTS: usize = 2;

/// The registry surface: list, start, stop, tools, invoke, details, health
pub struct Registry {
    repository: Arc<ProviderRepository>,
    groups: Arc<DashMap<String, Arc<ProviderGroup>>>,
    command_bus: Arc<CommandBus>,
    query_bus: Arc<QueryBus>,
    event_bus: Arc<EventBus>,
    middleware: ToolMiddleware,
}

impl Registry {
    /// Wire the facade
    #[must_use]
    pub fn new(
        repository: Arc<ProviderRepository>,
        groups: Arc<DashMap<String, Arc<ProviderGroup>>>,
        command_bus: Arc<CommandBus>,
        query_bus: Arc<QueryBus>,
        event_bus: Arc<EventBus>,
        middleware: ToolMiddleware,
    ) -> Self {
        Self {
            repository,
            groups,
            command_bus,
            query_bus,
            event_bus,
            middleware,
        }
    }

    /// Map any error to the stable `{error, error_type, details}` payload
    #[must_use]
    pub fn error_payload(&self, operation: &'static str, error: &Error) -> Value {
        self.middleware.error_payload(operation, error)
    }

    fn group(&self, id: &str) -> Option<Arc<ProviderGroup>> {
        self.groups.get(id).map(|g| Arc::clone(&g))
    }

    fn publish_group_events(&self, group: &ProviderGroup) {
        for event in group.collect_events() {
            self.event_bus.publish(&event);
        }
    }

    /// List all providers and groups with status and metadata
    pub async fn list(&self, state_filter: Option<String>) -> Result<Value> {
        self.middleware
            .run("registry_list", "registry_list", ValidationResult::ok(), || async {
                let providers = self
                    .query_bus
                    .execute(Query::ListProviders(ListProvidersQuery {
                        state_filter: state_filter.clone(),
                    }))
                    .await?;

                let mut groups: Vec<Value> = self
                    .groups
                    .iter()
                    .map(|entry| entry.value().to_status_value())
                    .filter(|status| {
                        state_filter
                            .as_deref()
                            .is_none_or(|f| status["state"].as_str() == Some(f))
                    })
                    .collect();
                groups.sort_by(|a, b| {
                    a["group"]
                        .as_str()
                        .unwrap_or_default()
                        .cmp(b["group"].as_str().unwrap_or_default())
                });

                Ok(serde_json::json!({
                    "providers": providers,
                    "groups": groups,
                }))
            })
            .await
    }

    /// Start a provider, or every member of a group
    pub async fn start(&self, provider: &str) -> Result<Value> {
        let key = format!("registry_start:{provider}");
        self.middleware
            .run("registry_start", &key, validate_provider_id(provider), || async {
                if let Some(group) = self.group(provider) {
                    let started = group.start_all().await;
                    for member in group.members() {
                        member.provider().drain_and_publish(&self.event_bus).await;
                    }
                    group.rebalance();
                    self.publish_group_events(&group);
                    return Ok(serde_json::json!({
                        "group": provider,
                        "state": group.state().as_str(),
                        "members_started": started,
                        "healthy_count": group.healthy_count(),
                        "total_count": group.total_count(),
                    }));
                }

                self.command_bus
                    .send(Command::StartProvider(StartProviderCommand {
                        provider_id: provider.to_string(),
                    }))
                    .await
            })
            .await
    }

    /// Stop a provider, or every member of a group
    pub async fn stop(&self, provider: &str) -> Result<Value> {
        let key = format!("registry_stop:{provider}");
        self.middleware
            .run("registry_stop", &key, validate_provider_id(provider), || async {
                if let Some(group) = self.group(provider) {
                    group.stop_all().await;
                    for member in group.members() {
                        member.provider().drain_and_publish(&self.event_bus).await;
                    }
                    group.rebalance();
                    self.publish_group_events(&group);
                    return Ok(serde_json::json!({
                        "group": provider,
                        "state": group.state().as_str(),
                        "stopped": true,
                    }));
                }

                self.command_bus
                    .send(Command::StopProvider(StopProviderCommand {
                        provider_id: provider.to_string(),
                        reason: None,
                    }))
                    .await
            })
            .await
    }

    /// Tool schemas for a provider (groups answer via a selected member)
    pub async fn tools(&self, provider: &str) -> Result<Value> {
        let key = format!("registry_tools:{provider}");
        self.middleware
            .run("registry_tools", &key, validate_provider_id(provider), || async {
                if let Some(group) = self.group(provider) {
                    let member = group
                        .select_member()
                        .ok_or_else(|| Error::NoHealthyMembers(provider.to_string()))?;
                    let member_id = member.provider_id().to_string();
                    self.command_bus
                        .send(Command::StartProvider(StartProviderCommand {
                            provider_id: member_id.clone(),
                        }))
                        .await?;
                    let tools = self
                        .query_bus
                        .execute(Query::GetProviderTools(GetProviderToolsQuery {
                            provider_id: member_id,
                        }))
                        .await?;
                    return Ok(serde_json::json!({
                        "provider": provider,
                        "group": true,
                        "tools": tools,
                    }));
                }

                if !self.repository.exists(provider) {
                    return Err(Error::ProviderNotFound(provider.to_string()));
                }
                self.command_bus
                    .send(Command::StartProvider(StartProviderCommand {
                        provider_id: provider.to_string(),
                    }))
                    .await?;
                let tools = self
                    .query_bus
                    .execute(Query::GetProviderTools(GetProviderToolsQuery {
                        provider_id: provider.to_string(),
                    }))
                    .await?;
                Ok(serde_json::json!({"provider": provider, "tools": tools}))
            })
            .await
    }

    /// Invoke a tool on a provider or group
    pub async fn invoke(
        &self,
        provider: &str,
        tool: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let timeout = timeout.unwrap_or(DEFAULT_INVOKE_TIMEOUT);
        let key = format!("registry_invoke:{provider}");
        let validation = validate_provider_id(provider)
            .and(validate_tool_name(tool))
            .and(validate_arguments(&arguments))
            .and(validate_timeout(timeout));

        self.middleware
            .run("registry_invoke", &key, validation, || async {
                if let Some(group) = self.group(provider) {
                    return self.invoke_on_group(&group, tool, arguments, timeout).await;
                }
                if !self.repository.exists(provider) {
                    return Err(Error::ProviderNotFound(provider.to_string()));
                }
                self.command_bus
                    .send(Command::InvokeTool(InvokeToolCommand {
                        provider_id: provider.to_string(),
                        tool_name: tool.to_string(),
                        arguments,
                        timeout,
                    }))
                    .await
            })
            .await
    }

    /// Group invocation: select a member, invoke through the command bus,
    /// retry once on a distinct member, re-raise the first error when no
    /// healthy alternative remains.
    async fn invoke_on_group(
        &self,
        group: &Arc<ProviderGroup>,
        tool: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value> {
        if !group.is_available() {
            return Err(Error::GroupUnavailable {
                group_id: group.id().to_string(),
                state: group.state().as_str().to_string(),
            });
        }

        let mut first_error: Option<Error> = None;
        let mut tried: Vec<String> = Vec::new();

        for _ in 0..GROUP_MAX_ATTEMPTS {
            let excluded: Vec<&str> = tried.iter().map(String::as_str).collect();
            let Some(member) = group.select_member_excluding(&excluded) else {
                break;
            };
            let member_id = member.provider_id().to_string();
            tried.push(member_id.clone());

            member.begin_invocation();
            let outcome = self
                .command_bus
                .send(Command::InvokeTool(InvokeToolCommand {
                    provider_id: member_id.clone(),
                    tool_name: tool.to_string(),
                    arguments: arguments.clone(),
                    timeout,
                }))
                .await;
            member.end_invocation();

            match outcome {
                Ok(result) => {
                    group.report_success(&member_id);
                    self.publish_group_events(group);
                    return Ok(result);
                }
                Err(e) => {
                    group.report_failure(&member_id);
                    self.publish_group_events(group);
                    first_error.get_or_insert(e);
                }
            }
        }

        Err(first_error.unwrap_or_else(|| Error::NoHealthyMembers(group.id().to_string())))
    }

    /// Detailed information about a provider or group
    pub async fn details(&self, provider: &str) -> Result<Value> {
        let key = format!("registry_details:{provider}");
        self.middleware
            .run("registry_details", &key, validate_provider_id(provider), || async {
                if let Some(group) = self.group(provider) {
                    return Ok(group.to_status_value());
                }
                self.query_bus
                    .execute(Query::GetProvider(GetProviderQuery {
                        provider_id: provider.to_string(),
                    }))
                    .await
            })
            .await
    }

    /// Run a health check across every provider and report the fleet view
    pub async fn health(&self) -> Result<Value> {
        self.middleware
            .run("registry_health", "registry_health", ValidationResult::ok(), || async {
                let mut providers = Vec::new();
                for provider in self.repository.get_all() {
                    let result = self
                        .command_bus
                        .send(Command::HealthCheck(HealthCheckCommand {
                            provider_id: provider.id().to_string(),
                        }))
                        .await?;
                    providers.push(result);
                }
                providers.sort_by(|a, b| {
                    a["provider"]
                        .as_str()
                        .unwrap_or_default()
                        .cmp(b["provider"].as_str().unwrap_or_default())
                });

                let groups: Vec<Value> = self
                    .groups
                    .iter()
                    .map(|entry| entry.value().to_status_value())
                    .collect();

                Ok(serde_json::json!({
                    "providers": providers,
                    "groups": groups,
                }))
            })
            .await
    }

    /// Sweep idle providers now
    pub async fn shutdown_idle(&self) -> Result<Value> {
        self.middleware
            .run(
                "registry_shutdown_idle",
                "registry_shutdown_idle",
                ValidationResult::ok(),
                || async {
                    self.command_bus
                        .send(Command::ShutdownIdleProviders(ShutdownIdleProvidersCommand))
                        .await
                },
            )
            .await
    }

    /// Reload configuration from a file
    pub async fn reload(&self, config_path: &str, graceful: bool) -> Result<Value> {
        self.middleware
            .run(
                "registry_reload",
                "registry_reload",
                ValidationResult::ok(),
                || async {
                    self.command_bus
                        .send(Command::ReloadConfiguration(ReloadConfigurationCommand {
                            config_path: config_path.to_string(),
                            graceful,
                            requested_by: "api".to_string(),
                        }))
                        .await
                },
            )
            .await
    }
}
