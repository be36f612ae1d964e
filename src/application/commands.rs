//! Command type catalog
//!
//! Commands express intent to mutate. Each kind has exactly one handler,
//! registered on the command bus at bootstrap.

use std::time::Duration;

use serde_json::Value;

use crate::config::ProviderConfig;

/// Default tool invocation timeout
pub const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Routing discriminant for command dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Bring a provider to READY
    StartProvider,
    /// Stop a provider
    StopProvider,
    /// Invoke a tool on a provider
    InvokeTool,
    /// Run an active health check
    HealthCheck,
    /// Sweep idle providers
    ShutdownIdleProviders,
    /// Reload configuration from disk
    ReloadConfiguration,
    /// Register a provider at runtime
    LoadProvider,
    /// Deregister a provider at runtime
    UnloadProvider,
}

/// Start a provider (spawn + handshake if COLD or DEAD)
#[derive(Debug, Clone)]
pub struct StartProviderCommand {
    /// Provider to start
    pub provider_id: String,
}

/// Stop a provider
#[derive(Debug, Clone)]
pub struct StopProviderCommand {
    /// Provider to stop
    pub provider_id: String,
    /// Stop reason recorded in the `ProviderStopped` event
    pub reason: Option<String>,
}

/// Invoke a tool on a provider
#[derive(Debug, Clone)]
pub struct InvokeToolCommand {
    /// Target provider
    pub provider_id: String,
    /// Tool to invoke
    pub tool_name: String,
    /// Tool arguments
    pub arguments: Value,
    /// Per-call timeout
    pub timeout: Duration,
}

/// Run an active health check against one provider
#[derive(Debug, Clone)]
pub struct HealthCheckCommand {
    /// Provider to probe
    pub provider_id: String,
}

/// Sweep every provider for idle shutdown
#[derive(Debug, Clone, Default)]
pub struct ShutdownIdleProvidersCommand;

/// Reload configuration from a file and apply the diff
#[derive(Debug, Clone)]
pub struct ReloadConfigurationCommand {
    /// Config file to load
    pub config_path: String,
    /// Graceful (drain) vs immediate stop of affected providers
    pub graceful: bool,
    /// Who asked for the reload (for events and logs)
    pub requested_by: String,
}

/// Register a provider configuration at runtime
#[derive(Debug, Clone)]
pub struct LoadProviderCommand {
    /// New provider's id
    pub provider_id: String,
    /// New provider's configuration
    pub config: ProviderConfig,
}

/// Stop and deregister a provider at runtime
#[derive(Debug, Clone)]
pub struct UnloadProviderCommand {
    /// Provider to unload
    pub provider_id: String,
}

/// The closed set of commands the bus routes
#[derive(Debug, Clone)]
pub enum Command {
    /// Start a provider
    StartProvider(StartProviderCommand),
    /// Stop a provider
    StopProvider(StopProviderCommand),
    /// Invoke a tool
    InvokeTool(InvokeToolCommand),
    /// Health-check a provider
    HealthCheck(HealthCheckCommand),
    /// Sweep idle providers
    ShutdownIdleProviders(ShutdownIdleProvidersCommand),
    /// Reload configuration
    ReloadConfiguration(ReloadConfigurationCommand),
    /// Register a provider
    LoadProvider(LoadProviderCommand),
    /// Deregister a provider
    UnloadProvider(UnloadProviderCommand),
}

impl Command {
    /// Routing discriminant
    #[must_use]
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::StartProvider(_) => CommandKind::StartProvider,
            Self::StopProvider(_) => CommandKind::StopProvider,
            Self::InvokeTool(_) => CommandKind::InvokeTool,
            Self::HealthCheck(_) => CommandKind::HealthCheck,
            Self::ShutdownIdleProviders(_) => CommandKind::ShutdownIdleProviders,
            Self::ReloadConfiguration(_) => CommandKind::ReloadConfiguration,
            Self::LoadProvider(_) => CommandKind::LoadProvider,
            Self::UnloadProvider(_) => CommandKind::UnloadProvider,
        }
    }
}
