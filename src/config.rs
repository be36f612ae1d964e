//! Configuration management

use std::{collections::HashMap, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::domain::group::LoadBalancerStrategy;
use crate::protocol::ToolSchema;
use crate::validator::validate_provider_id;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Managed providers, keyed by provider id
    pub providers: HashMap<String, ProviderConfig>,
    /// Provider groups, keyed by group id (shares the provider namespace)
    pub groups: HashMap<String, GroupConfig>,
    /// Admission control for the front door
    pub rate_limit: RateLimitConfig,
    /// Background worker cadence
    pub workers: WorkersConfig,
}

impl Config {
    /// Load configuration from an optional YAML file plus `MCP_HANGAR_*`
    /// environment overrides, then validate the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            if !path.exists() {
                return Err(Error::Configuration(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            figment = figment.merge(Yaml::file(path));
        }
        let config: Self = figment
            .merge(Env::prefixed("MCP_HANGAR_").split("__"))
            .extract()
            .map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation beyond what serde can express.
    ///
    /// Id format is checked here too, so a config with a malformed
    /// provider or group key is rejected before any running provider is
    /// touched (reload relies on this to stay atomic).
    pub fn validate(&self) -> Result<()> {
        for (id, provider) in &self.providers {
            let check = validate_provider_id(id);
            if !check.valid() {
                return Err(Error::Configuration(format!(
                    "provider '{id}': {}",
                    check.first_message()
                )));
            }
            provider
                .validate()
                .map_err(|e| Error::Configuration(format!("provider '{id}': {e}")))?;
        }
        for (group_id, group) in &self.groups {
            let check = validate_provider_id(group_id);
            if !check.valid() {
                return Err(Error::Configuration(format!(
                    "group '{group_id}': {}",
                    check.first_message()
                )));
            }
            if self.providers.contains_key(group_id) {
                return Err(Error::Configuration(format!(
                    "'{group_id}' is both a provider and a group; ids share one namespace"
                )));
            }
            if group.members.is_empty() {
                return Err(Error::Configuration(format!(
                    "group '{group_id}' has no members"
                )));
            }
            for member in &group.members {
                if !self.providers.contains_key(&member.provider) {
                    return Err(Error::Configuration(format!(
                        "group '{group_id}' references unknown provider '{}'",
                        member.provider
                    )));
                }
            }
        }
        Ok(())
    }
}

/// How a provider's back-end runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderMode {
    /// Local child process speaking MCP on stdio
    #[default]
    Subprocess,
    /// `docker run` child process speaking MCP on stdio
    Container,
    /// Remote HTTP endpoint
    Remote,
}

impl ProviderMode {
    /// Lowercase label used in events and listings
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Subprocess => "subprocess",
            Self::Container => "container",
            Self::Remote => "remote",
        }
    }
}

/// Container resource limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ResourceLimits {
    /// Memory limit passed to `--memory` (e.g. "256m")
    pub memory: Option<String>,
    /// CPU limit passed to `--cpus` (e.g. "0.5")
    pub cpus: Option<String>,
}

/// One provider's configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Back-end mode
    pub mode: ProviderMode,
    /// Command argv (subprocess mode)
    pub command: Vec<String>,
    /// Container image (container mode)
    pub image: Option<String>,
    /// Endpoint URL (remote mode)
    pub endpoint: Option<String>,
    /// Environment passed to the back-end
    pub env: HashMap<String, String>,
    /// Idle TTL before the GC worker stops the provider
    #[serde(with = "humantime_serde")]
    pub idle_ttl: Duration,
    /// Interval between active health checks
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,
    /// Consecutive failures before DEGRADED
    pub max_consecutive_failures: u32,
    /// Container volume mounts (`host:container[:mode]`)
    pub volumes: Vec<String>,
    /// Container resource limits
    pub resources: ResourceLimits,
    /// Container network mode
    pub network: String,
    /// Container read-only root filesystem
    pub read_only: bool,
    /// Container user
    pub user: Option<String>,
    /// Human-readable description
    pub description: Option<String>,
    /// Predefined tool catalog, visible before the provider starts
    pub tools: Option<Vec<ToolSchema>>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            mode: ProviderMode::Subprocess,
            command: Vec::new(),
            image: None,
            endpoint: None,
            env: HashMap::new(),
            idle_ttl: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(60),
            max_consecutive_failures: 3,
            volumes: Vec::new(),
            resources: ResourceLimits::default(),
            network: "none".to_string(),
            read_only: true,
            user: None,
            description: None,
            tools: None,
        }
    }
}

impl ProviderConfig {
    /// Check that the mode's required fields are present
    pub fn validate(&self) -> Result<()> {
        match self.mode {
            ProviderMode::Subprocess if self.command.is_empty() => Err(Error::Configuration(
                "subprocess mode requires a command".to_string(),
            )),
            ProviderMode::Container if self.image.is_none() => Err(Error::Configuration(
                "container mode requires an image".to_string(),
            )),
            ProviderMode::Remote if self.endpoint.is_none() => Err(Error::Configuration(
                "remote mode requires an endpoint".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Whether a reload must restart the provider.
    ///
    /// Compares the field set that affects runtime behavior; description
    /// and predefined tools can change without an interruption.
    #[must_use]
    pub fn requires_restart(&self, new: &Self) -> bool {
        self.mode != new.mode
            || self.command != new.command
            || self.image != new.image
            || self.endpoint != new.endpoint
            || self.env != new.env
            || self.idle_ttl != new.idle_ttl
            || self.health_check_interval != new.health_check_interval
            || self.max_consecutive_failures != new.max_consecutive_failures
            || self.volumes != new.volumes
            || self.resources != new.resources
            || self.network != new.network
            || self.read_only != new.read_only
            || self.user != new.user
    }
}

/// Group configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Member selection policy
    pub strategy: LoadBalancerStrategy,
    /// Members of the group
    pub members: Vec<GroupMemberConfig>,
    /// Members needed in rotation for the group to be READY
    pub min_healthy: u32,
    /// Start members eagerly at bootstrap
    pub auto_start: bool,
    /// Rotation flip thresholds
    pub health: GroupHealthConfig,
    /// Per-member circuit breaker parameters
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            strategy: LoadBalancerStrategy::RoundRobin,
            members: Vec::new(),
            min_healthy: 1,
            auto_start: false,
            health: GroupHealthConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// One group member's configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupMemberConfig {
    /// Provider id of the member
    pub provider: String,
    /// Selection weight (weighted strategy), >= 1
    pub weight: u32,
    /// Priority tier (priority strategy), lower is preferred
    pub priority: u32,
}

impl Default for GroupMemberConfig {
    fn default() -> Self {
        Self {
            provider: String::new(),
            weight: 1,
            priority: 0,
        }
    }
}

/// Rotation flip thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupHealthConfig {
    /// Consecutive successful observations before a member re-enters rotation
    pub healthy_threshold: u32,
    /// Consecutive failed observations before a member leaves rotation
    pub unhealthy_threshold: u32,
}

impl Default for GroupHealthConfig {
    fn default() -> Self {
        Self {
            healthy_threshold: 2,
            unhealthy_threshold: 3,
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Wall-clock wait before the open circuit admits a probe
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,
    /// Sustained requests per second per key
    pub requests_per_second: u32,
    /// Burst size per key
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: 100,
            burst_size: 50,
        }
    }
}

/// Background worker cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    /// Idle-GC sweep interval
    #[serde(with = "humantime_serde")]
    pub gc_interval: Duration,
    /// Health-check sweep interval
    #[serde(with = "humantime_serde")]
    pub health_interval: Duration,
    /// Watch the config file for changes
    pub watch_config: bool,
    /// Polling interval when file notifications are unavailable
    #[serde(with = "humantime_serde")]
    pub watch_interval: Duration,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            gc_interval: Duration::from_secs(30),
            health_interval: Duration::from_secs(60),
            watch_config: true,
            watch_interval: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(yaml: &str) -> Config {
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config
    }

    #[test]
    fn minimal_provider_gets_defaults() {
        let config = parse(
            r#"
providers:
  math:
    mode: subprocess
    command: ["python3", "-m", "math_provider"]
"#,
        );
        let math = &config.providers["math"];
        assert_eq!(math.idle_ttl, Duration::from_secs(300));
        assert_eq!(math.health_check_interval, Duration::from_secs(60));
        assert_eq!(math.max_consecutive_failures, 3);
        assert_eq!(math.network, "none");
        assert!(math.read_only);
        config.validate().unwrap();
    }

    #[test]
    fn durations_accept_humantime_strings() {
        let config = parse(
            r#"
providers:
  math:
    mode: subprocess
    command: ["x"]
    idle_ttl: 5s
    health_check_interval: 2m
"#,
        );
        let math = &config.providers["math"];
        assert_eq!(math.idle_ttl, Duration::from_secs(5));
        assert_eq!(math.health_check_interval, Duration::from_secs(120));
    }

    #[test]
    fn mode_required_fields_are_enforced() {
        let missing_command = parse("providers:\n  p:\n    mode: subprocess\n");
        assert!(missing_command.validate().is_err());

        let missing_image = parse("providers:\n  p:\n    mode: container\n");
        assert!(missing_image.validate().is_err());

        let missing_endpoint = parse("providers:\n  p:\n    mode: remote\n");
        assert!(missing_endpoint.validate().is_err());
    }

    #[test]
    fn groups_must_reference_known_providers() {
        let config = parse(
            r#"
providers:
  a:
    mode: subprocess
    command: ["x"]
groups:
  workers:
    members:
      - provider: a
      - provider: missing
"#,
        );
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn malformed_ids_are_rejected() {
        let bad_provider = parse(
            r#"
providers:
  "has space":
    mode: subprocess
    command: ["x"]
"#,
        );
        assert!(bad_provider.validate().is_err());

        let bad_group = parse(
            r#"
providers:
  a:
    mode: subprocess
    command: ["x"]
groups:
  "_lead":
    members:
      - provider: a
"#,
        );
        assert!(bad_group.validate().is_err());
    }

    #[test]
    fn group_and_provider_ids_share_a_namespace() {
        let config = parse(
            r#"
providers:
  same:
    mode: subprocess
    command: ["x"]
groups:
  same:
    members:
      - provider: same
"#,
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn group_defaults() {
        let config = parse(
            r#"
providers:
  a:
    mode: subprocess
    command: ["x"]
groups:
  workers:
    members:
      - provider: a
"#,
        );
        let group = &config.groups["workers"];
        assert_eq!(group.strategy, LoadBalancerStrategy::RoundRobin);
        assert_eq!(group.min_healthy, 1);
        assert_eq!(group.members[0].weight, 1);
        assert_eq!(group.health.unhealthy_threshold, 3);
        assert_eq!(group.circuit_breaker.failure_threshold, 5);
    }

    #[test]
    fn requires_restart_compares_the_behavior_field_set() {
        let base = ProviderConfig {
            mode: ProviderMode::Subprocess,
            command: vec!["x".into()],
            ..ProviderConfig::default()
        };

        let same = base.clone();
        assert!(!base.requires_restart(&same));

        let mut env_changed = base.clone();
        env_changed.env.insert("K".into(), "V".into());
        assert!(base.requires_restart(&env_changed));

        // Description changes never interrupt a running provider.
        let mut described = base.clone();
        described.description = Some("the math provider".into());
        assert!(!base.requires_restart(&described));
    }

    #[test]
    fn load_rejects_missing_file() {
        let err = Config::load(Some(Path::new("/nonexistent/hangar.yaml"))).unwrap_err();
        assert_eq!(err.kind(), "configuration_error");
    }
}
