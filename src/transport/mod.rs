//! Transport clients fronting MCP providers
//!
//! Subprocess and container providers speak newline-delimited JSON-RPC over
//! the child's stdio ([`StdioClient`]); remote providers speak JSON-RPC over
//! HTTP ([`HttpClient`]). [`connect`] spawns or dials the back-end and runs
//! the MCP handshake (`initialize`, `notifications/initialized`,
//! `tools/list`), returning the client together with the discovered catalog.

mod http;
mod stdio;

pub use self::http::HttpClient;
pub use self::stdio::StdioClient;

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use crate::config::{ProviderConfig, ProviderMode};
use crate::protocol::{JsonRpcResponse, PROTOCOL_VERSION, ToolCatalog};
use crate::{Error, Result};

/// Timeout applied to each handshake RPC
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Client trait for MCP communication
#[async_trait]
pub trait McpClient: Send + Sync {
    /// Send a request and wait for the correlated response up to `timeout`
    async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse>;

    /// Send a notification (no response expected)
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;

    /// Whether the transport is still usable
    fn is_alive(&self) -> bool;

    /// Close the transport; idempotent
    async fn close(&self);
}

/// Spawn or dial the back-end for `config` and run the MCP handshake.
///
/// Returns the live client and the tool catalog discovered via `tools/list`.
pub async fn connect(
    provider_id: &str,
    config: &ProviderConfig,
) -> Result<(Arc<dyn McpClient>, ToolCatalog)> {
    let client: Arc<dyn McpClient> = match config.mode {
        ProviderMode::Subprocess | ProviderMode::Container => {
            let mut cmd = build_command(config)?;
            let child = cmd
                .spawn()
                .map_err(|e| Error::Transport(format!("failed to spawn: {e}")))?;
            StdioClient::new(child)?
        }
        ProviderMode::Remote => {
            let endpoint = config
                .endpoint
                .as_deref()
                .ok_or_else(|| Error::Configuration("remote provider without endpoint".into()))?;
            HttpClient::new(endpoint, HANDSHAKE_TIMEOUT)?
        }
    };

    match handshake(provider_id, client.as_ref()).await {
        Ok(catalog) => Ok((client, catalog)),
        Err(e) => {
            // Leave no orphan process behind a failed handshake.
            client.close().await;
            Err(e)
        }
    }
}

/// Build the command line for subprocess and container modes
fn build_command(config: &ProviderConfig) -> Result<Command> {
    let argv = match config.mode {
        ProviderMode::Subprocess => config.command.clone(),
        ProviderMode::Container => container_argv(config)?,
        ProviderMode::Remote => {
            return Err(Error::Configuration(
                "remote providers have no command line".into(),
            ));
        }
    };

    let Some((program, args)) = argv.split_first() else {
        return Err(Error::Configuration("empty provider command".into()));
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    // Container env travels inside the argv as -e flags; subprocess env is
    // set on the child directly.
    if config.mode == ProviderMode::Subprocess {
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
    }

    Ok(cmd)
}

/// Assemble the `docker run` argv for a container-mode provider
fn container_argv(config: &ProviderConfig) -> Result<Vec<String>> {
    let image = config
        .image
        .as_deref()
        .ok_or_else(|| Error::Configuration("container provider without image".into()))?;

    let mut argv = vec![
        "docker".to_string(),
        "run".to_string(),
        "-i".to_string(),
        "--rm".to_string(),
        "--network".to_string(),
        config.network.clone(),
    ];

    if config.read_only {
        argv.push("--read-only".to_string());
    }
    if let Some(ref user) = config.user {
        argv.push("-u".to_string());
        argv.push(user.clone());
    }
    if let Some(ref memory) = config.resources.memory {
        argv.push("--memory".to_string());
        argv.push(memory.clone());
    }
    if let Some(ref cpus) = config.resources.cpus {
        argv.push("--cpus".to_string());
        argv.push(cpus.clone());
    }
    for volume in &config.volumes {
        argv.push("-v".to_string());
        argv.push(volume.clone());
    }
    for (key, value) in &config.env {
        argv.push("-e".to_string());
        argv.push(format!("{key}={value}"));
    }

    argv.push(image.to_string());
    Ok(argv)
}

/// Run the MCP handshake and discover the tool catalog
async fn handshake(provider_id: &str, client: &dyn McpClient) -> Result<ToolCatalog> {
    let response = client
        .call(
            "initialize",
            Some(serde_json::json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": "mcp-hangar",
                    "version": env!("CARGO_PKG_VERSION")
                }
            })),
            HANDSHAKE_TIMEOUT,
        )
        .await?;

    if let Some(err) = response.error {
        return Err(Error::Protocol(format!(
            "initialize rejected: {} (code {})",
            err.message, err.code
        )));
    }

    client.notify("notifications/initialized", None).await?;

    let response = client.call("tools/list", None, HANDSHAKE_TIMEOUT).await?;
    if let Some(err) = response.error {
        return Err(Error::Protocol(format!(
            "tools/list rejected: {} (code {})",
            err.message, err.code
        )));
    }

    let result = response
        .result
        .ok_or_else(|| Error::Protocol("tools/list returned no result".to_string()))?;
    let catalog = ToolCatalog::from_tools_list(&result)?;

    debug!(
        provider_id = %provider_id,
        tools = catalog.len(),
        "handshake complete"
    );
    Ok(catalog)
}

/// Derive an operator-facing hint from a startup failure message
#[must_use]
pub fn startup_suggestion(reason: &str) -> String {
    let lower = reason.to_lowercase();
    if lower.contains("no such file") || lower.contains("not found") {
        "ensure the command binary is installed and on PATH".to_string()
    } else if lower.contains("permission denied") {
        "check execute permissions on the provider command".to_string()
    } else if lower.contains("docker daemon") || lower.contains("docker.sock") {
        "verify the Docker daemon is running and accessible".to_string()
    } else if lower.contains("connection refused") || lower.contains("dns") {
        "verify the remote endpoint is reachable".to_string()
    } else if lower.contains("timed out") || lower.contains("timeout") {
        "the provider did not answer the handshake; check that it speaks MCP on stdio".to_string()
    } else {
        "check the provider configuration and its logs".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceLimits;
    use std::collections::HashMap;

    fn container_config() -> ProviderConfig {
        ProviderConfig {
            mode: ProviderMode::Container,
            image: Some("ghcr.io/acme/sqlite-mcp:1".into()),
            volumes: vec!["/data:/data:ro".into()],
            resources: ResourceLimits {
                memory: Some("256m".into()),
                cpus: Some("0.5".into()),
            },
            network: "none".into(),
            read_only: true,
            user: Some("1000:1000".into()),
            env: HashMap::from([("API_KEY".into(), "secret".into())]),
            ..ProviderConfig::default()
        }
    }

    #[test]
    fn container_argv_includes_isolation_flags() {
        let argv = container_argv(&container_config()).unwrap();
        assert_eq!(argv[0], "docker");
        assert!(argv.contains(&"--read-only".to_string()));
        assert!(argv.contains(&"--network".to_string()));
        assert!(argv.contains(&"none".to_string()));
        assert!(argv.contains(&"--memory".to_string()));
        assert!(argv.contains(&"256m".to_string()));
        assert!(argv.contains(&"-v".to_string()));
        assert!(argv.contains(&"/data:/data:ro".to_string()));
        assert!(argv.contains(&"API_KEY=secret".to_string()));
        // Image is the final token so trailing args become the entrypoint's.
        assert_eq!(argv.last().unwrap(), "ghcr.io/acme/sqlite-mcp:1");
    }

    #[test]
    fn container_argv_requires_image() {
        let mut config = container_config();
        config.image = None;
        assert!(container_argv(&config).is_err());
    }

    #[test]
    fn build_command_rejects_empty_argv() {
        let config = ProviderConfig {
            mode: ProviderMode::Subprocess,
            command: vec![],
            ..ProviderConfig::default()
        };
        assert!(build_command(&config).is_err());
    }

    #[test]
    fn suggestion_for_missing_binary() {
        let hint = startup_suggestion("failed to spawn: No such file or directory (os error 2)");
        assert!(hint.contains("PATH"));
    }

    #[test]
    fn suggestion_for_refused_connection() {
        let hint = startup_suggestion("error sending request: connection refused");
        assert!(hint.contains("endpoint"));
    }

    #[test]
    fn suggestion_falls_back_to_generic() {
        let hint = startup_suggestion("something entirely unexpected");
        assert!(hint.contains("configuration"));
    }
}
