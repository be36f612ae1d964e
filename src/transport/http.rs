//! HTTP JSON-RPC client (remote providers)

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, header};
use serde_json::Value;
use tracing::debug;

use super::McpClient;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION, RequestId};
use crate::{Error, Result};

/// JSON-RPC-over-HTTP client for remote MCP endpoints
#[derive(Debug)]
pub struct HttpClient {
    /// Shared connection pool
    client: Client,
    /// Endpoint URL
    endpoint: String,
    /// Session ID handed out by the server, echoed on subsequent requests
    session_id: RwLock<Option<String>>,
    /// Request ID counter
    request_id: AtomicU64,
    /// Cleared on close
    open: AtomicBool,
}

impl HttpClient {
    /// Create a client for `endpoint`. The URL is validated eagerly so a
    /// typo fails at configuration time rather than on the first call.
    pub fn new(endpoint: &str, connect_timeout: Duration) -> Result<Arc<Self>> {
        url::Url::parse(endpoint)
            .map_err(|e| Error::Configuration(format!("invalid endpoint '{endpoint}': {e}")))?;

        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;

        Ok(Arc::new(Self {
            client,
            endpoint: endpoint.to_string(),
            session_id: RwLock::new(None),
            request_id: AtomicU64::new(1),
            open: AtomicBool::new(true),
        }))
    }

    #[allow(clippy::cast_possible_wrap)] // request IDs won't exceed i64::MAX
    fn next_id(&self) -> RequestId {
        RequestId::Number(self.request_id.fetch_add(1, Ordering::Relaxed) as i64)
    }

    async fn post(&self, body: &Value, timeout: Duration) -> Result<JsonRpcResponse> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .timeout(timeout)
            .header(header::CONTENT_TYPE, "application/json")
            .header("MCP-Protocol-Version", PROTOCOL_VERSION)
            .json(body);

        if let Some(ref session_id) = *self.session_id.read() {
            request = request.header("MCP-Session-Id", session_id.clone());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::ClientTimeout(format!("request to {} timed out", self.endpoint))
            } else {
                Error::Transport(e.to_string())
            }
        })?;

        if let Some(session_id) = response.headers().get("mcp-session-id") {
            if let Ok(id) = session_id.to_str() {
                *self.session_id.write() = Some(id.to_string());
            }
        }

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport(format!("HTTP {status} from {}", self.endpoint)));
        }

        let parsed: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("invalid JSON-RPC response: {e}")))?;
        Ok(parsed)
    }
}

#[async_trait]
impl McpClient for HttpClient {
    async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse> {
        if !self.open.load(Ordering::Relaxed) {
            return Err(Error::ClientNotConnected("client_closed".to_string()));
        }
        let request = JsonRpcRequest::new(self.next_id(), method, params);
        self.post(&serde_json::to_value(&request)?, timeout).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        if !self.open.load(Ordering::Relaxed) {
            return Err(Error::ClientNotConnected("client_closed".to_string()));
        }
        let notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params.unwrap_or_else(|| serde_json::json!({})),
        });
        // Some servers answer notifications with 202 and an empty body;
        // ignore everything except transport failures.
        let result = self
            .client
            .post(&self.endpoint)
            .timeout(Duration::from_secs(5))
            .header(header::CONTENT_TYPE, "application/json")
            .header("MCP-Protocol-Version", PROTOCOL_VERSION)
            .json(&notification)
            .send()
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) => Err(Error::Transport(e.to_string())),
        }
    }

    fn is_alive(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            debug!(endpoint = %self.endpoint, "http client closed");
        }
    }
}
