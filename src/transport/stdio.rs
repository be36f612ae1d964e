//! Supervised stdio JSON-RPC client (subprocess and container providers)

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::McpClient;
use crate::protocol::{CLIENT_CLOSED_CODE, JsonRpcRequest, JsonRpcResponse, RequestId};
use crate::{Error, Result};

/// Timeout for the best-effort `shutdown` RPC during close
const SHUTDOWN_RPC_TIMEOUT: Duration = Duration::from_secs(2);

/// Grace period between asking the child to exit and killing it
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Thread-safe JSON-RPC client over a child process's stdio.
///
/// Concurrency contract: any number of tasks may `call` concurrently; the
/// reader task is the sole consumer of the child's stdout and the only
/// producer into the pending rendezvous slots.
pub struct StdioClient {
    /// Child process; taken during close
    child: Mutex<Option<Child>>,
    /// Writer half of the child's stdin
    writer: Mutex<Option<ChildStdin>>,
    /// In-flight requests awaiting their correlated response
    pending: dashmap::DashMap<String, oneshot::Sender<JsonRpcResponse>>,
    /// Set once close() has begun; later calls are refused
    closed: AtomicBool,
    /// Cleared when the reader task exits (EOF or read error)
    reader_alive: Arc<AtomicBool>,
}

impl StdioClient {
    /// Wrap an already-spawned child with piped stdin/stdout and launch the
    /// dedicated reader task.
    pub fn new(mut child: Child) -> Result<Arc<Self>> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Transport("child has no piped stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport("child has no piped stdout".to_string()))?;

        let client = Arc::new(Self {
            child: Mutex::new(Some(child)),
            writer: Mutex::new(Some(stdin)),
            pending: dashmap::DashMap::new(),
            closed: AtomicBool::new(false),
            reader_alive: Arc::new(AtomicBool::new(true)),
        });

        let reader = Arc::clone(&client);
        tokio::spawn(async move {
            debug!("stdio reader task started");
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => reader.route_line(&line),
                    Ok(None) => {
                        warn!("EOF on provider stdout, process died");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "error reading provider stdout");
                        break;
                    }
                }
            }
            reader.reader_alive.store(false, Ordering::Relaxed);
            reader.drain_pending("reader_exited");
            debug!("stdio reader task ended");
        });

        Ok(client)
    }

    /// Route one stdout line to its waiting caller.
    ///
    /// Malformed JSON and unsolicited notifications are logged and dropped.
    fn route_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        let response: JsonRpcResponse = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, line = %line, "malformed JSON from provider");
                return;
            }
        };

        let Some(ref id) = response.id else {
            debug!("unsolicited notification from provider, dropping");
            return;
        };

        let key = id.to_string();
        if let Some((_, sender)) = self.pending.remove(&key) {
            // Receiver may have timed out and dropped; the late response is
            // then discarded, never returned to any caller.
            let _ = sender.send(response);
        } else {
            debug!(id = %key, "response for unknown or expired request, dropping");
        }
    }

    /// Fail every pending rendezvous with a synthetic error response
    fn drain_pending(&self, reason: &str) {
        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, sender)) = self.pending.remove(&key) {
                let _ = sender.send(JsonRpcResponse::error(
                    Some(RequestId::String(key)),
                    CLIENT_CLOSED_CODE,
                    reason,
                ));
            }
        }
    }

    /// Write one newline-terminated message to the child's stdin
    async fn write_line(&self, message: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let Some(ref mut stdin) = *writer else {
            return Err(Error::ClientNotConnected("client_closed".to_string()));
        };
        stdin
            .write_all(message.as_bytes())
            .await
            .map_err(|e| Error::ClientNotConnected(format!("write_failed: {e}")))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| Error::ClientNotConnected(format!("write_failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| Error::ClientNotConnected(format!("write_failed: {e}")))?;
        Ok(())
    }

    /// The call path shared by `call` and the close-time `shutdown` RPC
    async fn call_inner(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        let request = JsonRpcRequest::new(RequestId::String(id.clone()), method, params);
        let message = serde_json::to_string(&request)?;

        if let Err(e) = self.write_line(&message).await {
            self.pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => {
                // A drained rendezvous arrives as a synthetic error carrying
                // the transport-death code; surface it as a client fault,
                // not as a provider RPC error.
                if let Some(ref err) = response.error {
                    if err.code == CLIENT_CLOSED_CODE {
                        return Err(Error::ClientNotConnected(err.message.clone()));
                    }
                }
                Ok(response)
            }
            Ok(Err(_)) => Err(Error::ClientNotConnected("client_closed".to_string())),
            Err(_) => {
                self.pending.remove(&id);
                Err(Error::ClientTimeout(format!(
                    "{method} timed out after {}s",
                    timeout.as_secs_f64()
                )))
            }
        }
    }
}

#[async_trait]
impl McpClient for StdioClient {
    async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::ClientNotConnected("client_closed".to_string()));
        }
        self.call_inner(method, params, timeout).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::ClientNotConnected("client_closed".to_string()));
        }
        let notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params.unwrap_or_else(|| serde_json::json!({})),
        });
        self.write_line(&serde_json::to_string(&notification)?).await
    }

    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::Relaxed) && self.reader_alive.load(Ordering::Relaxed)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Cooperative shutdown first; absence of the RPC is non-fatal.
        if self.reader_alive.load(Ordering::Relaxed) {
            if let Err(e) = self
                .call_inner("shutdown", None, SHUTDOWN_RPC_TIMEOUT)
                .await
            {
                debug!(error = %e, "shutdown RPC failed (expected for most providers)");
            }
        }

        // Closing stdin signals EOF to well-behaved children.
        *self.writer.lock().await = None;

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!(?status, "provider process exited"),
                Ok(Err(e)) => warn!(error = %e, "error waiting for provider process"),
                Err(_) => {
                    warn!("provider process did not exit within grace period, killing");
                    let _ = child.kill().await;
                }
            }
        }

        self.drain_pending("client_closed");
    }
}
