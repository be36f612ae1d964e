//! Command dispatch: one handler per command kind

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use crate::application::commands::{Command, CommandKind};
use crate::{Error, Result};

/// Handles one or more command kinds
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Execute the command and return its result payload
    async fn handle(&self, command: Command) -> Result<Value>;
}

/// Routes commands to their registered handlers.
///
/// Registration is exclusive: a second handler for the same kind is a
/// wiring bug and is rejected. The bus holds no state beyond the routing
/// table and is shared freely behind an `Arc`.
#[derive(Default)]
pub struct CommandBus {
    handlers: RwLock<HashMap<CommandKind, Arc<dyn CommandHandler>>>,
}

impl CommandBus {
    /// Create an empty bus
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a command kind
    pub fn register(&self, kind: CommandKind, handler: Arc<dyn CommandHandler>) -> Result<()> {
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&kind) {
            return Err(Error::Internal(format!(
                "handler already registered for {kind:?}"
            )));
        }
        handlers.insert(kind, handler);
        debug!(?kind, "command handler registered");
        Ok(())
    }

    /// Whether a handler is registered for the kind
    #[must_use]
    pub fn has_handler(&self, kind: CommandKind) -> bool {
        self.handlers.read().contains_key(&kind)
    }

    /// Dispatch a command to its handler
    pub async fn send(&self, command: Command) -> Result<Value> {
        let kind = command.kind();
        let handler = self
            .handlers
            .read()
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("no handler registered for {kind:?}")))?;
        debug!(?kind, "dispatching command");
        handler.handle(command).await
    }
}
