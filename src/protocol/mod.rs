//! MCP protocol vocabulary
//!
//! The hangar treats MCP opaquely: `initialize`, `tools/list`, `tools/call`
//! and `shutdown` are the only methods it ever emits toward a provider.

mod messages;
mod types;

pub use messages::{JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId};
pub use types::{CatalogSource, ToolCatalog, ToolSchema};

/// MCP protocol version spoken toward providers
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC error code used for synthetic responses fabricated by a client
/// when its transport dies. Distinguishes transport death from a genuine
/// provider-side RPC error.
pub const CLIENT_CLOSED_CODE: i64 = -32010;
