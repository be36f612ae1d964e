//! Tool schema and catalog types

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Schema of a single tool exposed by a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Tool name (1-128 chars, [a-zA-Z0-9_.-])
    pub name: String,
    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Input JSON Schema
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
    /// Output JSON Schema
    #[serde(rename = "outputSchema", default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

/// Where a catalog came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogSource {
    /// Declared in the provider's configuration; visible before start
    Predefined,
    /// Discovered from the provider's `tools/list` after the handshake
    Discovered,
}

/// Ordered tool-name -> schema catalog for one provider.
///
/// Insertion order is preserved so listings are stable across calls.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCatalog {
    tools: Vec<ToolSchema>,
    source: CatalogSource,
}

impl ToolCatalog {
    /// Empty discovered catalog (provider not yet started)
    #[must_use]
    pub fn empty() -> Self {
        Self {
            tools: Vec::new(),
            source: CatalogSource::Discovered,
        }
    }

    /// Catalog declared up-front in configuration
    #[must_use]
    pub fn predefined(tools: Vec<ToolSchema>) -> Self {
        Self {
            tools,
            source: CatalogSource::Predefined,
        }
    }

    /// Catalog discovered from a `tools/list` result
    #[must_use]
    pub fn discovered(tools: Vec<ToolSchema>) -> Self {
        Self {
            tools,
            source: CatalogSource::Discovered,
        }
    }

    /// Parse the `{"tools": [...]}` result of a `tools/list` RPC
    pub fn from_tools_list(result: &Value) -> Result<Self> {
        let tools = result
            .get("tools")
            .ok_or_else(|| Error::Protocol("tools/list result missing 'tools'".to_string()))?;
        let tools: Vec<ToolSchema> = serde_json::from_value(tools.clone())?;
        Ok(Self::discovered(tools))
    }

    /// Look up a tool by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ToolSchema> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// True when the catalog has a tool with this name
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Tool names in catalog order
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    /// All schemas in catalog order
    #[must_use]
    pub fn tools(&self) -> &[ToolSchema] {
        &self.tools
    }

    /// Number of tools
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// True when no tools are known
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Whether this catalog was predefined or discovered
    #[must_use]
    pub fn source(&self) -> CatalogSource {
        self.source
    }
}
