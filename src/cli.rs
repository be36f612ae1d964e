//! Command-line interface

use std::path::PathBuf;

use clap::Parser;

/// MCP provider control plane - supervise, balance and hot-reload a fleet
/// of MCP tool back-ends
#[derive(Parser, Debug)]
#[command(name = "mcp-hangar")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "MCP_HANGAR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "MCP_HANGAR_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "MCP_HANGAR_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// Disable config file watching
    #[arg(long)]
    pub no_watch: bool,
}
