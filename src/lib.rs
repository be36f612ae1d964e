//! mcp-hangar library
//!
//! Control plane for MCP tool providers: a supervisor that owns a fleet of
//! heterogeneous back-ends (subprocesses, containers, remote endpoints) and
//! multiplexes tool calls across it with hot-loading, health monitoring,
//! idle garbage collection, load balancing and rate limiting.
//!
//! # Architecture
//!
//! - **Domain**: [`domain::Provider`] and [`domain::ProviderGroup`]
//!   aggregates; all mutation under per-aggregate locks, observations leave
//!   as [`domain::DomainEvent`]s.
//! - **Buses**: [`bus::CommandBus`] / [`bus::QueryBus`] are the only write
//!   and read paths for outer layers; [`bus::EventBus`] fans observations
//!   out to logging, security and saga subscribers.
//! - **Transport**: newline-delimited JSON-RPC over child stdio, or HTTP
//!   for remote providers.
//! - **Workers**: periodic idle-GC and health sweeps, plus a config-file
//!   watcher that turns edits into reload commands.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod application;
pub mod bus;
pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod failsafe;
pub mod middleware;
pub mod protocol;
pub mod registry;
pub mod repository;
pub mod runtime;
pub mod saga;
pub mod subscribers;
pub mod transport;
pub mod validator;
pub mod workers;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
