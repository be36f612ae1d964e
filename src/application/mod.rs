//! Application layer: commands, queries and their handlers
//!
//! Handlers execute against the repository and publish each touched
//! aggregate's events before returning, so observers see a consistent
//! ordering per provider.

pub mod commands;
pub mod handlers;
pub mod queries;
pub mod reload;
