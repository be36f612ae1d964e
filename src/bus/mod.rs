//! In-process buses: events, commands, queries
//!
//! The command and query buses are the only approved way for outer layers
//! to reach the domain; the event bus carries observations back out.

mod command_bus;
mod event_bus;
mod query_bus;

pub use command_bus::{CommandBus, CommandHandler};
pub use event_bus::{ErrorHandlerFn, EventBus, EventHandlerFn};
pub use query_bus::{QueryBus, QueryHandler};
