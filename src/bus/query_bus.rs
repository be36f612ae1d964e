//! Query dispatch: one handler per query kind
//!
//! Queries are pure reads by contract: handlers must not mutate aggregates
//! or emit events.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use crate::application::queries::{Query, QueryKind};
use crate::{Error, Result};

/// Handles one or more query kinds
#[async_trait]
pub trait QueryHandler: Send + Sync {
    /// Execute the query and return its result payload
    async fn handle(&self, query: Query) -> Result<Value>;
}

/// Routes queries to their registered handlers
#[derive(Default)]
pub struct QueryBus {
    handlers: RwLock<HashMap<QueryKind, Arc<dyn QueryHandler>>>,
}

impl QueryBus {
    /// Create an empty bus
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a query kind; registration is exclusive
    pub fn register(&self, kind: QueryKind, handler: Arc<dyn QueryHandler>) -> Result<()> {
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&kind) {
            return Err(Error::Internal(format!(
                "handler already registered for {kind:?}"
            )));
        }
        handlers.insert(kind, handler);
        debug!(?kind, "query handler registered");
        Ok(())
    }

    /// Dispatch a query to its handler
    pub async fn execute(&self, query: Query) -> Result<Value> {
        let kind = query.kind();
        let handler = self
            .handlers
            .read()
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("no handler registered for {kind:?}")))?;
        handler.handle(query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::queries::ListProvidersQuery;

    struct EmptyList;

    #[async_trait]
    impl QueryHandler for EmptyList {
        async fn handle(&self, _query: Query) -> Result<Value> {
            Ok(serde_json::json!([]))
        }
    }

    #[tokio::test]
    async fn execute_reaches_the_registered_handler() {
        let bus = QueryBus::new();
        bus.register(QueryKind::ListProviders, Arc::new(EmptyList))
            .unwrap();
        let result = bus
            .execute(Query::ListProviders(ListProvidersQuery { state_filter: None }))
            .await
            .unwrap();
        assert!(result.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let bus = QueryBus::new();
        bus.register(QueryKind::ListProviders, Arc::new(EmptyList))
            .unwrap();
        assert!(
            bus.register(QueryKind::ListProviders, Arc::new(EmptyList))
                .is_err()
        );
    }
}
