//! Query type catalog
//!
//! Queries are pure reads; their handlers never mutate state or emit events.

/// Routing discriminant for query dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    /// Summaries of all providers
    ListProviders,
    /// Full details of one provider
    GetProvider,
    /// Tool schemas of one provider
    GetProviderTools,
}

/// List provider summaries, optionally filtered by state label
#[derive(Debug, Clone, Default)]
pub struct ListProvidersQuery {
    /// Only providers in this state ("cold", "ready", "degraded", "dead")
    pub state_filter: Option<String>,
}

/// Full details of one provider
#[derive(Debug, Clone)]
pub struct GetProviderQuery {
    /// Provider to describe
    pub provider_id: String,
}

/// Tool schemas of one provider
#[derive(Debug, Clone)]
pub struct GetProviderToolsQuery {
    /// Provider whose catalog to return
    pub provider_id: String,
}

/// The closed set of queries the bus routes
#[derive(Debug, Clone)]
pub enum Query {
    /// List provider summaries
    ListProviders(ListProvidersQuery),
    /// Describe one provider
    GetProvider(GetProviderQuery),
    /// List one provider's tools
    GetProviderTools(GetProviderToolsQuery),
}

impl Query {
    /// Routing discriminant
    #[must_use]
    pub fn kind(&self) -> QueryKind {
        match self {
            Self::ListProviders(_) => QueryKind::ListProviders,
            Self::GetProvider(_) => QueryKind::GetProvider,
            Self::GetProviderTools(_) => QueryKind::GetProviderTools,
        }
    }
}
