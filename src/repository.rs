//! Keyed provider collection

use std::sync::Arc;

use dashmap::DashMap;

use crate::domain::Provider;
use crate::{Error, Result};

/// Concurrency-safe `ProviderId -> Provider` collection.
///
/// The map serializes its own mutations; per-provider mutations serialize
/// on each provider's lock. Iteration is always over a snapshot so no
/// caller holds map shards across I/O.
#[derive(Default)]
pub struct ProviderRepository {
    providers: DashMap<String, Arc<Provider>>,
}

impl ProviderRepository {
    /// Create an empty repository
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a provider; rejects duplicate ids
    pub fn add(&self, provider: Arc<Provider>) -> Result<()> {
        use dashmap::mapref::entry::Entry;

        let id = provider.id().to_string();
        match self.providers.entry(id.clone()) {
            Entry::Occupied(_) => Err(Error::Configuration(format!(
                "provider '{id}' already registered"
            ))),
            Entry::Vacant(slot) => {
                slot.insert(provider);
                Ok(())
            }
        }
    }

    /// Look up a provider
    #[must_use]
    pub fn get(&self, provider_id: &str) -> Option<Arc<Provider>> {
        self.providers.get(provider_id).map(|p| Arc::clone(&p))
    }

    /// Whether the id is registered
    #[must_use]
    pub fn exists(&self, provider_id: &str) -> bool {
        self.providers.contains_key(provider_id)
    }

    /// Remove a provider; returns it when present
    pub fn remove(&self, provider_id: &str) -> Option<Arc<Provider>> {
        self.providers.remove(provider_id).map(|(_, p)| p)
    }

    /// Snapshot of all providers
    #[must_use]
    pub fn get_all(&self) -> Vec<Arc<Provider>> {
        self.providers.iter().map(|e| Arc::clone(&e)).collect()
    }

    /// Number of registered providers
    #[must_use]
    pub fn count(&self) -> usize {
        self.providers.len()
    }
}
