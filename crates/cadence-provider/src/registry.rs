use crate::provider::Provider;
use cadence_core::{CadenceError, CadenceResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Builds a provider instance on first use.
pub type ProviderFactory = Box<dyn Fn() -> CadenceResult<Arc<dyn Provider>> + Send + Sync>;

/// Explicit provider registry, populated once at startup.
///
/// Factories are registered by id; instances are created lazily on the first
/// [`get`](Self::get) and cached for the life of the registry.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: RwLock<HashMap<String, ProviderFactory>>,
    instances: RwLock<HashMap<String, Arc<dyn Provider>>>,
}

impl ProviderRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `id`. Registering the same id twice is an error.
    pub fn register_provider(
        &self,
        id: impl Into<String>,
        factory: ProviderFactory,
    ) -> CadenceResult<()> {
        let id = id.into();
        let mut factories = self.factories.write();
        if factories.contains_key(&id) {
            return Err(CadenceError::Validation(format!(
                "provider '{id}' is already registered"
            )));
        }
        info!(provider = %id, "Registered provider");
        factories.insert(id, factory);
        Ok(())
    }

    /// Register an already-built provider under its own id.
    pub fn register_instance(&self, provider: Arc<dyn Provider>) -> CadenceResult<()> {
        let id = provider.id().to_string();
        self.register_provider(id, Box::new(move || Ok(provider.clone())))
    }

    /// Resolve a provider, instantiating it on first access.
    pub fn get(&self, id: &str) -> CadenceResult<Arc<dyn Provider>> {
        if let Some(provider) = self.instances.read().get(id) {
            return Ok(provider.clone());
        }

        let provider = {
            let factories = self.factories.read();
            let factory = factories
                .get(id)
                .ok_or_else(|| CadenceError::not_found("provider", id))?;
            factory()?
        };
        debug!(provider = %id, "Instantiated provider");

        // Another caller may have raced us here; the first instance wins.
        let mut instances = self.instances.write();
        Ok(instances
            .entry(id.to_string())
            .or_insert(provider)
            .clone())
    }

    /// Whether a provider is registered under `id`.
    pub fn contains(&self, id: &str) -> bool {
        self.factories.read().contains_key(id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.factories.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}
