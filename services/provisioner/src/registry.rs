//! Provider registry: resolves a provider type name to a broker.
//!
//! An explicit object constructed at startup and passed by reference to
//! whatever opens environments. There is deliberately no ambient global
//! lookup table.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::broker::InstanceBroker;
use crate::environ::EnvironConfig;

/// Errors from opening an environment.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// The config names a provider type nothing registered.
    #[error("no registered provider for type {0:?}")]
    UnknownProvider(String),

    /// The provider rejected the config.
    #[error("cannot open environment: {0}")]
    Open(String),
}

/// Builds a broker from an environment config.
pub type BrokerFactory =
    Arc<dyn Fn(&EnvironConfig) -> Result<Arc<dyn InstanceBroker>, RegistryError> + Send + Sync>;

/// Maps provider type names to broker factories.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, BrokerFactory>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider type. A later registration for the same
    /// type replaces the earlier one.
    pub fn register(&mut self, provider_type: impl Into<String>, factory: BrokerFactory) {
        self.providers.insert(provider_type.into(), factory);
    }

    /// Opens a broker for the environment described by `config`.
    pub fn open(&self, config: &EnvironConfig) -> Result<Arc<dyn InstanceBroker>, RegistryError> {
        let factory = self
            .providers
            .get(&config.provider_type)
            .ok_or_else(|| RegistryError::UnknownProvider(config.provider_type.clone()))?;
        factory(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::DummyCloud;

    #[test]
    fn unknown_provider_is_rejected() {
        let registry = ProviderRegistry::new();
        let err = registry.open(&EnvironConfig::new("test", "unknown")).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownProvider(_)));
    }

    #[test]
    fn registered_provider_opens() {
        let cloud = DummyCloud::new();
        let mut registry = ProviderRegistry::new();
        registry.register("dummy", cloud.factory());
        assert!(registry.open(&EnvironConfig::new("test", "dummy")).is_ok());
    }
}
