//! Environment configuration and its change stream.
//!
//! The environment names the cloud provider in use plus whatever
//! provider-specific attributes it needs. Configuration changes reach
//! the provisioner through a `tokio::sync::watch` channel consumed
//! inside its control loop; the broker handle derived from the config is
//! owned by the loop and swapped wholesale, never shared behind a lock.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;

/// Environment configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironConfig {
    /// Environment name, for logs.
    pub name: String,

    /// Provider type resolved through the provider registry.
    pub provider_type: String,

    /// Whether unrecognized instances are protected from reclamation.
    #[serde(default)]
    pub safe_mode: bool,

    /// Provider-specific attributes, opaque to the provisioner.
    #[serde(default)]
    pub attrs: Map<String, Value>,
}

impl EnvironConfig {
    /// Creates a config for the given provider type.
    #[must_use]
    pub fn new(name: impl Into<String>, provider_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider_type: provider_type.into(),
            safe_mode: false,
            attrs: Map::new(),
        }
    }

    /// Sets safe mode on the config.
    #[must_use]
    pub fn with_safe_mode(mut self, on: bool) -> Self {
        self.safe_mode = on;
        self
    }

    /// Adds a provider attribute.
    #[must_use]
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    /// Returns a string attribute, if present.
    #[must_use]
    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).and_then(Value::as_str)
    }
}

/// Creates the environment change stream with its initial config.
#[must_use]
pub fn environ_channel(
    initial: EnvironConfig,
) -> (watch::Sender<EnvironConfig>, watch::Receiver<EnvironConfig>) {
    watch::channel(initial)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attrs_roundtrip() {
        let cfg = EnvironConfig::new("test", "dummy")
            .with_safe_mode(true)
            .with_attr("secret", "pork");
        assert!(cfg.safe_mode);
        assert_eq!(cfg.attr_str("secret"), Some("pork"));
        assert_eq!(cfg.attr_str("missing"), None);

        let json = serde_json::to_string(&cfg).unwrap();
        let back: EnvironConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }
}
