//! Protocol catalogue shared between parser instances.
//!
//! Readers (`get`, `list`) run in parallel; writers (`register`,
//! `unregister`) exclude everyone. Constructed explicitly by the embedder,
//! there is no hidden global instance.

use crate::builtins;
use crate::field::ProtocolDefinition;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

#[derive(Default)]
pub struct ProtocolRegistry {
    protocols: RwLock<HashMap<String, ProtocolDefinition>>,
    usage: RwLock<HashMap<String, u64>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in protocol set.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.load_builtins();
        registry
    }

    /// Rejects duplicate names.
    pub fn register(&self, protocol: ProtocolDefinition) -> Result<()> {
        let mut protocols = self.protocols.write().unwrap();
        if protocols.contains_key(&protocol.name) {
            return Err(Error::DuplicateProtocol(protocol.name));
        }
        debug!(protocol = %protocol.name, "registering protocol");
        protocols.insert(protocol.name.clone(), protocol);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<()> {
        let mut protocols = self.protocols.write().unwrap();
        if protocols.remove(name).is_none() {
            return Err(Error::UnknownProtocol(name.to_string()));
        }
        self.usage.write().unwrap().remove(name);
        Ok(())
    }

    /// Looks up a definition and bumps its usage counter.
    pub fn get(&self, name: &str) -> Option<ProtocolDefinition> {
        let protocols = self.protocols.read().unwrap();
        let found = protocols.get(name).cloned();
        if found.is_some() {
            *self.usage.write().unwrap().entry(name.to_string()).or_insert(0) += 1;
        }
        found
    }

    pub fn contains(&self, name: &str) -> bool {
        self.protocols.read().unwrap().contains_key(name)
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.protocols.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.protocols.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.protocols.read().unwrap().is_empty()
    }

    /// How many times `get` has resolved this protocol.
    pub fn usage_count(&self, name: &str) -> u64 {
        self.usage.read().unwrap().get(name).copied().unwrap_or(0)
    }

    /// Loads the built-in definitions, skipping names already taken.
    pub fn load_builtins(&self) {
        for protocol in builtins::all() {
            let _ = self.register(protocol);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldDefinition;

    fn demo() -> ProtocolDefinition {
        ProtocolDefinition::new("demo", "1.0").with_field(FieldDefinition::u8("x", 0))
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let registry = ProtocolRegistry::new();
        registry.register(demo()).unwrap();
        assert!(matches!(
            registry.register(demo()),
            Err(Error::DuplicateProtocol(_))
        ));
    }

    #[test]
    fn test_register_unregister_restores_state() {
        let registry = ProtocolRegistry::new();
        let before = registry.list();
        registry.register(demo()).unwrap();
        registry.unregister("demo").unwrap();
        assert_eq!(registry.list(), before);
        assert!(matches!(
            registry.unregister("demo"),
            Err(Error::UnknownProtocol(_))
        ));
    }

    #[test]
    fn test_get_bumps_usage_count() {
        let registry = ProtocolRegistry::new();
        registry.register(demo()).unwrap();
        assert_eq!(registry.usage_count("demo"), 0);
        registry.get("demo");
        registry.get("demo");
        assert_eq!(registry.usage_count("demo"), 2);
        assert_eq!(registry.usage_count("missing"), 0);
    }

    #[test]
    fn test_builtins_present() {
        let registry = ProtocolRegistry::with_builtins();
        for name in ["ethernet", "ipv4", "ipv6", "tcp", "udp", "icmp", "arp", "vlan", "mpls", "dns"] {
            assert!(registry.contains(name), "missing builtin {name}");
        }
    }
}
