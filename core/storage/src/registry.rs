//! Backend registry for resolving ledger stores by name.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::provider::LedgerStore;
use vaultline_common::{Error, Result};

/// Factory function type for creating stores.
pub type StoreFactory = Box<dyn Fn(Value) -> Result<Arc<dyn LedgerStore>> + Send + Sync>;

/// Registry for ledger store factories.
///
/// Allows dynamic registration and resolution of backends by name and
/// configuration.
pub struct StoreRegistry {
    factories: HashMap<String, StoreFactory>,
}

impl StoreRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a store factory.
    ///
    /// # Errors
    /// - Returns `AlreadyExists` if name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: StoreFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::AlreadyExists(format!(
                "Store backend '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolve a store by backend name and configuration.
    ///
    /// # Errors
    /// - Backend not registered
    /// - Configuration invalid for the backend
    pub fn resolve(&self, name: &str, config: Value) -> Result<Arc<dyn LedgerStore>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Store backend '{}' is not registered", name)))?;
        factory(config)
    }

    /// Registered backend names, sorted.
    pub fn backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if a backend is registered.
    pub fn has_backend(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with the built-in backends.
///
/// - `memory`: ignores configuration
/// - `sqlite`: requires `{"path": "..."}`; `":memory:"` opens a private in-memory database
pub fn create_default_registry() -> Result<StoreRegistry> {
    let mut registry = StoreRegistry::new();

    registry.register(
        "memory",
        Box::new(|_config| Ok(Arc::new(crate::memory::MemoryStore::new()))),
    )?;

    registry.register(
        "sqlite",
        Box::new(|config| {
            let path = config.get("path").and_then(|v| v.as_str()).ok_or_else(|| {
                Error::InvalidInput("sqlite backend requires a 'path'".to_string())
            })?;
            let store = if path == ":memory:" {
                crate::sqlite::SqliteStore::in_memory()?
            } else {
                crate::sqlite::SqliteStore::open(path)?
            };
            Ok(Arc::new(store))
        }),
    )?;

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use serde_json::json;

    #[test]
    fn test_register_and_resolve() {
        let mut registry = StoreRegistry::new();
        registry
            .register("test", Box::new(|_| Ok(Arc::new(MemoryStore::new()))))
            .unwrap();

        let store = registry.resolve("test", Value::Null).unwrap();
        assert_eq!(store.name(), "memory");
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = StoreRegistry::new();
        registry
            .register("test", Box::new(|_| Ok(Arc::new(MemoryStore::new()))))
            .unwrap();

        let result = registry.register("test", Box::new(|_| Ok(Arc::new(MemoryStore::new()))));
        assert!(matches!(result, Err(Error::AlreadyExists(_))));
    }

    #[test]
    fn test_resolve_unknown_fails() {
        let registry = StoreRegistry::new();
        assert!(matches!(
            registry.resolve("unknown", Value::Null),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_default_registry_backends() {
        let registry = create_default_registry().unwrap();
        assert_eq!(registry.backends(), vec!["memory", "sqlite"]);

        let store = registry
            .resolve("sqlite", json!({ "path": ":memory:" }))
            .unwrap();
        assert_eq!(store.name(), "sqlite");
    }

    #[test]
    fn test_sqlite_requires_path() {
        let registry = create_default_registry().unwrap();
        assert!(matches!(
            registry.resolve("sqlite", json!({})),
            Err(Error::InvalidInput(_))
        ));
    }
}
