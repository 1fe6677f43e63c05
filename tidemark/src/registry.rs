//! Adapter registry resolving Home and Store implementations by type tag.
//!
//! Adapters are constructed once, at setup time, from a JSON config
//! fragment. The flow itself only ever sees the resulting trait objects.

use crate::errors::{Result, TidemarkError};
use crate::flow::{Home, Store};
use crate::staging::{LocalStagingBackend, StagedBatchStore};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Factory building a Home from its config.
pub type HomeFactory = Box<dyn Fn(&serde_json::Value) -> Result<Arc<dyn Home>> + Send + Sync>;

/// Factory building a Store from its config.
pub type StoreFactory = Box<dyn Fn(&serde_json::Value) -> Result<Box<dyn Store>> + Send + Sync>;

/// Tag of the built-in staged JSON-lines store.
pub const STAGED_JSONL: &str = "staged_jsonl";

/// A tagged adapter declaration, e.g. `{"type": "staged_jsonl", "config": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterSpec {
    /// Registered type tag.
    #[serde(rename = "type")]
    pub kind: String,
    /// Adapter-specific settings.
    #[serde(default)]
    pub config: serde_json::Value,
}

impl AdapterSpec {
    /// Creates a spec.
    #[must_use]
    pub fn new(kind: impl Into<String>, config: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            config,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StagedJsonlConfig {
    root: PathBuf,
    destination: String,
    #[serde(default = "default_rename")]
    rename: bool,
}

fn default_rename() -> bool {
    true
}

/// Maps type tags to adapter constructors.
#[derive(Default)]
pub struct AdapterRegistry {
    homes: RwLock<HashMap<String, HomeFactory>>,
    stores: RwLock<HashMap<String, StoreFactory>>,
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("homes", &self.home_types())
            .field("stores", &self.store_types())
            .finish()
    }
}

impl AdapterRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in stores registered.
    #[must_use]
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register_store(
            STAGED_JSONL,
            Box::new(|config: &serde_json::Value| -> Result<Box<dyn Store>> {
                let config: StagedJsonlConfig = serde_json::from_value(config.clone())
                    .map_err(|e| {
                        TidemarkError::configuration(format!("invalid {STAGED_JSONL} config: {e}"))
                    })?;
                let mut backend = LocalStagingBackend::new(config.root);
                if !config.rename {
                    backend = backend.without_rename();
                }
                Ok(Box::new(StagedBatchStore::new(
                    Arc::new(backend),
                    config.destination,
                )))
            }),
        );
        registry
    }

    /// Registers a Home factory, replacing any previous one for the tag.
    pub fn register_home(&self, kind: impl Into<String>, factory: HomeFactory) {
        self.homes.write().insert(kind.into(), factory);
    }

    /// Registers a Store factory, replacing any previous one for the tag.
    pub fn register_store(&self, kind: impl Into<String>, factory: StoreFactory) {
        self.stores.write().insert(kind.into(), factory);
    }

    /// Builds a Home.
    pub fn create_home(&self, spec: &AdapterSpec) -> Result<Arc<dyn Home>> {
        let homes = self.homes.read();
        let factory = homes.get(&spec.kind).ok_or_else(|| {
            TidemarkError::configuration(format!("no home registered for type '{}'", spec.kind))
        })?;
        factory(&spec.config)
    }

    /// Builds a Store.
    pub fn create_store(&self, spec: &AdapterSpec) -> Result<Box<dyn Store>> {
        let stores = self.stores.read();
        let factory = stores.get(&spec.kind).ok_or_else(|| {
            TidemarkError::configuration(format!("no store registered for type '{}'", spec.kind))
        })?;
        factory(&spec.config)
    }

    /// Checks if a Home type is registered.
    #[must_use]
    pub fn can_create_home(&self, kind: &str) -> bool {
        self.homes.read().contains_key(kind)
    }

    /// Checks if a Store type is registered.
    #[must_use]
    pub fn can_create_store(&self, kind: &str) -> bool {
        self.stores.read().contains_key(kind)
    }

    /// Registered Home tags, sorted.
    pub fn home_types(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.homes.read().keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Registered Store tags, sorted.
    pub fn store_types(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.stores.read().keys().cloned().collect();
        kinds.sort();
        kinds
    }
}
