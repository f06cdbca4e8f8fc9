//! Adapter registry: name → adapter lookup with built-ins plus
//! declarative adapters loaded from the config directory.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use super::{
    AdapterError, AiderAdapter, ClaudeAdapter, CodexAdapter, ConfigurableAdapter, GenericAdapter,
    ToolAdapter,
};

/// Registry of available tool adapters.
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ToolAdapter>>,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterRegistry {
    /// Build a registry with the built-in adapters registered.
    pub fn new() -> Self {
        let mut registry = Self {
            adapters: HashMap::new(),
        };
        registry
            .register(Arc::new(ClaudeAdapter::new()))
            .expect("built-in adapter names are unique");
        registry
            .register(Arc::new(CodexAdapter::new()))
            .expect("built-in adapter names are unique");
        registry
            .register(Arc::new(AiderAdapter::new()))
            .expect("built-in adapter names are unique");
        registry
            .register(Arc::new(GenericAdapter::new()))
            .expect("built-in adapter names are unique");
        registry
    }

    /// Register an adapter. Names must be unique.
    pub fn register(&mut self, adapter: Arc<dyn ToolAdapter>) -> Result<(), AdapterError> {
        let name = adapter.name().to_string();
        if self.adapters.contains_key(&name) {
            return Err(AdapterError::DuplicateName(name));
        }
        self.adapters.insert(name, adapter);
        Ok(())
    }

    /// Exact lookup by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolAdapter>> {
        self.adapters.get(name).cloned()
    }

    /// Lookup with the generic fallback: an unregistered tool name
    /// resolves to the generic adapter, which launches the tool name as
    /// a binary with the prompt as its argument.
    pub fn resolve(&self, name: &str) -> Arc<dyn ToolAdapter> {
        self.get(name)
            .or_else(|| self.get("generic"))
            .expect("generic adapter is always registered")
    }

    /// Remove an adapter by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.adapters.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    /// Sorted adapter names, for error messages and listings.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Load every `*.toml` adapter definition in a directory.
    ///
    /// Individual bad files are logged and skipped so one broken
    /// definition cannot take down the registry.
    pub fn load_dir(&mut self, dir: &Path) -> usize {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return 0;
        };
        let mut loaded = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            match ConfigurableAdapter::from_toml(&path) {
                Ok(adapter) => {
                    let name = adapter.name().to_string();
                    match self.register(Arc::new(adapter)) {
                        Ok(()) => {
                            info!(adapter = %name, path = %path.display(), "loaded adapter");
                            loaded += 1;
                        }
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "skipping adapter");
                        }
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to load adapter");
                }
            }
        }
        loaded
    }
}
