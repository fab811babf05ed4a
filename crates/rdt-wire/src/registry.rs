//! Bidirectional module name ↔ id map.

use std::collections::HashMap;

/// Maps module names to the `u32` identifiers carried on the wire.
///
/// Starts seeded with the default triple `{0: "node", 1: "database",
/// 2: "plugin"}` and can be extended at startup with
/// [`ModuleRegistry::register`].
#[derive(Debug, Clone)]
pub struct ModuleRegistry {
    name_to_id: HashMap<String, u32>,
    id_to_name: HashMap<u32, String>,
}

impl ModuleRegistry {
    /// An empty registry with no modules known.
    pub fn empty() -> Self {
        ModuleRegistry {
            name_to_id: HashMap::new(),
            id_to_name: HashMap::new(),
        }
    }

    /// The default registry: `node=0`, `database=1`, `plugin=2`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("node", 0);
        registry.register("database", 1);
        registry.register("plugin", 2);
        registry
    }

    /// Register (or overwrite) a module name/id pair.
    pub fn register(&mut self, name: impl Into<String>, id: u32) {
        let name = name.into();
        self.name_to_id.insert(name.clone(), id);
        self.id_to_name.insert(id, name);
    }

    /// Resolve a module name to its wire id.
    pub fn id_of(&self, name: &str) -> Option<u32> {
        self.name_to_id.get(name).copied()
    }

    /// Resolve a wire id to its module name, if registered.
    pub fn name_of(&self, id: u32) -> Option<&str> {
        self.id_to_name.get(&id).map(String::as_str)
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
