//! Module-name to handler registry. Invoked synchronously from the
//! dispatcher's delivery-complete callback, so handlers must not block.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use serde_json::Value;

/// A record handler: node id the record arrived from, the decoded
/// record, and the address it arrived from.
pub type Handler = Arc<dyn Fn(u32, Value, SocketAddr) + Send + Sync>;

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, module: impl Into<String>, handler: F)
    where
        F: Fn(u32, Value, SocketAddr) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap()
            .insert(module.into(), Arc::new(handler));
    }

    pub fn get(&self, module: &str) -> Option<Handler> {
        self.handlers.read().unwrap().get(module).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc as StdArc;

    #[test]
    fn dispatches_to_the_registered_module() {
        let registry = HandlerRegistry::new();
        let seen = StdArc::new(AtomicU32::new(0));
        let seen2 = seen.clone();
        registry.register("telemetry", move |node_id, _value, _source| {
            seen2.store(node_id, Ordering::SeqCst);
        });

        let handler = registry.get("telemetry").unwrap();
        handler(9, Value::Null, "127.0.0.1:1".parse().unwrap());
        assert_eq!(seen.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn unknown_module_returns_none() {
        let registry = HandlerRegistry::new();
        assert!(registry.get("ghost").is_none());
    }
}
