use std::collections::HashMap;
use std::sync::Arc;

use stoker_store::{TaskArgs, TaskValue};
use tracing::debug;

/// A registered task handler.
///
/// Handlers are plain synchronous functions; the worker moves them onto a
/// blocking thread before invoking them.
pub type HandlerFn = Arc<dyn Fn(TaskArgs) -> anyhow::Result<TaskValue> + Send + Sync>;

/// Name-to-function table built into the worker binary.
///
/// The stored handler column is a lookup key into this table, nothing is
/// ever imported or loaded dynamically. Host and worker construct the same
/// registry from the same code, so a name that registers on the producer
/// side resolves on the worker side.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, HandlerFn>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any earlier registration.
    pub fn register<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(TaskArgs) -> anyhow::Result<TaskValue> + Send + Sync + 'static,
    {
        if self
            .handlers
            .insert(name.to_string(), Arc::new(handler))
            .is_some()
        {
            debug!(name, "handler re-registered");
        }
    }

    /// Look a handler up by its stored name.
    pub fn resolve(&self, name: &str) -> Option<HandlerFn> {
        self.handlers.get(name).cloned()
    }

    /// Registered names in sorted order, for diagnostics.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_returns_the_registered_function() {
        let mut registry = HandlerRegistry::new();
        registry.register("double", |args| {
            let n = match args.positional.first() {
                Some(TaskValue::Int(n)) => *n,
                _ => anyhow::bail!("expected one integer"),
            };
            Ok(TaskValue::Int(n * 2))
        });

        let handler = registry.resolve("double").expect("registered");
        let out = handler(TaskArgs::positional(vec![TaskValue::Int(21)])).unwrap();
        assert_eq!(out, TaskValue::Int(42));
        assert!(registry.resolve("triple").is_none());
    }

    #[test]
    fn later_registration_wins() {
        let mut registry = HandlerRegistry::new();
        registry.register("f", |_| Ok(TaskValue::Int(1)));
        registry.register("f", |_| Ok(TaskValue::Int(2)));
        assert_eq!(registry.len(), 1);
        let handler = registry.resolve("f").unwrap();
        assert_eq!(handler(TaskArgs::none()).unwrap(), TaskValue::Int(2));
    }

    #[test]
    fn names_are_sorted() {
        let mut registry = HandlerRegistry::new();
        registry.register("zeta", |_| Ok(TaskValue::None));
        registry.register("alpha", |_| Ok(TaskValue::None));
        assert_eq!(registry.names(), vec!["alpha", "zeta"]);
    }
}
