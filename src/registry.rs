//! Named callbacks that limiter options can refer to.
//!
//! Configuration is plain data, so rejection handlers and store callbacks are
//! registered here under a name and looked up when the limiter is built.

use std::collections::HashMap;
use std::fmt;

use crate::http::RejectionHandler;
use crate::ratelimit::{StoreAccessor, StoreMutator};

/// Rejection handlers and store callbacks, keyed by name.
#[derive(Clone, Default)]
pub struct Registry {
    handlers: HashMap<String, RejectionHandler>,
    accessors: HashMap<String, StoreAccessor>,
    mutators: HashMap<String, StoreMutator>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rejection handler.
    pub fn with_handler(mut self, name: impl Into<String>, handler: RejectionHandler) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    /// Register a store accessor.
    pub fn with_accessor(mut self, name: impl Into<String>, accessor: StoreAccessor) -> Self {
        self.accessors.insert(name.into(), accessor);
        self
    }

    /// Register a store mutator.
    pub fn with_mutator(mut self, name: impl Into<String>, mutator: StoreMutator) -> Self {
        self.mutators.insert(name.into(), mutator);
        self
    }

    /// Look up a rejection handler by name.
    pub fn handler(&self, name: &str) -> Option<RejectionHandler> {
        self.handlers.get(name).cloned()
    }

    /// Look up a store accessor by name.
    pub fn accessor(&self, name: &str) -> Option<StoreAccessor> {
        self.accessors.get(name).cloned()
    }

    /// Look up a store mutator by name.
    pub fn mutator(&self, name: &str) -> Option<StoreMutator> {
        self.mutators.get(name).cloned()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("accessors", &self.accessors.keys().collect::<Vec<_>>())
            .field("mutators", &self.mutators.keys().collect::<Vec<_>>())
            .finish()
    }
}
