//! Host name to address mapping shared by every worker.

use std::sync::Arc;

use dashmap::DashMap;

/// Concurrent map from instance name to the address SSH should dial.
///
/// Cloning is cheap; all clones share the same map. Keys are unique instance
/// names so workers never contend on the same entry.
#[derive(Clone, Debug, Default)]
pub struct HostRegistry {
    hosts: Arc<DashMap<String, String>>,
}

impl HostRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `name` reachable at `address`, replacing any earlier entry.
    pub fn register(&self, name: &str, address: &str) {
        self.hosts.insert(name.to_owned(), address.to_owned());
    }

    /// Returns the registered address for `name`.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<String> {
        self.hosts.get(name).map(|entry| entry.value().clone())
    }

    /// Returns the registered address, or `name` itself when none is known.
    #[must_use]
    pub fn address_for(&self, name: &str) -> String {
        self.lookup(name).unwrap_or_else(|| name.to_owned())
    }

    /// Forgets `name`.
    pub fn remove(&self, name: &str) {
        self.hosts.remove(name);
    }
}
