//! Read-only car registry.
//!
//! Maps a scaled request value (milliseconds) to a car make. The map is
//! populated once at startup and never mutated, so sessions share it
//! through an `Arc` without locking.

use crate::config::RegistryEntry;
use std::collections::HashMap;
use tracing::info;

/// Lookup capability the session handler depends on.
pub trait Lookup: Send + Sync {
    /// Return the value registered for `key`, or a not-found message.
    fn lookup(&self, key: u64) -> String;
}

/// Immutable key to display-string mapping
#[derive(Debug)]
pub struct Registry {
    entries: HashMap<u64, String>,
    not_found: String,
}

impl Registry {
    /// Build a registry from seed entries.
    pub fn new(entries: impl IntoIterator<Item = RegistryEntry>, not_found: String) -> Self {
        let entries: HashMap<u64, String> = entries
            .into_iter()
            .map(|entry| (entry.key, entry.value))
            .collect();

        info!(entries = entries.len(), "Initializing registry");

        Self { entries, not_found }
    }
}

impl Lookup for Registry {
    fn lookup(&self, key: u64) -> String {
        self.entries
            .get(&key)
            .unwrap_or(&self.not_found)
            .clone()
    }
}
