//! In-process registry used by tests and short-lived embedders.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{Registry, RegistryEntry, RegistryError};

/// Registry held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    entries: Mutex<BTreeMap<String, RegistryEntry>>,
}

impl MemoryRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, RegistryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Registry for MemoryRegistry {
    fn register(&self, entry: RegistryEntry) -> Result<(), RegistryError> {
        self.lock().entry(entry.id()).or_insert(entry);
        Ok(())
    }

    fn deregister(&self, id: &str) -> Result<bool, RegistryError> {
        Ok(self.lock().remove(id).is_some())
    }

    fn get(&self, id: &str) -> Result<Option<RegistryEntry>, RegistryError> {
        Ok(self.lock().get(id).cloned())
    }

    fn list_all(&self) -> Result<Vec<RegistryEntry>, RegistryError> {
        Ok(self.lock().values().cloned().collect())
    }
}
