//! Owned in-memory entity stores.
//!
//! Same concurrency model as the budget ledger: each entity sits behind its
//! own mutex so commands against one entity serialize while different
//! entities proceed in parallel. Critical sections never perform IO; audit
//! and notification writes happen in the engine after locks are dropped.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, RwLock};

use procflow_core::DomainError;

/// Map of live entities, keyed by typed id.
#[derive(Debug)]
pub struct EntityStore<K, V> {
    entries: RwLock<HashMap<K, Arc<Mutex<V>>>>,
}

impl<K, V> Default for EntityStore<K, V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> EntityStore<K, V>
where
    K: Copy + Eq + Hash,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> DomainError {
        DomainError::conflict("entity store lock poisoned")
    }

    /// Insert a freshly created entity. Fails with `Conflict` if the id is
    /// already taken.
    pub fn insert_new(&self, id: K, value: V) -> Result<(), DomainError> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        if entries.contains_key(&id) {
            return Err(DomainError::conflict("entity already exists"));
        }
        entries.insert(id, Arc::new(Mutex::new(value)));
        Ok(())
    }

    /// Clone the handle for an entity so its mutex can be held across a
    /// multi-store operation.
    pub fn handle(&self, id: K) -> Result<Arc<Mutex<V>>, DomainError> {
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        entries.get(&id).cloned().ok_or(DomainError::NotFound)
    }

    /// Run `f` with exclusive access to the entity.
    pub fn with<R>(
        &self,
        id: K,
        f: impl FnOnce(&mut V) -> Result<R, DomainError>,
    ) -> Result<R, DomainError> {
        let handle = self.handle(id)?;
        let mut value = handle.lock().map_err(|_| Self::poisoned())?;
        f(&mut value)
    }

    /// Read a point-in-time copy of the entity.
    pub fn get(&self, id: K) -> Result<V, DomainError>
    where
        V: Clone,
    {
        let handle = self.handle(id)?;
        let value = handle.lock().map_err(|_| Self::poisoned())?;
        Ok(value.clone())
    }

    /// Ids of all live entities (for sweeps).
    pub fn ids(&self) -> Result<Vec<K>, DomainError> {
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        Ok(entries.keys().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_is_first_writer_wins() {
        let store: EntityStore<u32, String> = EntityStore::new();
        store.insert_new(1, "a".to_string()).unwrap();

        let err = store.insert_new(1, "b".to_string()).unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
        assert_eq!(store.get(1).unwrap(), "a");
    }

    #[test]
    fn with_mutates_in_place() {
        let store: EntityStore<u32, i64> = EntityStore::new();
        store.insert_new(7, 10).unwrap();

        store
            .with(7, |v| {
                *v += 5;
                Ok(())
            })
            .unwrap();
        assert_eq!(store.get(7).unwrap(), 15);
    }

    #[test]
    fn missing_entity_is_not_found() {
        let store: EntityStore<u32, i64> = EntityStore::new();
        assert!(matches!(store.get(9), Err(DomainError::NotFound)));
    }
}
