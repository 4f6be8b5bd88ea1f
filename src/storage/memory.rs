use super::StateStore;

use anyhow::Result;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use std::sync::Arc;

/// In-process store. Cloning the `Arc` and handing it to several grids gives
/// them one shared durable layer, which is how a local cluster models a
/// cluster-wide database.
#[derive(Default)]
pub struct MemoryStore {
    namespaces: DashMap<String, DashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn namespace_count(&self) -> usize {
        self.namespaces.len()
    }
}

impl StateStore for MemoryStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        Ok(self
            .namespaces
            .get(namespace)
            .and_then(|entries| entries.get(key).map(|value| value.value().clone())))
    }

    fn put(&self, namespace: &str, key: &str, value: Value) -> Result<()> {
        self.namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    fn insert_if_absent(&self, namespace: &str, key: &str, value: Value) -> Result<bool> {
        let entries = self.namespaces.entry(namespace.to_string()).or_default();
        let inserted = match entries.entry(key.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(value);
                true
            }
        };
        Ok(inserted)
    }

    fn remove(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        Ok(self
            .namespaces
            .get(namespace)
            .and_then(|entries| entries.remove(key).map(|(_, value)| value)))
    }

    fn clear(&self, namespace: &str) -> Result<()> {
        if let Some(entries) = self.namespaces.get(namespace) {
            entries.clear();
        }
        Ok(())
    }

    fn is_empty(&self, namespace: &str) -> Result<bool> {
        Ok(self
            .namespaces
            .get(namespace)
            .map(|entries| entries.is_empty())
            .unwrap_or(true))
    }

    fn store_exists(&self, namespace: &str) -> bool {
        self.namespaces.contains_key(namespace)
    }
}
