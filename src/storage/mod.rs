//! Durable State Module
//!
//! A namespaced key-value store for coordination state that has to outlive a
//! single process: job state snapshots, task outcomes and pipeline checkpoints.
//!
//! ## Layers
//! - **`StateStore`**: the untyped capability (`serde_json::Value` records keyed by
//!   namespace + key). Atomicity of `insert_if_absent` is the store's job.
//! - **`DurableMap<V>`**: a typed view over one namespace.
//! - **`memory`**: `MemoryStore`, process-wide, shared by every simulated node of a
//!   local cluster.
//! - **`file`**: `FileStore`, one JSON file per namespace, locked and written
//!   atomically. Nodes sharing a state directory share durable state.

pub mod file;
pub mod memory;


use crate::error::GridResult;

use anyhow::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;

pub trait StateStore: Send + Sync {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>>;

    fn put(&self, namespace: &str, key: &str, value: Value) -> Result<()>;

    /// Returns `false` when the key already had a value.
    fn insert_if_absent(&self, namespace: &str, key: &str, value: Value) -> Result<bool>;

    fn remove(&self, namespace: &str, key: &str) -> Result<Option<Value>>;

    fn clear(&self, namespace: &str) -> Result<()>;

    fn is_empty(&self, namespace: &str) -> Result<bool>;

    /// Whether anything was ever stored under `namespace`.
    fn store_exists(&self, namespace: &str) -> bool;
}

/// Typed view over a single namespace of a [`StateStore`].
pub struct DurableMap<V> {
    store: Arc<dyn StateStore>,
    namespace: String,
    _marker: PhantomData<fn() -> V>,
}

impl<V> Clone for DurableMap<V> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            namespace: self.namespace.clone(),
            _marker: PhantomData,
        }
    }
}

impl<V> DurableMap<V>
where
    V: Serialize + DeserializeOwned,
{
    pub fn new(store: Arc<dyn StateStore>, namespace: &str) -> Self {
        Self {
            store,
            namespace: namespace.to_string(),
            _marker: PhantomData,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn get(&self, key: &str) -> GridResult<Option<V>> {
        match self.store.get(&self.namespace, key)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub fn put(&self, key: &str, value: &V) -> GridResult<()> {
        let value = serde_json::to_value(value)?;
        self.store.put(&self.namespace, key, value)?;
        Ok(())
    }

    pub fn insert_if_absent(&self, key: &str, value: &V) -> GridResult<bool> {
        let value = serde_json::to_value(value)?;
        Ok(self.store.insert_if_absent(&self.namespace, key, value)?)
    }

    pub fn remove(&self, key: &str) -> GridResult<Option<V>> {
        match self.store.remove(&self.namespace, key)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub fn clear(&self) -> GridResult<()> {
        Ok(self.store.clear(&self.namespace)?)
    }

    pub fn is_empty(&self) -> GridResult<bool> {
        Ok(self.store.is_empty(&self.namespace)?)
    }

    pub fn exists(&self) -> bool {
        self.store.store_exists(&self.namespace)
    }
}
