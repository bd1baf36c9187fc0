//! [`DataSource`]: the handle application code actually calls into from
//! inside a pool body — a named mapping's key resolution plus the per-
//! transaction overlay and lock client behind it.

use std::hash::Hash;
use std::sync::Arc;

use crate::key::{EntryKey, Natural};
use crate::lock::StorageLockClient;
use crate::overlay::{StorageEntry, StorageTransaction};
use crate::scope::BackendTransaction;

/// One scope's API surface for a single transaction: identify entities,
/// read them, and take a writable (copy-on-write) handle before mutating.
pub struct DataSource<K, V> {
    transaction: Arc<dyn BackendTransaction>,
    overlay: Arc<StorageTransaction<K, V>>,
    lock_client: Arc<StorageLockClient<K, V>>,
    identify_mapping: String,
}

impl<K, V> DataSource<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub(crate) fn new(
        transaction: Arc<dyn BackendTransaction>,
        overlay: Arc<StorageTransaction<K, V>>,
        lock_client: Arc<StorageLockClient<K, V>>,
        identify_mapping: String,
    ) -> Self {
        Self {
            transaction,
            overlay,
            lock_client,
            identify_mapping,
        }
    }

    /// The backend transaction backing this source. Concrete scopes
    /// typically downcast this (via `as_any`) to recover a connection or
    /// client handle.
    pub fn transaction(&self) -> &Arc<dyn BackendTransaction> {
        &self.transaction
    }

    pub fn identify(&self, value: &Arc<V>) -> EntryKey<K> {
        self.overlay.key_of(&self.identify_mapping, value)
    }

    pub fn entry(&self, mapping: &str) -> StorageEntry<'_, K, V> {
        self.overlay.entry(mapping)
    }

    pub async fn get(&self, mapping: &str, main: &K) -> Natural<V> {
        self.overlay.entry(mapping).get(main)
    }

    pub async fn get_restored(&self, mapping: &str, main: &K) -> anyhow::Result<Natural<V>> {
        self.overlay.entry(mapping).get_restored(main).await
    }

    /// Restore `value` (running the restoration callback at most once per
    /// transaction) without acquiring a write lock on it.
    pub async fn restore(&self, value: Arc<V>) -> anyhow::Result<Arc<V>> {
        self.overlay.restore(value).await
    }

    /// Lock `value` for the rest of this transaction, copy-on-write it
    /// into the overlay, and restore it before handing back the writable
    /// clone.
    pub async fn writable(&self, value: Arc<V>) -> anyhow::Result<Arc<V>> {
        self.lock_client.lock_value(value.clone()).await;
        let writable = self.overlay.take_writable(&value).unwrap_or(value);
        self.overlay.restore(writable).await
    }

    pub fn save(&self, value: Arc<V>, keys: std::collections::HashMap<String, EntryKey<K>>) {
        self.overlay.save(value, &keys);
    }

    pub fn remember(&self, value: Arc<V>, keys: std::collections::HashMap<String, EntryKey<K>>) {
        self.overlay.remember(value, &keys);
    }

    pub fn delete(&self, value: &Arc<V>) {
        self.overlay.delete(value);
    }

    /// Hook for concrete sources to run their own cleanup on transaction
    /// flush. A no-op by default — overlay flushing itself is driven by
    /// the owning cache, not by the source.
    pub async fn flush(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Hook for concrete sources to run their own cleanup on transaction
    /// release. A no-op by default.
    pub async fn release(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
