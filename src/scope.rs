//! [`Scope`]: the seam between this crate's in-memory machinery and one
//! concrete backing store (a SQL connection pool, an HTTP client, an
//! in-memory fixture for tests, ...).

use std::any::Any;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;

use crate::lock::{StorageLock, StorageLockClient};
use crate::overlay::{CloneFn, RestoreFn, StorageTransaction};
use crate::source::DataSource;
use crate::storage::Storage;

/// A backend-side unit of work. Scopes that share a `transaction_key`
/// share one `BackendTransaction` for the life of a pool entry (e.g. two
/// scopes both backed by the same database connection should commit and
/// roll back together).
#[async_trait]
pub trait BackendTransaction: Send + Sync {
    async fn commit(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn rollback(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Escape hatch so a concrete backend can recover its own connection
    /// or client handle from the trait object.
    fn as_any(&self) -> &dyn Any;
}

/// One backing store's view of one entity family: how to open a backend
/// transaction, which storage and lock table back it, and what the
/// optional clone/restore hooks are.
#[async_trait]
pub trait Scope<K, V>: Send + Sync
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Unique name identifying this scope within a pool.
    fn id(&self) -> &str;

    fn storage(&self) -> &Storage<K, V>;
    fn storage_lock(&self) -> &StorageLock<K, V>;

    /// Name of the mapping `DataSource::identify` resolves keys against.
    fn identify_mapping(&self) -> &str {
        "id"
    }

    fn clone_fn(&self) -> Option<CloneFn<V>> {
        None
    }

    fn restore_fn(&self) -> Option<RestoreFn<V>> {
        None
    }

    /// Other scope ids that must have their `DataSource` constructed
    /// before this one's, within the same pool.
    fn deps(&self) -> Vec<String> {
        Vec::new()
    }

    /// Scopes sharing a transaction key share one `BackendTransaction`.
    /// Defaults to this scope's own id (no sharing).
    fn transaction_key(&self) -> String {
        self.id().to_string()
    }

    async fn create_transaction(&self) -> anyhow::Result<Arc<dyn BackendTransaction>>;

    fn create_overlay(&self) -> StorageTransaction<K, V> {
        StorageTransaction::new(self.storage(), self.clone_fn(), self.restore_fn())
    }

    fn create_lock_client(&self) -> StorageLockClient<K, V> {
        self.storage_lock().create_client()
    }

    fn create_source(
        &self,
        transaction: Arc<dyn BackendTransaction>,
        overlay: Arc<StorageTransaction<K, V>>,
        lock_client: Arc<StorageLockClient<K, V>>,
    ) -> DataSource<K, V> {
        DataSource::new(transaction, overlay, lock_client, self.identify_mapping().to_string())
    }
}
