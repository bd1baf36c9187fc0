//! [`Pool`]: coordinates a transaction spanning several [`Scope`]s of the
//! same entity family — pre-locking a declared write-set before the pool
//! body runs, then committing or rolling back every backend transaction
//! concurrently.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{CoreError, CoreResult};
use crate::lock::StorageLockClient;
use crate::overlay::StorageTransaction;
use crate::scope::{BackendTransaction, Scope};
use crate::source::DataSource;
use crate::storage::Storage;

/// How a pool-entry's overlay over a scope's storage is obtained and what
/// happens to it between entries.
pub trait Cache<K, V>: Send + Sync
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn storage_for(&self, scope: &Arc<dyn Scope<K, V>>) -> Arc<StorageTransaction<K, V>>;

    /// Called at the start of every pool entry, before the write-set is
    /// locked: gives the cache a chance to rebuild its overlays from a
    /// clean slate.
    fn reload(&self);

    /// Called after a successful commit.
    fn flush(&self);

    fn clear(&self);
}

struct CacheEntry<K, V> {
    scope: Arc<dyn Scope<K, V>>,
    storage: Arc<StorageTransaction<K, V>>,
}

/// An overlay that survives across pool entries: reused as long as the
/// pool itself is alive, rebuilt (re-`take`ing everything still visible)
/// on every `reload`.
pub struct PersistentCache<K, V> {
    entries: Mutex<HashMap<String, CacheEntry<K, V>>>,
}

impl<K, V> Default for PersistentCache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> PersistentCache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> Cache<K, V> for PersistentCache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn storage_for(&self, scope: &Arc<dyn Scope<K, V>>) -> Arc<StorageTransaction<K, V>> {
        let mut entries = self.entries.lock();
        entries
            .entry(scope.id().to_string())
            .or_insert_with(|| CacheEntry {
                scope: scope.clone(),
                storage: Arc::new(scope.create_overlay()),
            })
            .storage
            .clone()
    }

    fn reload(&self) {
        let mut entries = self.entries.lock();
        for entry in entries.values_mut() {
            let fresh = Arc::new(entry.scope.create_overlay());
            for value in entry.storage.values() {
                fresh.take(&value);
            }
            entry.storage.finish();
            entry.storage = fresh;
        }
    }

    fn flush(&self) {
        for entry in self.entries.lock().values() {
            entry.storage.flush();
        }
    }

    fn clear(&self) {
        for entry in self.entries.lock().values() {
            entry.storage.finish();
        }
    }
}

/// An overlay built fresh for every pool entry and discarded (flushed then
/// cleared) right after. The default when a pool is not given an explicit
/// cache.
pub struct OneTimeCache<K, V> {
    inner: PersistentCache<K, V>,
}

impl<K, V> Default for OneTimeCache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> OneTimeCache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: PersistentCache::new(),
        }
    }
}

impl<K, V> Cache<K, V> for OneTimeCache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn storage_for(&self, scope: &Arc<dyn Scope<K, V>>) -> Arc<StorageTransaction<K, V>> {
        self.inner.storage_for(scope)
    }

    fn reload(&self) {
        self.inner.reload();
    }

    fn flush(&self) {
        self.inner.flush();
        self.inner.clear();
    }

    fn clear(&self) {
        self.inner.clear();
    }
}

/// A cross-scope transaction pool: a fixed set of scopes plus a declared
/// write-set, locked and entered together.
pub struct Pool<K, V> {
    scopes: Vec<Arc<dyn Scope<K, V>>>,
    write_set: Vec<Arc<V>>,
    cache: Arc<dyn Cache<K, V>>,
}

impl<K, V> Pool<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new(scopes: Vec<Arc<dyn Scope<K, V>>>, write_set: Vec<Arc<V>>, cache: Arc<dyn Cache<K, V>>) -> Self {
        Self {
            scopes,
            write_set,
            cache,
        }
    }

    pub fn with_default_cache(scopes: Vec<Arc<dyn Scope<K, V>>>, write_set: Vec<Arc<V>>) -> Self {
        Self::new(scopes, write_set, Arc::new(OneTimeCache::new()))
    }

    /// Reload the cache, pre-lock and copy-on-write every declared
    /// write-set entry across its owning scope, and build one
    /// [`DataSource`] per scope (dependencies constructed first).
    #[tracing::instrument(skip_all, fields(scopes = self.scopes.len(), writes = self.write_set.len()))]
    pub async fn enter(&self) -> CoreResult<PoolEntry<K, V>> {
        self.cache.reload();

        let mut lock_clients: HashMap<String, Arc<StorageLockClient<K, V>>> = HashMap::new();
        for scope in &self.scopes {
            lock_clients.insert(scope.id().to_string(), Arc::new(scope.create_lock_client()));
        }

        for value in &self.write_set {
            let storage = Storage::of(value).ok_or(CoreError::UnboundWriteSetEntry)?;
            let owning_scope = self
                .scopes
                .iter()
                .find(|s| Arc::ptr_eq(&s.storage().shared(), &storage.shared()))
                .ok_or(CoreError::UnboundWriteSetEntry)?;
            let lock_client = lock_clients
                .get(owning_scope.id())
                .expect("lock client built for every scope above");
            lock_client.lock_value(value.clone()).await;
            let overlay = self.cache.storage_for(owning_scope);
            overlay.take_writable(value);
        }

        let mut entry = PoolEntry {
            scopes: self.scopes.clone(),
            cache: self.cache.clone(),
            transactions: Mutex::new(HashMap::new()),
            lock_clients,
            sources: Mutex::new(HashMap::new()),
            ordered_sources: Vec::new(),
        };

        let mut ordered = Vec::with_capacity(self.scopes.len());
        for scope in self.scopes.clone() {
            ordered.push(entry.build_source(scope).await?);
        }
        entry.ordered_sources = ordered;
        Ok(entry)
    }
}

/// One live entry into a [`Pool`]: holds every backend transaction and
/// lock client for the duration of the pool body, and drives commit,
/// rollback, and release.
pub struct PoolEntry<K, V> {
    scopes: Vec<Arc<dyn Scope<K, V>>>,
    cache: Arc<dyn Cache<K, V>>,
    transactions: Mutex<HashMap<String, Arc<dyn BackendTransaction>>>,
    lock_clients: HashMap<String, Arc<StorageLockClient<K, V>>>,
    sources: Mutex<HashMap<String, Arc<DataSource<K, V>>>>,
    ordered_sources: Vec<Arc<DataSource<K, V>>>,
}

impl<K, V> PoolEntry<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// The data sources for this entry, one per scope, in the order the
    /// scopes were given to the pool.
    pub fn sources(&self) -> &[Arc<DataSource<K, V>>] {
        &self.ordered_sources
    }

    pub fn source(&self, scope_id: &str) -> Option<Arc<DataSource<K, V>>> {
        self.sources.lock().get(scope_id).cloned()
    }

    fn build_source<'a>(
        &'a self,
        scope: Arc<dyn Scope<K, V>>,
    ) -> Pin<Box<dyn Future<Output = CoreResult<Arc<DataSource<K, V>>>> + Send + 'a>> {
        Box::pin(async move {
            if let Some(existing) = self.sources.lock().get(scope.id()) {
                return Ok(existing.clone());
            }

            for dep_id in scope.deps() {
                if let Some(dep_scope) = self.scopes.iter().find(|s| s.id() == dep_id) {
                    self.build_source(dep_scope.clone()).await?;
                }
            }

            let txn_key = scope.transaction_key();
            let transaction = {
                let existing = self.transactions.lock().get(&txn_key).cloned();
                match existing {
                    Some(t) => t,
                    None => {
                        let t = scope.create_transaction().await.map_err(|source| CoreError::BeginTransaction {
                            scope: scope.id().to_string(),
                            source,
                        })?;
                        self.transactions.lock().insert(txn_key, t.clone());
                        t
                    }
                }
            };

            let overlay = self.cache.storage_for(&scope);
            let lock_client = self.lock_clients[scope.id()].clone();
            let source = Arc::new(scope.create_source(transaction, overlay, lock_client));
            self.sources.lock().insert(scope.id().to_string(), source.clone());
            Ok(source)
        })
    }

    /// Flush every source's overlay, then commit every distinct backend
    /// transaction concurrently.
    pub async fn commit(&self) -> CoreResult<()> {
        let sources: Vec<_> = self.sources.lock().values().cloned().collect();
        for source in &sources {
            source.flush().await.map_err(CoreError::Flush)?;
        }
        self.cache.flush();

        let transactions: Vec<(String, Arc<dyn BackendTransaction>)> =
            self.transactions.lock().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let results = futures::future::join_all(transactions.iter().map(|(_, t)| t.commit())).await;

        let mut committed = Vec::new();
        for ((scope_id, _), result) in transactions.iter().zip(results) {
            match result {
                Ok(()) => committed.push(scope_id.clone()),
                Err(source) => {
                    return Err(CoreError::PartialCommit {
                        committed,
                        failed: scope_id.clone(),
                        source,
                    })
                }
            }
        }
        Ok(())
    }

    pub async fn rollback(&self) -> CoreResult<()> {
        let transactions: Vec<(String, Arc<dyn BackendTransaction>)> =
            self.transactions.lock().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let results = futures::future::join_all(transactions.iter().map(|(_, t)| t.rollback())).await;
        // Discard every overlay's local writes without pushing them: the
        // keys an overlay took are still released symmetrically with the
        // locks below, just never flushed into the shared storage.
        self.cache.clear();
        for ((scope_id, _), result) in transactions.iter().zip(results) {
            result.map_err(|source| CoreError::Rollback {
                scope: scope_id.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Release every lock this entry acquired, regardless of how it's
    /// about to end. Idempotent: safe to call even if nothing was locked.
    pub fn release_all(&self) {
        for client in self.lock_clients.values() {
            client.release_all();
        }
    }

    /// Drive commit or rollback from the pool body's own result, then
    /// unconditionally release every lock. There is no async `Drop` in
    /// Rust, so callers must invoke this explicitly at the end of the
    /// pool body instead of relying on scope exit.
    pub async fn finish(&self, body_result: anyhow::Result<()>) -> CoreResult<()> {
        let outcome = match body_result {
            Ok(()) => self.commit().await,
            Err(_) => self.rollback().await,
        };
        self.release_all();
        outcome
    }
}
