//! Async, per-key lock coordination layered on top of identity maps.
//!
//! [`GlobalLock`] pins an entity's residency for the lifetime of the lock
//! (via `IdentityMap::take`/`release`); [`LockClient`] adds cooperative
//! re-entry within one logical transaction so the same key can be locked
//! more than once without deadlocking; [`CompositeLock`] resolves and
//! acquires every alternate key of one entity as a single batch;
//! [`StorageLock`]/[`StorageLockClient`] are the storage-wide and
//! per-transaction aggregators tying a named mapping to its lock table.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::identity::IdentityMap;
use crate::key::EntryKey;
use crate::storage::Storage;

/// A per-key mutex that pins the key's residency in its owning identity
/// map for as long as it is held.
pub struct GlobalLock<K, V> {
    identity_map: Arc<IdentityMap<K, V>>,
    key: EntryKey<K>,
    mutex: Arc<AsyncMutex<()>>,
}

impl<K, V> GlobalLock<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn new(identity_map: Arc<IdentityMap<K, V>>, key: EntryKey<K>) -> Self {
        Self {
            identity_map,
            key,
            mutex: Arc::new(AsyncMutex::new(())),
        }
    }

    pub async fn acquire(&self) -> OwnedMutexGuard<()> {
        if !self.key.is_void() {
            self.identity_map.take(&self.key);
        }
        self.mutex.clone().lock_owned().await
    }

    pub fn release(&self, guard: OwnedMutexGuard<()>) {
        drop(guard);
        if !self.key.is_void() {
            self.identity_map.release(&self.key);
        }
    }
}

/// Weak-valued table of one `GlobalLock` per key: locks are shared while at
/// least one client holds a strong reference and dropped once nobody does.
/// A void key never shares a lock — every call for a void key gets a fresh,
/// unshared `GlobalLock`.
pub struct LockMap<K, V> {
    identity_map: Arc<IdentityMap<K, V>>,
    locks: SyncMutex<HashMap<EntryKey<K>, Weak<GlobalLock<K, V>>>>,
}

impl<K, V> LockMap<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new(identity_map: Arc<IdentityMap<K, V>>) -> Self {
        Self {
            identity_map,
            locks: SyncMutex::new(HashMap::new()),
        }
    }

    pub(crate) fn peek(&self, key: &EntryKey<K>) -> Option<Arc<V>> {
        self.identity_map.get(key)
    }

    pub(crate) fn key_of(&self, value: &Arc<V>) -> EntryKey<K> {
        self.identity_map.key_of(value)
    }

    pub fn get_or_create(&self, key: EntryKey<K>) -> Arc<GlobalLock<K, V>> {
        if key.is_void() {
            return Arc::new(GlobalLock::new(self.identity_map.clone(), key));
        }
        let mut locks = self.locks.lock();
        if let Some(existing) = locks.get(&key).and_then(Weak::upgrade) {
            return existing;
        }
        let lock = Arc::new(GlobalLock::new(self.identity_map.clone(), key.clone()));
        locks.insert(key, Arc::downgrade(&lock));
        lock
    }
}

struct LockClientState {
    held: bool,
    guard: Option<OwnedMutexGuard<()>>,
}

/// One task's cooperative handle on a single [`GlobalLock`]. Re-entrant
/// within the scope that created it: a second `ensure_acquire` while
/// already held is a no-op, and `ensure_release` is a no-op if not held.
pub struct LockClient<K, V> {
    global: Arc<GlobalLock<K, V>>,
    state: AsyncMutex<LockClientState>,
}

impl<K, V> LockClient<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn new(global: Arc<GlobalLock<K, V>>) -> Self {
        Self {
            global,
            state: AsyncMutex::new(LockClientState {
                held: false,
                guard: None,
            }),
        }
    }

    pub async fn ensure_acquire(&self) {
        let mut state = self.state.lock().await;
        if !state.held {
            let guard = self.global.acquire().await;
            state.guard = Some(guard);
            state.held = true;
        }
    }

    /// Best-effort release: if another `ensure_acquire` is mid-flight on
    /// this client, this call simply does nothing rather than block —
    /// `release_all` is only ever invoked from the transaction that owns
    /// this client, after its own work has finished.
    pub fn ensure_release(&self) {
        if let Ok(mut state) = self.state.try_lock() {
            if state.held {
                if let Some(guard) = state.guard.take() {
                    self.global.release(guard);
                }
                state.held = false;
            }
        }
    }
}

/// Per-transaction strong table of [`LockClient`]s, one per key actually
/// touched, for a single named mapping.
pub struct IdentityMapLockClient<K, V> {
    lock_map: Arc<LockMap<K, V>>,
    clients: SyncMutex<HashMap<EntryKey<K>, Arc<LockClient<K, V>>>>,
}

impl<K, V> IdentityMapLockClient<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn new(lock_map: Arc<LockMap<K, V>>) -> Self {
        Self {
            lock_map,
            clients: SyncMutex::new(HashMap::new()),
        }
    }

    pub(crate) fn lock_map(&self) -> &Arc<LockMap<K, V>> {
        &self.lock_map
    }

    pub fn client_for(&self, key: EntryKey<K>) -> Arc<LockClient<K, V>> {
        let mut clients = self.clients.lock();
        clients
            .entry(key.clone())
            .or_insert_with(|| {
                let global = self.lock_map.get_or_create(key);
                Arc::new(LockClient::new(global))
            })
            .clone()
    }

    pub fn release_all(&self) {
        for client in self.clients.lock().values() {
            client.ensure_release();
        }
    }
}

/// Resolves and acquires every alternate key of one entity as a single
/// batch. Acquisition is the unit of work; release belongs to the owning
/// [`StorageLockClient`]'s `release_all`, invoked once at transaction
/// teardown — individual composite locks are not released piecemeal.
pub struct CompositeLock;

impl CompositeLock {
    pub(crate) async fn acquire<K, V>(
        clients: &HashMap<String, Arc<IdentityMapLockClient<K, V>>>,
        value: Option<Arc<V>>,
        mut keys: HashMap<String, EntryKey<K>>,
    ) -> HashMap<String, EntryKey<K>>
    where
        K: Clone + Eq + Hash + Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        let resolved_value = match value {
            Some(v) => Some(v),
            None => keys.iter().find_map(|(name, key)| {
                if key.is_void() {
                    return None;
                }
                clients.get(name).and_then(|c| c.lock_map().peek(key))
            }),
        };

        if let Some(v) = &resolved_value {
            for (name, client) in clients {
                keys.insert(name.clone(), client.lock_map().key_of(v));
            }
        }

        let to_acquire: Vec<Arc<LockClient<K, V>>> = keys
            .iter()
            .filter_map(|(name, key)| clients.get(name).map(|c| c.client_for(key.clone())))
            .collect();
        futures::future::join_all(to_acquire.iter().map(|lc| lc.ensure_acquire())).await;
        keys
    }
}

/// Storage-wide, long-lived lock table: one [`LockMap`] per named mapping,
/// shared across every transaction touching this storage so that locks on
/// the same key actually contend with each other.
pub struct StorageLock<K, V> {
    maps: HashMap<String, Arc<LockMap<K, V>>>,
}

impl<K, V> StorageLock<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new(storage: &Storage<K, V>) -> Self {
        let maps = storage
            .all_mappings()
            .into_iter()
            .map(|(name, id_map)| (name, Arc::new(LockMap::new(id_map))))
            .collect();
        Self { maps }
    }

    pub fn create_client(&self) -> StorageLockClient<K, V> {
        let clients = self
            .maps
            .iter()
            .map(|(name, lock_map)| (name.clone(), Arc::new(IdentityMapLockClient::new(lock_map.clone()))))
            .collect();
        StorageLockClient { clients }
    }
}

/// Per-transaction view over a [`StorageLock`]: acquires composite locks
/// and releases everything this transaction touched in one call.
pub struct StorageLockClient<K, V> {
    clients: HashMap<String, Arc<IdentityMapLockClient<K, V>>>,
}

impl<K, V> StorageLockClient<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub async fn lock_value(&self, value: Arc<V>) {
        CompositeLock::acquire(&self.clients, Some(value), HashMap::new()).await;
    }

    pub async fn lock_keys(&self, keys: HashMap<String, EntryKey<K>>) {
        CompositeLock::acquire(&self.clients, None, keys).await;
    }

    pub fn release_all(&self) {
        for client in self.clients.values() {
            client.release_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::FlatMap;
    use crate::storage::{CachePolicy, MappingSpec};
    use crate::key::HashFn;

    #[derive(Debug)]
    struct Account {
        id: u64,
    }

    fn storage() -> Storage<u64, Account> {
        let storage = Storage::new(CachePolicy::Retain);
        let hash: HashFn<u64, Account> = Arc::new(|a| EntryKey::Main(a.id));
        storage.make_mapping("id", MappingSpec::Hash(hash));
        storage
    }

    #[tokio::test]
    async fn lock_value_resolves_keys_across_every_mapping() {
        let storage = storage();
        let storage_lock = StorageLock::new(&storage);
        let client = storage_lock.create_client();

        let account = Arc::new(Account { id: 7 });
        storage.mapping("id").set(EntryKey::Main(7), account.clone());

        client.lock_value(account.clone()).await;
        assert_eq!(storage.mapping("id").taken_count(&EntryKey::Main(7)), 1);
        client.release_all();
        assert_eq!(storage.mapping("id").taken_count(&EntryKey::Main(7)), 0);
    }

    #[tokio::test]
    async fn second_transaction_blocks_until_first_releases() {
        let storage = storage();
        let storage_lock = Arc::new(StorageLock::new(&storage));

        let account = Arc::new(Account { id: 1 });
        storage.mapping("id").set(EntryKey::Main(1), account.clone());

        let client_a = storage_lock.create_client();
        client_a.lock_value(account.clone()).await;

        let storage_lock_b = storage_lock.clone();
        let account_b = account.clone();
        let handle = tokio::spawn(async move {
            let client_b = storage_lock_b.create_client();
            client_b.lock_value(account_b).await;
            client_b.release_all();
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished(), "second lock must block while the first is held");

        client_a.release_all();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn void_keyed_locks_never_contend() {
        let storage = storage();
        let storage_lock = StorageLock::new(&storage);
        let client = storage_lock.create_client();

        let mut keys = HashMap::new();
        keys.insert("id".to_string(), EntryKey::Void);
        client.lock_keys(keys.clone()).await;
        client.lock_keys(keys).await;
        client.release_all();
    }
}
