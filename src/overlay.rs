//! Copy-on-write transaction overlays.
//!
//! A [`StorageTransaction`] gives one logical transaction its own view of a
//! [`crate::storage::Storage`]: reads are served from a per-mapping local
//! copy seeded lazily from the shared map, and the first write to a shared
//! entity clones it (if a clone function was configured) before mutating
//! the local copy, leaving the original untouched until `flush`/`save`
//! push the local copy back.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::key::{ByAddress, EntryKey, Natural};
use crate::identity::IdentityMap;
use crate::map::Mapping;
use crate::storage::Storage;

/// Optional per-entity clone used on first write to a shared value.
/// Entities without one are not cloned; the overlay then tracks them by
/// identity alone (the caller mutates the same object the rest of the
/// process sees — safe only when the caller is prepared for that).
pub type CloneFn<V> = Arc<dyn Fn(&Arc<V>) -> Arc<V> + Send + Sync>;

/// Optional restoration callback invoked the first time a value surfaces
/// inside a transaction (e.g. to lazily hydrate fields from a backing
/// store). Called at most once per transaction per resolved value.
pub type RestoreFn<V> = Arc<dyn Fn(Arc<V>) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>;

struct MappingOverlay<K, V> {
    local: Box<dyn Mapping<K, V>>,
    taken: HashSet<EntryKey<K>>,
    updated: HashSet<EntryKey<K>>,
    global: Arc<IdentityMap<K, V>>,
}

impl<K, V> MappingOverlay<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn new(global: Arc<IdentityMap<K, V>>) -> Self {
        let local = global.empty_copy();
        Self {
            local,
            taken: HashSet::new(),
            updated: HashSet::new(),
            global,
        }
    }

    fn exists(&self, key: &EntryKey<K>) -> bool {
        self.global.contains(key)
    }

    fn register(&mut self, key: &EntryKey<K>) {
        if !self.taken.contains(key) {
            self.global.take(key);
            self.taken.insert(key.clone());
        }
    }

    fn make_writable(&mut self, key: &EntryKey<K>) {
        if !key.is_void() {
            self.updated.insert(key.clone());
        }
    }

    fn make_readonly(&mut self, key: &EntryKey<K>) {
        self.updated.remove(key);
    }

    fn set(&mut self, key: EntryKey<K>, value: Arc<V>) {
        self.register(&key);
        self.make_writable(&key);
        self.local.set(key, value);
    }

    fn del(&mut self, key: &EntryKey<K>) {
        self.make_writable(key);
        self.local.del(key);
    }

    fn remove(&mut self, value: &Arc<V>) {
        let key = self.local.key_of(value);
        self.del(&key);
    }

    fn take(&mut self, key: &EntryKey<K>) {
        if self.exists(key) {
            self.register(key);
            if let Some(v) = self.global.get(key) {
                self.local.set(key.clone(), v);
            }
        }
    }

    fn take_all(&mut self) {
        let keys = self.global.keys();
        for key in keys {
            if !self.taken.contains(&key) {
                self.take(&key);
            }
        }
    }

    /// Push the local copy of `key` back into the shared map, or delete it
    /// there if the local overlay no longer has it.
    fn push(&mut self, key: &EntryKey<K>) {
        if self.local.contains(key) {
            if let Some(v) = self.local.get(key) {
                self.global.set(key.clone(), v);
            }
        } else {
            self.global.del(key);
        }
    }

    fn release(&mut self, key: &EntryKey<K>) {
        self.global.release(key);
        self.taken.remove(key);
        self.local.del(key);
    }

    fn flush(&mut self) {
        let dirty: Vec<EntryKey<K>> = self.updated.iter().filter(|k| self.taken.contains(*k)).cloned().collect();
        for key in dirty {
            self.push(&key);
        }
    }

    fn finish(&mut self) {
        let taken: Vec<EntryKey<K>> = self.taken.iter().cloned().collect();
        for key in taken {
            self.release(&key);
        }
    }

    fn subkeys(&self, main: &K) -> Vec<EntryKey<K>> {
        self.global.subkeys(main)
    }

    fn key_of(&self, value: &Arc<V>) -> EntryKey<K> {
        let local_key = self.local.key_of(value);
        if local_key.is_void() {
            self.global.key_of(value)
        } else {
            local_key
        }
    }

    fn has(&self, value: &Arc<V>) -> bool {
        self.local.has(value)
    }

    fn get(&self, key: &EntryKey<K>) -> Option<Arc<V>> {
        self.local.get(key)
    }

    fn contains(&self, key: &EntryKey<K>) -> bool {
        self.local.contains(key)
    }

    fn natural(&self, main: &K) -> Natural<V> {
        self.local.natural(main)
    }

    fn values(&self) -> Vec<Arc<V>> {
        self.local.values()
    }
}

/// A per-transaction, copy-on-write view over one [`Storage`].
pub struct StorageTransaction<K, V> {
    maps: HashMap<String, Mutex<MappingOverlay<K, V>>>,
    existed: Mutex<HashMap<ByAddress<V>, Arc<V>>>,
    restored: Mutex<HashSet<ByAddress<V>>>,
    clone_fn: Option<CloneFn<V>>,
    restore_fn: Option<RestoreFn<V>>,
}

impl<K, V> StorageTransaction<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new(storage: &Storage<K, V>, clone_fn: Option<CloneFn<V>>, restore_fn: Option<RestoreFn<V>>) -> Self {
        let maps = storage
            .all_mappings()
            .into_iter()
            .map(|(name, id_map)| (name, Mutex::new(MappingOverlay::new(id_map))))
            .collect();
        Self {
            maps,
            existed: Mutex::new(HashMap::new()),
            restored: Mutex::new(HashSet::new()),
            clone_fn,
            restore_fn,
        }
    }

    fn clone_for_write(&self, value: &Arc<V>) -> Arc<V> {
        match &self.clone_fn {
            Some(f) => f(value),
            None => value.clone(),
        }
    }

    pub fn entry(&self, mapping: &str) -> StorageEntry<'_, K, V> {
        StorageEntry {
            txn: self,
            mapping: mapping.to_string(),
        }
    }

    pub fn key_of(&self, mapping: &str, value: &Arc<V>) -> EntryKey<K> {
        self.maps
            .get(mapping)
            .map(|m| m.lock().key_of(value))
            .unwrap_or(EntryKey::Void)
    }

    pub fn contains(&self, value: &Arc<V>) -> bool {
        self.maps.values().any(|m| m.lock().has(value))
    }

    pub fn values(&self) -> Vec<Arc<V>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for m in self.maps.values() {
            for v in m.lock().values() {
                if seen.insert(ByAddress::new(&v)) {
                    out.push(v);
                }
            }
        }
        out
    }

    /// Take every entity currently resident in the shared map into the
    /// overlay, then return the union of what is now visible.
    pub fn all(&self) -> Vec<Arc<V>> {
        for m in self.maps.values() {
            m.lock().take_all();
        }
        self.values()
    }

    /// Bring `value` into the overlay if some mapping already has it
    /// resident locally; otherwise pull a fresh copy from the shared map.
    pub fn take(&self, value: &Arc<V>) -> Option<Arc<V>> {
        for m in self.maps.values() {
            let overlay = m.lock();
            if overlay.has(value) {
                let key = overlay.key_of(value);
                return overlay.get(&key);
            }
        }
        self.refresh(value)
    }

    /// Pull `value`'s current state from every mapping of the shared map
    /// into the overlay, recording what existed before any mutation.
    pub fn refresh(&self, value: &Arc<V>) -> Option<Arc<V>> {
        let mut fresh: Option<Arc<V>> = None;
        for m in self.maps.values() {
            let mut overlay = m.lock();
            let key = overlay.key_of(value);
            if let Some(existing) = overlay.global.get(&key) {
                self.existed.lock().remove(&ByAddress::new(&existing));
            }
            overlay.take(&key);
            if let Some(v) = overlay.get(&key) {
                fresh = Some(v);
            }
        }
        if let Some(v) = &fresh {
            self.existed.lock().insert(ByAddress::new(v), v.clone());
        }
        fresh
    }

    /// The copy-on-write entry point: if `value` is not yet resident
    /// anywhere, marks every mapping writable for its eventual insertion
    /// and returns `None`. If it is resident, clones it (or reuses the
    /// same object if no clone function was configured), records the
    /// original under `existed`, swaps the clone into every mapping that
    /// had the original, and returns the clone.
    pub fn take_writable(&self, value: &Arc<V>) -> Option<Arc<V>> {
        match self.refresh(value) {
            None => {
                for m in self.maps.values() {
                    let mut overlay = m.lock();
                    let key = overlay.key_of(value);
                    overlay.make_writable(&key);
                }
                None
            }
            Some(existing) => {
                let clone = self.clone_for_write(&existing);
                self.existed.lock().insert(ByAddress::new(&clone), existing.clone());
                if self.restored.lock().contains(&ByAddress::new(&existing)) {
                    self.restored.lock().insert(ByAddress::new(&clone));
                }
                for m in self.maps.values() {
                    let mut overlay = m.lock();
                    if overlay.has(&existing) {
                        let key = overlay.key_of(&existing);
                        overlay.set(key, clone.clone());
                    }
                }
                Some(clone)
            }
        }
    }

    /// Save a freshly created value into the named mappings given by
    /// `keys` (and into every other mapping via its own key derivation),
    /// marking it as having existed from this point on (no later flush
    /// will treat it as newly created).
    pub fn save(&self, value: Arc<V>, keys: &HashMap<String, EntryKey<K>>) {
        for (name, key) in keys {
            if let Some(m) = self.maps.get(name) {
                m.lock().set(key.clone(), value.clone());
            }
        }
        for (name, m) in &self.maps {
            if !keys.contains_key(name) {
                let mut overlay = m.lock();
                let key = overlay.key_of(&value);
                overlay.set(key, value.clone());
            }
        }
        self.restored.lock().insert(ByAddress::new(&value));
    }

    /// `save`, then push immediately into the shared map and mark the
    /// entity read-only in this overlay (further writes must go through
    /// `take_writable` again).
    pub fn remember(&self, value: Arc<V>, keys: &HashMap<String, EntryKey<K>>) {
        self.save(value.clone(), keys);
        self.existed.lock().insert(ByAddress::new(&value), value.clone());
        for m in self.maps.values() {
            let mut overlay = m.lock();
            if overlay.has(&value) {
                let key = overlay.key_of(&value);
                overlay.push(&key);
                overlay.make_readonly(&key);
            }
        }
    }

    pub fn delete(&self, value: &Arc<V>) {
        for m in self.maps.values() {
            let mut overlay = m.lock();
            if overlay.has(value) {
                overlay.remove(value);
            }
        }
    }

    /// Values visible in the overlay that did not exist before this
    /// transaction touched them.
    pub fn new_values(&self) -> Vec<Arc<V>> {
        let existed = self.existed.lock();
        self.values()
            .into_iter()
            .filter(|v| !existed.contains_key(&ByAddress::new(v)))
            .collect()
    }

    /// Values that existed before this transaction but are no longer
    /// visible in the overlay.
    pub fn deleted_values(&self) -> Vec<Arc<V>> {
        let existed = self.existed.lock();
        let current: HashSet<ByAddress<V>> = self.values().iter().map(ByAddress::new).collect();
        existed
            .iter()
            .filter(|(k, _)| !current.contains(*k))
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// The pre-mutation original for `value`, if the overlay has one on
    /// record; otherwise `value` itself.
    pub fn tracked(&self, value: &Arc<V>) -> Arc<V> {
        self.existed
            .lock()
            .get(&ByAddress::new(value))
            .cloned()
            .unwrap_or_else(|| value.clone())
    }

    pub fn track(&self, value: Arc<V>) {
        let clone = self.clone_for_write(&value);
        self.existed.lock().insert(ByAddress::new(&value), clone);
    }

    pub fn untrack(&self, value: &Arc<V>) {
        self.existed.lock().remove(&ByAddress::new(value));
    }

    pub fn flush(&self) {
        for m in self.maps.values() {
            m.lock().flush();
        }
    }

    pub fn finish(&self) {
        for m in self.maps.values() {
            m.lock().finish();
        }
    }

    /// Bring `value` into the overlay and run the restoration callback on
    /// it exactly once per transaction.
    pub async fn restore(&self, value: Arc<V>) -> anyhow::Result<Arc<V>> {
        let taken = self.take(&value).unwrap_or_else(|| value.clone());
        let already_restored = self.restored.lock().contains(&ByAddress::new(&taken));
        if already_restored {
            return Ok(taken);
        }
        if let Some(restore_fn) = &self.restore_fn {
            restore_fn(taken.clone()).await?;
        }
        self.restored.lock().insert(ByAddress::new(&taken));
        Ok(taken)
    }
}

/// A view over one named mapping of a [`StorageTransaction`], used to look
/// entities up by their main key.
pub struct StorageEntry<'a, K, V> {
    txn: &'a StorageTransaction<K, V>,
    mapping: String,
}

impl<'a, K, V> StorageEntry<'a, K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// All values currently under `main`, taking any not-yet-resident
    /// subkeys into the overlay first.
    pub fn get(&self, main: &K) -> Natural<V> {
        let overlay = self.txn.maps.get(&self.mapping).expect("unknown mapping");
        let subkeys = overlay.lock().subkeys(main);
        for subkey in &subkeys {
            let mut guard = overlay.lock();
            if !guard.contains(subkey) {
                guard.take(subkey);
            }
        }
        overlay.lock().natural(main)
    }

    /// `get`, additionally restoring every resident value under `main`.
    pub async fn get_restored(&self, main: &K) -> anyhow::Result<Natural<V>> {
        let natural = self.get(main);
        let values = match &natural {
            Natural::None => Vec::new(),
            Natural::One(v) => vec![v.clone()],
            Natural::Many(vs) => vs.clone(),
        };
        for v in values {
            self.txn.restore(v).await?;
        }
        Ok(natural)
    }

    pub fn contains(&self, main: &K) -> bool {
        !matches!(self.get(main), Natural::None)
    }
}
