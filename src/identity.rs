//! Scoped identity maps: the residency layer sitting on top of a
//! [`Mapping`], tracking how many concurrent holders have `take`n each key
//! and consulting the owning [`crate::storage::Storage`]'s cache policy on
//! `release`.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::key::{EntryKey, Natural};
use crate::map::Mapping;
use crate::registry;
use crate::storage::StorageShared;

struct IdentityMapInner<K, V> {
    mapping: Box<dyn Mapping<K, V>>,
    taken: HashMap<EntryKey<K>, usize>,
}

/// One named entry of a [`crate::storage::Storage`]: a [`Mapping`] plus
/// reference counts tracking how many outstanding holders currently have
/// each key taken.
pub struct IdentityMap<K, V> {
    storage: Weak<StorageShared<K, V>>,
    inner: Mutex<IdentityMapInner<K, V>>,
}

impl<K, V> IdentityMap<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub(crate) fn new(storage: Weak<StorageShared<K, V>>, mapping: Box<dyn Mapping<K, V>>) -> Self {
        Self {
            storage,
            inner: Mutex::new(IdentityMapInner {
                mapping,
                taken: HashMap::new(),
            }),
        }
    }

    /// The value's key: the mapping's memoized reverse index if it has one
    /// on record, otherwise a key derived fresh from the value's content.
    pub fn key_of(&self, value: &Arc<V>) -> EntryKey<K> {
        self.inner.lock().mapping.key_of(value)
    }

    pub fn taken_count(&self, key: &EntryKey<K>) -> usize {
        *self.inner.lock().taken.get(key).unwrap_or(&0)
    }

    pub fn get(&self, key: &EntryKey<K>) -> Option<Arc<V>> {
        self.inner.lock().mapping.get(key)
    }

    pub fn contains(&self, key: &EntryKey<K>) -> bool {
        self.inner.lock().mapping.contains(key)
    }

    pub fn subkeys(&self, main: &K) -> Vec<EntryKey<K>> {
        self.inner.lock().mapping.subkeys(main)
    }

    pub fn natural(&self, main: &K) -> Natural<V> {
        self.inner.lock().mapping.natural(main)
    }

    pub fn has(&self, value: &Arc<V>) -> bool {
        self.inner.lock().mapping.has(value)
    }

    pub fn keys(&self) -> Vec<EntryKey<K>> {
        self.inner.lock().mapping.keys()
    }

    /// Direct mutation bypassing take/release counting: used by overlays to
    /// push committed values back into the shared map and by void-key
    /// sentinel handling.
    pub(crate) fn set(&self, key: EntryKey<K>, value: Arc<V>) {
        self.inner.lock().mapping.set(key, value.clone());
        registry::bind(&value, &self.storage);
    }

    pub(crate) fn del(&self, key: &EntryKey<K>) {
        self.inner.lock().mapping.del(key);
    }

    pub(crate) fn empty_copy(&self) -> Box<dyn Mapping<K, V>> {
        self.inner.lock().mapping.empty_copy()
    }

    pub(crate) fn purge(&self, value: &Arc<V>) {
        self.inner.lock().mapping.remove(value);
    }

    /// Mark `key` resident: bumps the take count and, if the key is
    /// already resident, notifies the owning storage's cache hook.
    pub fn take(&self, key: &EntryKey<K>) -> Option<Arc<V>> {
        let value = {
            let mut inner = self.inner.lock();
            *inner.taken.entry(key.clone()).or_insert(0) += 1;
            inner.mapping.get(key)
        };
        if let Some(v) = &value {
            if let Some(storage) = self.storage.upgrade() {
                storage.cache_entity(v);
            }
        }
        value
    }

    /// Drop one hold on `key`. If the cache policy decides the entity
    /// should no longer be retained once nobody is holding it anywhere in
    /// the storage, it is purged from every mapping that has it.
    pub fn release(&self, key: &EntryKey<K>) {
        let value = {
            let mut inner = self.inner.lock();
            if let Some(count) = inner.taken.get_mut(key) {
                *count -= 1;
                if *count == 0 {
                    inner.taken.remove(key);
                }
            }
            inner.mapping.get(key)
        };
        if let Some(v) = value {
            if let Some(storage) = self.storage.upgrade() {
                if storage.uncache_entity(&v) {
                    self.inner.lock().mapping.del(key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::FlatMap;
    use crate::storage::CachePolicy;
    use std::sync::Arc;

    fn flat_identity_map(policy: CachePolicy) -> (Arc<StorageShared<u64, String>>, Arc<IdentityMap<u64, String>>) {
        let shared = Arc::new_cyclic(|weak: &Weak<StorageShared<u64, String>>| {
            let id_map = Arc::new(IdentityMap::new(weak.clone(), Box::new(FlatMap::new(None))));
            StorageShared::for_test(policy, [("main".to_string(), id_map)])
        });
        let id_map = shared.mapping("main");
        (shared, id_map)
    }

    #[test]
    fn take_then_release_retains_by_default() {
        let (_shared, map) = flat_identity_map(CachePolicy::Retain);
        let value = Arc::new("alice".to_string());
        map.set(EntryKey::Main(1), value.clone());
        map.take(&EntryKey::Main(1));
        map.release(&EntryKey::Main(1));
        assert!(map.contains(&EntryKey::Main(1)));
    }

    #[test]
    fn void_on_release_purges_after_last_release() {
        let (_shared, map) = flat_identity_map(CachePolicy::VoidOnRelease);
        let value = Arc::new("bob".to_string());
        map.set(EntryKey::Main(1), value.clone());
        map.take(&EntryKey::Main(1));
        map.take(&EntryKey::Main(1));
        map.release(&EntryKey::Main(1));
        assert!(map.contains(&EntryKey::Main(1)), "still held once, must stay resident");
        map.release(&EntryKey::Main(1));
        assert!(!map.contains(&EntryKey::Main(1)), "last release must purge");
    }

    #[test]
    fn taken_count_tracks_outstanding_holders() {
        let (_shared, map) = flat_identity_map(CachePolicy::Retain);
        let value = Arc::new("carol".to_string());
        map.set(EntryKey::Main(1), value);
        assert_eq!(map.taken_count(&EntryKey::Main(1)), 0);
        map.take(&EntryKey::Main(1));
        map.take(&EntryKey::Main(1));
        assert_eq!(map.taken_count(&EntryKey::Main(1)), 2);
        map.release(&EntryKey::Main(1));
        assert_eq!(map.taken_count(&EntryKey::Main(1)), 1);
    }
}
