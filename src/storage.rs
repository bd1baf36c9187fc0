//! [`Storage`]: a named bundle of [`IdentityMap`]s over one entity type,
//! together with the cache policy that decides what happens to an entity
//! once nobody holds it anymore.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::identity::IdentityMap;
use crate::key::{EntryKey, HashFn};
use crate::map::{CollectionMap, FlatMap, Mapping};
use crate::registry;

/// What happens to an entity once the last `take` on it anywhere in the
/// storage is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Never purge. Entities live as long as the process keeps a strong
    /// reference to the `Storage` and nobody explicitly removes them.
    Retain,
    /// Purge immediately once a single mapping's hold count reaches zero,
    /// regardless of whether other mappings still reference the entity.
    VoidOnRelease,
    /// Purge from every mapping only once no mapping anywhere in the
    /// storage still holds the entity. Mirrors a weak cache shared across
    /// several indices of the same object.
    WeakAcrossMaps,
}

/// How a named mapping is built when added to a [`Storage`].
pub enum MappingSpec<K, V> {
    /// Key derived by applying a hash function to the value.
    Hash(HashFn<K, V>),
    /// No hash function: a key can only be learned via an explicit `set`,
    /// never derived from the value's content.
    Identity,
    /// A collection mapping: main key from an optional hash function, sub
    /// key borrowed from another named mapping's identity.
    Collection {
        id_map: String,
        hash: Option<HashFn<K, V>>,
    },
}

pub(crate) struct StorageShared<K, V> {
    policy: CachePolicy,
    mappings: RwLock<HashMap<String, Arc<IdentityMap<K, V>>>>,
}

impl<K, V> StorageShared<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub(crate) fn mapping(&self, name: &str) -> Arc<IdentityMap<K, V>> {
        self.mappings
            .read()
            .get(name)
            .cloned()
            .unwrap_or_else(|| panic!("unknown mapping {name:?}"))
    }

    pub(crate) fn mapping_names(&self) -> Vec<String> {
        self.mappings.read().keys().cloned().collect()
    }

    pub(crate) fn all_mappings(&self) -> Vec<(String, Arc<IdentityMap<K, V>>)> {
        self.mappings.read().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// The base cache hook: deliberately a no-op for every policy. Taking
    /// an already-resident entity does not need to do anything beyond the
    /// bookkeeping `IdentityMap::take` already performs.
    pub(crate) fn cache_entity(&self, _value: &Arc<V>) {}

    pub(crate) fn uncache_entity(&self, value: &Arc<V>) -> bool {
        match self.policy {
            CachePolicy::Retain => false,
            CachePolicy::VoidOnRelease => true,
            CachePolicy::WeakAcrossMaps => {
                let mappings = self.mappings.read();
                let still_held = mappings.values().any(|m| {
                    let key = m.key_of(value);
                    m.taken_count(&key) > 0
                });
                if still_held {
                    return false;
                }
                for m in mappings.values() {
                    if m.has(value) {
                        m.purge(value);
                    }
                }
                // WeakAcrossMaps purges internally and always reports false:
                // the purge has already happened, the caller must not also
                // delete from the one mapping it was releasing through.
                false
            }
        }
    }
}

#[cfg(test)]
impl<K, V> StorageShared<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub(crate) fn for_test(
        policy: CachePolicy,
        mappings: impl IntoIterator<Item = (String, Arc<IdentityMap<K, V>>)>,
    ) -> Self {
        Self {
            policy,
            mappings: RwLock::new(mappings.into_iter().collect()),
        }
    }
}

/// A named bundle of identity maps sharing one cache policy, one per
/// logical entity type (e.g. "users", "orders").
pub struct Storage<K, V> {
    shared: Arc<StorageShared<K, V>>,
}

impl<K, V> Clone for Storage<K, V> {
    fn clone(&self) -> Self {
        Storage {
            shared: self.shared.clone(),
        }
    }
}

impl<K, V> Storage<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new(policy: CachePolicy) -> Self {
        let shared = Arc::new_cyclic(|_weak: &Weak<StorageShared<K, V>>| StorageShared {
            policy,
            mappings: RwLock::new(HashMap::new()),
        });
        Storage { shared }
    }

    /// Add a named mapping, replacing any existing mapping of that name.
    pub fn make_mapping(&self, name: impl Into<String>, spec: MappingSpec<K, V>) {
        let name = name.into();
        let weak = Arc::downgrade(&self.shared);
        let id_map = build_identity_map(weak, &self.shared, spec);
        self.shared.mappings.write().insert(name, Arc::new(id_map));
    }

    /// Add a named mapping only if it doesn't already exist.
    pub fn add_mapping(&self, name: impl Into<String>, spec: MappingSpec<K, V>) {
        let name = name.into();
        if self.shared.mappings.read().contains_key(&name) {
            return;
        }
        let weak = Arc::downgrade(&self.shared);
        let id_map = build_identity_map(weak, &self.shared, spec);
        self.shared.mappings.write().entry(name).or_insert_with(|| Arc::new(id_map));
    }

    pub fn mapping(&self, name: &str) -> Arc<IdentityMap<K, V>> {
        self.shared.mapping(name)
    }

    pub fn mapping_names(&self) -> Vec<String> {
        self.shared.mapping_names()
    }

    pub(crate) fn all_mappings(&self) -> Vec<(String, Arc<IdentityMap<K, V>>)> {
        self.shared.all_mappings()
    }

    pub(crate) fn shared(&self) -> Arc<StorageShared<K, V>> {
        self.shared.clone()
    }

    /// Record that `value` belongs to this storage in the process-wide
    /// registry, so `Storage::of(&value)` can find it back.
    pub fn bind(&self, value: &Arc<V>) {
        registry::bind(value, &Arc::downgrade(&self.shared));
    }

    /// Look up the storage that last bound `value`, if any is still alive.
    pub fn of(value: &Arc<V>) -> Option<Storage<K, V>> {
        registry::of::<K, V>(value)
            .and_then(|weak| weak.upgrade())
            .map(|shared| Storage { shared })
    }
}

fn build_identity_map<K, V>(
    weak: Weak<StorageShared<K, V>>,
    shared: &Arc<StorageShared<K, V>>,
    spec: MappingSpec<K, V>,
) -> IdentityMap<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    match spec {
        MappingSpec::Hash(f) => IdentityMap::new(weak, Box::new(FlatMap::new(Some(f)))),
        MappingSpec::Identity => IdentityMap::new(weak, Box::new(FlatMap::new(None))),
        MappingSpec::Collection { id_map, hash } => {
            let storage_weak = Arc::downgrade(shared);
            let sub_key_of: HashFn<K, V> = Arc::new(move |value: &Arc<V>| -> EntryKey<K> {
                match storage_weak.upgrade() {
                    Some(storage) => storage.mapping(&id_map).key_of(value),
                    None => EntryKey::Void,
                }
            });
            IdentityMap::new(weak, Box::new(CollectionMap::new(hash, sub_key_of)))
        }
    }
}
