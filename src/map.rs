//! Double-sided mappings: the data structure underneath every named entry
//! in a [`crate::storage::Storage`].
//!
//! A [`Mapping`] is bijective in the sense that it can go from key to value
//! (`get`) and from value to key (`key_of`), but the value side never keeps
//! the value alive on its own — the reverse index is built on
//! [`crate::key::WeakByAddress`].
//!
//! [`FlatMap`] covers the 1-to-1 case; [`CollectionMap`] covers 1-to-many
//! keying by pairing a main key with a sub key drawn from another mapping's
//! identity (mirroring a foreign-key-to-owner relationship).

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use crate::key::{EntryKey, HashFn, Natural, WeakByAddress};

/// Object-safe double-sided mapping between `EntryKey<K>` and `Arc<V>`.
///
/// Implementations provide the primitive operations (`set`/`get`/`del`/
/// `contains`/`reverse_lookup`/`generate_key`); the rest have defaults
/// derived from those primitives.
pub trait Mapping<K, V>: Send + Sync
where
    K: Clone + Eq + Hash + Send + Sync,
    V: Send + Sync,
{
    fn set(&mut self, key: EntryKey<K>, value: Arc<V>);
    fn get(&self, key: &EntryKey<K>) -> Option<Arc<V>>;
    fn del(&mut self, key: &EntryKey<K>);
    fn contains(&self, key: &EntryKey<K>) -> bool;
    fn keys(&self) -> Vec<EntryKey<K>>;

    /// Look up a value's key via the memoized reverse index, if one exists.
    fn reverse_lookup(&self, value: &Arc<V>) -> Option<EntryKey<K>>;

    /// Derive a key from a value's content, ignoring any memoized reverse
    /// index. `key_of` falls back to this only once the reverse lookup has
    /// come back empty.
    fn generate_key(&self, value: &Arc<V>) -> EntryKey<K>;

    fn subkeys(&self, main: &K) -> Vec<EntryKey<K>>;
    fn natural(&self, main: &K) -> Natural<V>;
    fn values(&self) -> Vec<Arc<V>>;

    /// A fresh mapping of the same shape (same hash functions), empty of
    /// data. Used to seed per-transaction overlays.
    fn empty_copy(&self) -> Box<dyn Mapping<K, V>>;

    fn key_of(&self, value: &Arc<V>) -> EntryKey<K> {
        self.reverse_lookup(value)
            .unwrap_or_else(|| self.generate_key(value))
    }

    fn add(&mut self, value: Arc<V>) -> EntryKey<K> {
        let key = self.key_of(&value);
        self.set(key.clone(), value);
        key
    }

    fn remove(&mut self, value: &Arc<V>) {
        let key = self.key_of(value);
        self.del(&key);
    }

    fn has(&self, value: &Arc<V>) -> bool {
        self.contains(&self.key_of(value))
    }
}

/// A 1-to-1 mapping: one main key per value.
pub struct FlatMap<K, V> {
    data: HashMap<K, Arc<V>>,
    reverse: HashMap<WeakByAddress<V>, EntryKey<K>>,
    hash_fn: Option<HashFn<K, V>>,
}

impl<K, V> FlatMap<K, V>
where
    K: Clone + Eq + Hash,
{
    /// `hash_fn = None` means the mapping is identity-only: a key can only
    /// be learned by explicit `set`, never derived from content.
    pub fn new(hash_fn: Option<HashFn<K, V>>) -> Self {
        Self {
            data: HashMap::new(),
            reverse: HashMap::new(),
            hash_fn,
        }
    }
}

impl<K, V> Mapping<K, V> for FlatMap<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn set(&mut self, key: EntryKey<K>, value: Arc<V>) {
        if let EntryKey::Main(k) = &key {
            self.data.insert(k.clone(), value.clone());
            self.reverse.insert(WeakByAddress::new(&value), key);
        }
    }

    fn get(&self, key: &EntryKey<K>) -> Option<Arc<V>> {
        match key {
            EntryKey::Main(k) => self.data.get(k).cloned(),
            _ => None,
        }
    }

    fn del(&mut self, key: &EntryKey<K>) {
        if let EntryKey::Main(k) = key {
            if let Some(v) = self.data.remove(k) {
                self.reverse.remove(&WeakByAddress::new(&v));
            }
        }
    }

    fn contains(&self, key: &EntryKey<K>) -> bool {
        matches!(key, EntryKey::Main(k) if self.data.contains_key(k))
    }

    fn keys(&self) -> Vec<EntryKey<K>> {
        self.data.keys().cloned().map(EntryKey::Main).collect()
    }

    fn reverse_lookup(&self, value: &Arc<V>) -> Option<EntryKey<K>> {
        self.reverse.get(&WeakByAddress::new(value)).cloned()
    }

    fn generate_key(&self, value: &Arc<V>) -> EntryKey<K> {
        match &self.hash_fn {
            Some(f) => f(value),
            None => EntryKey::Void,
        }
    }

    fn subkeys(&self, main: &K) -> Vec<EntryKey<K>> {
        if self.data.contains_key(main) {
            vec![EntryKey::Main(main.clone())]
        } else {
            Vec::new()
        }
    }

    fn natural(&self, main: &K) -> Natural<V> {
        match self.data.get(main) {
            Some(v) => Natural::One(v.clone()),
            None => Natural::None,
        }
    }

    fn values(&self) -> Vec<Arc<V>> {
        self.data.values().cloned().collect()
    }

    fn empty_copy(&self) -> Box<dyn Mapping<K, V>> {
        Box::new(FlatMap {
            data: HashMap::new(),
            reverse: HashMap::new(),
            hash_fn: self.hash_fn.clone(),
        })
    }
}

/// A 1-to-many mapping keyed by `(main, sub)`, where `sub` is borrowed from
/// another mapping's identity (e.g. grouping rows by owner id).
pub struct CollectionMap<K, V> {
    data: HashMap<K, HashMap<K, Arc<V>>>,
    reverse: HashMap<WeakByAddress<V>, EntryKey<K>>,
    main_hash_fn: Option<HashFn<K, V>>,
    sub_key_of: HashFn<K, V>,
}

impl<K, V> CollectionMap<K, V>
where
    K: Clone + Eq + Hash,
{
    pub fn new(main_hash_fn: Option<HashFn<K, V>>, sub_key_of: HashFn<K, V>) -> Self {
        Self {
            data: HashMap::new(),
            reverse: HashMap::new(),
            main_hash_fn,
            sub_key_of,
        }
    }
}

impl<K, V> Mapping<K, V> for CollectionMap<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn set(&mut self, key: EntryKey<K>, value: Arc<V>) {
        if let EntryKey::Composite(m, s) = &key {
            self.data
                .entry(m.clone())
                .or_default()
                .insert(s.clone(), value.clone());
            self.reverse.insert(WeakByAddress::new(&value), key);
        }
    }

    fn get(&self, key: &EntryKey<K>) -> Option<Arc<V>> {
        match key {
            EntryKey::Composite(m, s) => self.data.get(m).and_then(|inner| inner.get(s)).cloned(),
            _ => None,
        }
    }

    fn del(&mut self, key: &EntryKey<K>) {
        if let EntryKey::Composite(m, s) = key {
            if let Some(inner) = self.data.get_mut(m) {
                if let Some(v) = inner.remove(s) {
                    self.reverse.remove(&WeakByAddress::new(&v));
                }
                if inner.is_empty() {
                    self.data.remove(m);
                }
            }
        }
    }

    fn contains(&self, key: &EntryKey<K>) -> bool {
        match key {
            EntryKey::Composite(m, s) => self.data.get(m).is_some_and(|inner| inner.contains_key(s)),
            _ => false,
        }
    }

    fn keys(&self) -> Vec<EntryKey<K>> {
        self.data
            .iter()
            .flat_map(|(m, inner)| inner.keys().map(move |s| EntryKey::Composite(m.clone(), s.clone())))
            .collect()
    }

    fn reverse_lookup(&self, value: &Arc<V>) -> Option<EntryKey<K>> {
        self.reverse.get(&WeakByAddress::new(value)).cloned()
    }

    fn generate_key(&self, value: &Arc<V>) -> EntryKey<K> {
        let main = self
            .main_hash_fn
            .as_ref()
            .map(|f| f(value))
            .unwrap_or(EntryKey::Void)
            .into_main();
        let sub = (self.sub_key_of)(value).into_main();
        match (main, sub) {
            (Some(m), Some(s)) => EntryKey::Composite(m, s),
            _ => EntryKey::Void,
        }
    }

    fn subkeys(&self, main: &K) -> Vec<EntryKey<K>> {
        self.data
            .get(main)
            .map(|inner| {
                inner
                    .keys()
                    .map(|s| EntryKey::Composite(main.clone(), s.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn natural(&self, main: &K) -> Natural<V> {
        match self.data.get(main) {
            Some(inner) => Natural::Many(inner.values().cloned().collect()),
            None => Natural::Many(Vec::new()),
        }
    }

    fn values(&self) -> Vec<Arc<V>> {
        self.data.values().flat_map(|inner| inner.values().cloned()).collect()
    }

    fn empty_copy(&self) -> Box<dyn Mapping<K, V>> {
        Box::new(CollectionMap {
            data: HashMap::new(),
            reverse: HashMap::new(),
            main_hash_fn: self.main_hash_fn.clone(),
            sub_key_of: self.sub_key_of.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    struct Row {
        id: u64,
        owner: u64,
    }

    fn flat() -> FlatMap<u64, Row> {
        let hash: HashFn<u64, Row> = Arc::new(|r| EntryKey::Main(r.id));
        FlatMap::new(Some(hash))
    }

    fn collection() -> CollectionMap<u64, Row> {
        let main: HashFn<u64, Row> = Arc::new(|r| EntryKey::Main(r.owner));
        let sub: HashFn<u64, Row> = Arc::new(|r| EntryKey::Main(r.id));
        CollectionMap::new(Some(main), sub)
    }

    #[test]
    fn add_then_has_is_true() {
        let mut m = flat();
        let row = Arc::new(Row { id: 1, owner: 9 });
        m.add(row.clone());
        assert!(m.has(&row));
    }

    #[test]
    fn del_removes_both_directions() {
        let mut m = flat();
        let row = Arc::new(Row { id: 1, owner: 9 });
        let key = m.add(row.clone());
        m.del(&key);
        assert!(!m.contains(&key));
        assert!(m.reverse_lookup(&row).is_none());
    }

    #[test]
    fn empty_copy_shares_hash_fn_but_no_data() {
        let mut m = flat();
        m.add(Arc::new(Row { id: 1, owner: 9 }));
        let copy = m.empty_copy();
        assert!(copy.values().is_empty());
        let fresh = Arc::new(Row { id: 2, owner: 3 });
        assert_eq!(copy.generate_key(&fresh), EntryKey::Main(2));
    }

    #[test]
    fn collection_groups_rows_sharing_an_owner_under_one_main_key() {
        let mut m = collection();
        let a = Arc::new(Row { id: 1, owner: 7 });
        let b = Arc::new(Row { id: 2, owner: 7 });
        m.add(a.clone());
        m.add(b.clone());
        assert_eq!(m.subkeys(&7).len(), 2);
        match m.natural(&7) {
            Natural::Many(rows) => assert_eq!(rows.len(), 2),
            other => panic!("expected a group of two, got {other:?}"),
        }
    }

    proptest! {
        /// Whatever key `add` derives for a value, `key_of` on the same
        /// value afterward must return that same key (the memoized reverse
        /// index, once populated, never disagrees with itself).
        #[test]
        fn flat_map_key_of_is_stable_after_add(id in any::<u64>(), owner in any::<u64>()) {
            let mut m = flat();
            let row = Arc::new(Row { id, owner });
            let key = m.add(row.clone());
            prop_assert_eq!(m.key_of(&row), key);
        }

        /// A value removed from a flat map is never reported present, and
        /// re-adding it produces a value retrievable by the same key again.
        #[test]
        fn flat_map_remove_then_readd_round_trips(id in any::<u64>(), owner in any::<u64>()) {
            let mut m = flat();
            let row = Arc::new(Row { id, owner });
            m.add(row.clone());
            m.remove(&row);
            prop_assert!(!m.has(&row));
            let key = m.add(row.clone());
            prop_assert!(m.get(&key).is_some());
        }

        /// Every row added under a given owner appears in that owner's
        /// `subkeys`, regardless of how many distinct owners share the map.
        #[test]
        fn collection_map_subkeys_cover_every_row_added_under_an_owner(
            owner in any::<u64>(),
            ids in prop::collection::hash_set(any::<u64>(), 1..8),
        ) {
            let mut m = collection();
            for &id in &ids {
                m.add(Arc::new(Row { id, owner }));
            }
            prop_assert_eq!(m.subkeys(&owner).len(), ids.len());
        }
    }
}
