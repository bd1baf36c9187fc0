//! Entry keys and pointer-identity wrappers used throughout the crate.
//!
//! Every mapping addresses values through [`EntryKey`], a closed enum that
//! unifies the flat (single key) and collection (main key + sub key) cases
//! instead of two separate key types. [`ByAddress`] and [`WeakByAddress`]
//! hash and compare `Arc`/`Weak` pointers by identity, which is what the
//! reverse (value -> key) side of a mapping needs: it must never decide
//! that two distinct entities are "the same key" because their contents
//! happen to be equal.

use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

/// Key shape shared by flat and collection mappings.
///
/// `Void` marks "no key could be derived for this value" — setting or
/// looking up a void key is always a no-op, never an error.
#[derive(Debug)]
pub enum EntryKey<K> {
    Void,
    Main(K),
    Composite(K, K),
}

impl<K: Clone> Clone for EntryKey<K> {
    fn clone(&self) -> Self {
        match self {
            EntryKey::Void => EntryKey::Void,
            EntryKey::Main(k) => EntryKey::Main(k.clone()),
            EntryKey::Composite(m, s) => EntryKey::Composite(m.clone(), s.clone()),
        }
    }
}

impl<K: PartialEq> PartialEq for EntryKey<K> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (EntryKey::Void, EntryKey::Void) => true,
            (EntryKey::Main(a), EntryKey::Main(b)) => a == b,
            (EntryKey::Composite(a1, a2), EntryKey::Composite(b1, b2)) => a1 == b1 && a2 == b2,
            _ => false,
        }
    }
}
impl<K: Eq> Eq for EntryKey<K> {}

impl<K: Hash> Hash for EntryKey<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        core::mem::discriminant(self).hash(state);
        match self {
            EntryKey::Void => {}
            EntryKey::Main(k) => k.hash(state),
            EntryKey::Composite(m, s) => {
                m.hash(state);
                s.hash(state);
            }
        }
    }
}

impl<K> EntryKey<K> {
    pub fn is_void(&self) -> bool {
        matches!(self, EntryKey::Void)
    }

    /// The main-dimension key, present for both `Main` and `Composite`.
    pub fn main(&self) -> Option<&K> {
        match self {
            EntryKey::Main(k) | EntryKey::Composite(k, _) => Some(k),
            EntryKey::Void => None,
        }
    }

    pub fn into_main(self) -> Option<K> {
        match self {
            EntryKey::Main(k) => Some(k),
            _ => None,
        }
    }
}

/// What `IdentityMap::natural` returns for a main key: nothing, one value
/// (flat mappings), or a set of values sharing the main key (collection
/// mappings).
#[derive(Debug)]
pub enum Natural<V> {
    None,
    One(Arc<V>),
    Many(Vec<Arc<V>>),
}

impl<V> Natural<V> {
    pub fn into_vec(self) -> Vec<Arc<V>> {
        match self {
            Natural::None => Vec::new(),
            Natural::One(v) => vec![v],
            Natural::Many(vs) => vs,
        }
    }
}

/// A hash function deriving a key from a value, shared across clones of a
/// mapping (e.g. `empty_copy`).
pub type HashFn<K, V> = Arc<dyn Fn(&Arc<V>) -> EntryKey<K> + Send + Sync>;

/// Strong, pointer-identity-keyed reference. Used where the holder already
/// owns the value and just needs address-based equality (the overlay's
/// `existed`/`restored` bookkeeping).
pub struct ByAddress<V>(Arc<V>);

impl<V> ByAddress<V> {
    pub fn new(value: &Arc<V>) -> Self {
        ByAddress(value.clone())
    }
}

impl<V> Clone for ByAddress<V> {
    fn clone(&self) -> Self {
        ByAddress(self.0.clone())
    }
}

impl<V> PartialEq for ByAddress<V> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl<V> Eq for ByAddress<V> {}

impl<V> Hash for ByAddress<V> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

/// Weak, pointer-identity-keyed reference. Used for reverse indices and the
/// process-wide `Storage::of` registry, neither of which may keep a value
/// alive on the strength of being indexed.
pub struct WeakByAddress<V>(Weak<V>);

impl<V> WeakByAddress<V> {
    pub fn new(value: &Arc<V>) -> Self {
        WeakByAddress(Arc::downgrade(value))
    }
}

impl<V> Clone for WeakByAddress<V> {
    fn clone(&self) -> Self {
        WeakByAddress(self.0.clone())
    }
}

impl<V> PartialEq for WeakByAddress<V> {
    fn eq(&self, other: &Self) -> bool {
        Weak::ptr_eq(&self.0, &other.0)
    }
}
impl<V> Eq for WeakByAddress<V> {}

impl<V> Hash for WeakByAddress<V> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Weak::as_ptr(&self.0) as *const () as usize).hash(state);
    }
}
