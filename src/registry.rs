//! Process-wide weak-keyed registry mapping an entity value to the
//! [`crate::storage::Storage`] that owns it (`Storage::of`).
//!
//! The registry is keyed per `(K, V)` type pair behind a single type-erased
//! table, since a `static` item inside a generic function cannot itself be
//! generic over that function's type parameters. Each `(K, V)` pair gets
//! its own `HashMap<WeakByAddress<V>, Weak<StorageShared<K, V>>>`, stored
//! as a `Box<dyn Any>` and downcast back on access — sound because the
//! `TypeId` key and the concrete type stored under it always agree.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::key::WeakByAddress;
use crate::storage::StorageShared;

type Table<K, V> = Mutex<HashMap<WeakByAddress<V>, Weak<StorageShared<K, V>>>>;

fn registry() -> &'static Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn with_table<K, V, R>(f: impl FnOnce(&Table<K, V>) -> R) -> R
where
    K: 'static,
    V: 'static,
{
    let mut reg = registry().lock();
    let type_id = TypeId::of::<(K, V)>();
    let entry = reg
        .entry(type_id)
        .or_insert_with(|| Box::new(Table::<K, V>::new(HashMap::new())) as Box<dyn Any + Send + Sync>);
    let table = entry
        .downcast_ref::<Table<K, V>>()
        .expect("registry entry type mismatch: TypeId collision between distinct (K, V) pairs");
    f(table)
}

pub(crate) fn bind<K, V>(value: &Arc<V>, storage: &Weak<StorageShared<K, V>>)
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    with_table::<K, V, _>(|table| {
        table.lock().insert(WeakByAddress::new(value), storage.clone());
    });
}

pub(crate) fn of<K, V>(value: &Arc<V>) -> Option<Weak<StorageShared<K, V>>>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    with_table::<K, V, _>(|table| table.lock().get(&WeakByAddress::new(value)).cloned())
}
