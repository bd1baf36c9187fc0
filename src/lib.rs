//! Scoped identity maps, copy-on-write transaction overlays, and a lock-
//! coordinated multi-scope transaction pool for heterogeneous backing
//! stores.
//!
//! The pieces compose bottom-up:
//!
//! - [`map`] — double-sided mappings (`FlatMap`, `CollectionMap`).
//! - [`identity`] — residency tracking (`IdentityMap`) on top of a mapping.
//! - [`storage`] — a named bundle of identity maps sharing a cache policy
//!   (`Storage`), plus the process-wide `Storage::of` registry.
//! - [`lock`] — per-key async locking (`GlobalLock`, `LockClient`,
//!   `CompositeLock`) layered on identity maps.
//! - [`overlay`] — per-transaction copy-on-write views (`StorageTransaction`).
//! - [`scope`] / [`source`] — the seam to a concrete backing store.
//! - [`pool`] — coordinating several scopes' transactions as one unit.

pub mod error;
pub mod identity;
pub mod key;
pub mod lock;
pub mod map;
pub mod overlay;
pub mod pool;
mod registry;
pub mod scope;
pub mod source;
pub mod storage;

pub use error::{CoreError, CoreResult};
pub use identity::IdentityMap;
pub use key::{ByAddress, EntryKey, HashFn, Natural, WeakByAddress};
pub use lock::{CompositeLock, GlobalLock, IdentityMapLockClient, LockClient, LockMap, StorageLock, StorageLockClient};
pub use map::{CollectionMap, FlatMap, Mapping};
pub use overlay::{CloneFn, RestoreFn, StorageEntry, StorageTransaction};
pub use pool::{Cache, OneTimeCache, PersistentCache, Pool, PoolEntry};
pub use scope::{BackendTransaction, Scope};
pub use source::DataSource;
pub use storage::{CachePolicy, MappingSpec, Storage};


/// End-to-end scenarios spanning identity maps, overlays, locks, and pools
/// against an in-memory fixture scope.
#[cfg(test)]
mod integration_tests {
    use std::any::Any;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::error::CoreError;
    use crate::key::{EntryKey, HashFn};
    use crate::lock::StorageLock;
    use crate::overlay::CloneFn;
    use crate::pool::Pool;
    use crate::scope::{BackendTransaction, Scope};
    use crate::storage::{CachePolicy, MappingSpec, Storage};

    #[derive(Debug, Clone)]
    struct Account {
        id: u64,
        owner_id: u64,
        balance: i64,
    }

    struct FixtureTransaction {
        committed: Arc<std::sync::atomic::AtomicBool>,
        fail_commit: bool,
    }

    #[async_trait]
    impl BackendTransaction for FixtureTransaction {
        async fn commit(&self) -> anyhow::Result<()> {
            if self.fail_commit {
                anyhow::bail!("simulated backend failure");
            }
            self.committed.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct AccountsScope {
        storage: Storage<u64, Account>,
        storage_lock: StorageLock<u64, Account>,
        fail_commit: bool,
    }

    impl AccountsScope {
        fn new(fail_commit: bool) -> Self {
            let storage = Storage::new(CachePolicy::Retain);
            let by_id: HashFn<u64, Account> = Arc::new(|a| EntryKey::Main(a.id));
            storage.make_mapping("id", MappingSpec::Hash(by_id));
            storage.make_mapping(
                "by_owner",
                MappingSpec::Collection {
                    id_map: "id".to_string(),
                    hash: Some(Arc::new(|a: &Arc<Account>| EntryKey::Main(a.owner_id))),
                },
            );
            let storage_lock = StorageLock::new(&storage);
            Self {
                storage,
                storage_lock,
                fail_commit,
            }
        }
    }

    #[async_trait]
    impl Scope<u64, Account> for AccountsScope {
        fn id(&self) -> &str {
            "accounts"
        }

        fn storage(&self) -> &Storage<u64, Account> {
            &self.storage
        }

        fn storage_lock(&self) -> &StorageLock<u64, Account> {
            &self.storage_lock
        }

        fn clone_fn(&self) -> Option<CloneFn<Account>> {
            Some(Arc::new(|a: &Arc<Account>| Arc::new((**a).clone())))
        }

        async fn create_transaction(&self) -> anyhow::Result<Arc<dyn BackendTransaction>> {
            Ok(Arc::new(FixtureTransaction {
                committed: Arc::new(std::sync::atomic::AtomicBool::new(false)),
                fail_commit: self.fail_commit,
            }))
        }
    }

    #[tokio::test]
    async fn writable_entry_is_copy_on_write_until_commit() {
        let scope = Arc::new(AccountsScope::new(false));
        let account = Arc::new(Account {
            id: 1,
            owner_id: 1,
            balance: 100,
        });
        scope.storage.mapping("id").set(EntryKey::Main(1), account.clone());

        let pool: Pool<u64, Account> = Pool::with_default_cache(vec![scope.clone()], vec![account.clone()]);
        let entry = pool.enter().await.expect("pool entry must open");
        let source = entry.source("accounts").expect("accounts source must exist");

        let writable = source.writable(account.clone()).await.expect("writable must resolve");
        assert!(!Arc::ptr_eq(&writable, &account), "writable must be a distinct clone");

        // The shared map is untouched until commit.
        let shared_before = scope.storage.mapping("id").get(&EntryKey::Main(1)).unwrap();
        assert_eq!(shared_before.balance, 100);

        entry.finish(Ok(())).await.expect("commit must succeed");
    }

    #[tokio::test]
    async fn partial_commit_is_reported_without_rolling_back() {
        let scope = Arc::new(AccountsScope::new(true));
        let account = Arc::new(Account {
            id: 2,
            owner_id: 1,
            balance: 50,
        });
        scope.storage.mapping("id").set(EntryKey::Main(2), account.clone());

        let pool: Pool<u64, Account> = Pool::with_default_cache(vec![scope.clone()], vec![account.clone()]);
        let entry = pool.enter().await.expect("pool entry must open");
        let result = entry.finish(Ok(())).await;
        assert!(matches!(result, Err(CoreError::PartialCommit { .. })));
    }

    #[tokio::test]
    async fn concurrent_pool_entries_serialize_on_the_same_write_set_entry() {
        let scope = Arc::new(AccountsScope::new(false));
        let account = Arc::new(Account {
            id: 3,
            owner_id: 1,
            balance: 10,
        });
        scope.storage.mapping("id").set(EntryKey::Main(3), account.clone());

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let run = |tag: &'static str, scope: Arc<AccountsScope>, account: Arc<Account>, order: Arc<std::sync::Mutex<Vec<&'static str>>>| async move {
            let pool: Pool<u64, Account> = Pool::with_default_cache(vec![scope], vec![account.clone()]);
            let entry = pool.enter().await.unwrap();
            order.lock().unwrap().push(tag);
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            entry.finish(Ok(())).await.unwrap();
        };

        let h1 = tokio::spawn(run("first", scope.clone(), account.clone(), order.clone()));
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let h2 = tokio::spawn(run("second", scope.clone(), account.clone(), order.clone()));

        h1.await.unwrap();
        h2.await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn storage_of_round_trips_through_the_process_wide_registry() {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let scope = AccountsScope::new(false);
        let account = Arc::new(Account {
            id: COUNTER.fetch_add(1, Ordering::SeqCst) + 1000,
            owner_id: 1,
            balance: 0,
        });
        scope.storage.bind(&account);
        let found = Storage::<u64, Account>::of(&account).expect("registered storage must be found");
        assert!(Arc::ptr_eq(&found.shared(), &scope.storage.shared()));
    }
}
