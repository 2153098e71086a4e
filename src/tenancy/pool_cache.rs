//! # Per-Tenant Connection Pool Cache
//!
//! A bounded, access-expiring cache of per-tenant connection pools. Pools are
//! expensive to build (registry lookup, credential decryption, pool
//! construction), so concurrent requests for the same tenant are collapsed
//! into a single build, and every evicted pool is torn down exactly once.
//!
//! The map lock is a plain `std::sync::Mutex` and is never held across an
//! await point. All async work (loading, teardown) happens outside the lock;
//! waiters park on a broadcast channel stored in the slot they are waiting on.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, gauge};
use sea_orm::DatabaseConnection;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use thiserror::Error;
use tokio::sync::broadcast;
use zeroize::Zeroizing;

use crate::config::{PoolCacheConfig, TenantPoolConfig};
use crate::crypto::{CryptoKey, decrypt_password};
use crate::models::tenant::IsolationType;
use crate::repositories::TenantRepository;

/// Errors surfaced when obtaining a cached resource.
///
/// Clone because a single build failure is delivered to every request that
/// was waiting on that build.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("unknown tenant: {0}")]
    UnknownTenant(String),
    #[error("failed to construct pool for tenant {tenant_id}: {reason}")]
    Construction { tenant_id: String, reason: String },
}

impl CacheError {
    fn construction(tenant_id: &str, reason: impl std::fmt::Display) -> Self {
        CacheError::Construction {
            tenant_id: tenant_id.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Builds and tears down the cached resource for a key.
#[async_trait]
pub trait ResourceLoader: Send + Sync + 'static {
    type Resource: Send + Sync + 'static;

    /// Construct the resource for `key`. Called at most once per cache miss
    /// regardless of how many requests are waiting.
    async fn load(&self, key: &str) -> Result<Self::Resource, CacheError>;

    /// Release the resource after eviction. Called exactly once per evicted
    /// entry.
    async fn teardown(&self, key: &str, resource: &Self::Resource);
}

struct Entry<R> {
    resource: Arc<R>,
    last_access: Instant,
}

enum Slot<R> {
    Ready(Entry<R>),
    /// A build is in flight; waiters subscribe and park on the channel.
    Pending(broadcast::Sender<Result<Arc<R>, CacheError>>),
}

/// Bounded cache with access expiry, single-flight builds, and exactly-once
/// teardown of evicted entries.
pub struct PoolCache<L: ResourceLoader> {
    loader: L,
    max_entries: usize,
    expire_after_access: Duration,
    slots: Mutex<HashMap<String, Slot<L::Resource>>>,
}

impl<L: ResourceLoader> PoolCache<L> {
    pub fn new(loader: L, max_entries: usize, expire_after_access: Duration) -> Self {
        Self {
            loader,
            max_entries,
            expire_after_access,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(loader: L, config: &PoolCacheConfig) -> Self {
        Self::new(
            loader,
            config.max_entries,
            Duration::from_secs(config.expire_after_access_minutes * 60),
        )
    }

    /// Get the cached resource for `key`, building it on a miss.
    ///
    /// Concurrent calls for the same missing key perform one build; every
    /// caller receives the same `Arc` (or the same build error). An entry
    /// whose last access is older than the expiry window is treated as a
    /// miss and torn down before rebuilding.
    pub async fn get(&self, key: &str) -> Result<Arc<L::Resource>, CacheError> {
        // What to do after releasing the lock. The guard must not be visible
        // at any await point (even via `drop`) or the future loses `Send`, so
        // the locked section computes an action and the awaits happen after
        // the guard's lexical scope ends.
        enum Action<R> {
            Expired(Option<Slot<R>>),
            Hit(Arc<R>),
            Wait(broadcast::Receiver<Result<Arc<R>, CacheError>>),
            Build(broadcast::Sender<Result<Arc<R>, CacheError>>),
        }

        loop {
            let action = {
                let mut slots = self.lock_slots();

                let expired = matches!(
                    slots.get(key),
                    Some(Slot::Ready(entry))
                        if entry.last_access.elapsed() >= self.expire_after_access
                );
                if expired {
                    Action::Expired(slots.remove(key))
                } else if let Some(slot) = slots.get_mut(key) {
                    match slot {
                        Slot::Ready(entry) => {
                            entry.last_access = Instant::now();
                            Action::Hit(entry.resource.clone())
                        }
                        Slot::Pending(tx) => Action::Wait(tx.subscribe()),
                    }
                } else {
                    let (tx, _keepalive) = broadcast::channel(1);
                    slots.insert(key.to_string(), Slot::Pending(tx.clone()));
                    Action::Build(tx)
                }
            };

            match action {
                Action::Expired(removed) => {
                    if let Some(Slot::Ready(entry)) = removed {
                        counter!("pool_cache_evictions_total", "reason" => "expired").increment(1);
                        self.loader.teardown(key, &entry.resource).await;
                    }
                    continue;
                }
                Action::Hit(resource) => {
                    counter!("pool_cache_hits_total").increment(1);
                    return Ok(resource);
                }
                Action::Wait(mut rx) => {
                    match rx.recv().await {
                        Ok(result) => return result,
                        // The builder was cancelled before publishing;
                        // retry and become the builder ourselves.
                        Err(_) => continue,
                    }
                }
                Action::Build(tx) => {
                    counter!("pool_cache_misses_total").increment(1);
                    return self.build(key, tx).await;
                }
            }
        }
    }

    /// Run the single build for `key` and publish the outcome to waiters.
    async fn build(
        &self,
        key: &str,
        tx: broadcast::Sender<Result<Arc<L::Resource>, CacheError>>,
    ) -> Result<Arc<L::Resource>, CacheError> {
        match self.loader.load(key).await {
            Ok(resource) => {
                let resource = Arc::new(resource);
                let evicted = {
                    let mut slots = self.lock_slots();
                    let evicted = self.evict_for_capacity(&mut slots);
                    slots.insert(
                        key.to_string(),
                        Slot::Ready(Entry {
                            resource: resource.clone(),
                            last_access: Instant::now(),
                        }),
                    );
                    gauge!("pool_cache_entries").set(slots.len() as f64);
                    evicted
                };
                let _ = tx.send(Ok(resource.clone()));
                for (evicted_key, evicted_resource) in evicted {
                    counter!("pool_cache_evictions_total", "reason" => "capacity").increment(1);
                    self.loader.teardown(&evicted_key, &evicted_resource).await;
                }
                Ok(resource)
            }
            Err(err) => {
                {
                    let mut slots = self.lock_slots();
                    slots.remove(key);
                }
                let _ = tx.send(Err(err.clone()));
                Err(err)
            }
        }
    }

    /// Evict least-recently-accessed ready entries until there is room for
    /// one more. Must be called with the lock held; teardown of the returned
    /// entries happens at the caller, outside the lock.
    fn evict_for_capacity(
        &self,
        slots: &mut HashMap<String, Slot<L::Resource>>,
    ) -> Vec<(String, Arc<L::Resource>)> {
        let mut evicted = Vec::new();
        loop {
            let ready_count = slots
                .values()
                .filter(|slot| matches!(slot, Slot::Ready(_)))
                .count();
            if ready_count < self.max_entries {
                break;
            }
            let oldest = slots
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Ready(entry) => Some((key.clone(), entry.last_access)),
                    Slot::Pending(_) => None,
                })
                .min_by_key(|(_, last_access)| *last_access)
                .map(|(key, _)| key);
            match oldest {
                Some(key) => {
                    if let Some(Slot::Ready(entry)) = slots.remove(&key) {
                        evicted.push((key, entry.resource));
                    }
                }
                None => break,
            }
        }
        evicted
    }

    /// Evict and tear down every entry whose last access is older than the
    /// expiry window. Called periodically by the background sweeper.
    pub async fn evict_expired(&self) {
        let expired: Vec<(String, Arc<L::Resource>)> = {
            let mut slots = self.lock_slots();
            let keys: Vec<String> = slots
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Ready(entry)
                        if entry.last_access.elapsed() >= self.expire_after_access =>
                    {
                        Some(key.clone())
                    }
                    _ => None,
                })
                .collect();
            let expired = keys
                .into_iter()
                .filter_map(|key| match slots.remove(&key) {
                    Some(Slot::Ready(entry)) => Some((key, entry.resource)),
                    _ => None,
                })
                .collect();
            gauge!("pool_cache_entries").set(slots.len() as f64);
            expired
        };
        for (key, resource) in expired {
            counter!("pool_cache_evictions_total", "reason" => "expired").increment(1);
            tracing::debug!(key = %key, "evicted expired cache entry");
            self.loader.teardown(&key, &resource).await;
        }
    }

    /// Tear down every ready entry. Used at shutdown.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, Arc<L::Resource>)> = {
            let mut slots = self.lock_slots();
            slots
                .drain()
                .filter_map(|(key, slot)| match slot {
                    Slot::Ready(entry) => Some((key, entry.resource)),
                    Slot::Pending(_) => None,
                })
                .collect()
        };
        for (key, resource) in drained {
            self.loader.teardown(&key, &resource).await;
        }
    }

    /// Number of entries currently in the cache, including in-flight builds.
    pub fn len(&self) -> usize {
        self.lock_slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<String, Slot<L::Resource>>> {
        // A panic while holding the lock leaves the map structurally sound,
        // so a poisoned lock is safe to recover.
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Spawn the periodic sweep that evicts expired entries.
pub fn spawn_expiry_sweeper<L: ResourceLoader>(
    cache: Arc<PoolCache<L>>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            cache.evict_expired().await;
        }
    })
}

/// A connection pool bound to one tenant's storage.
pub struct TenantPool {
    pub tenant_id: String,
    pub isolation: IsolationType,
    /// Login role the pool authenticates as; owner of the tenant's objects.
    pub username: String,
    pub pool: PgPool,
}

impl TenantPool {
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Builds [`TenantPool`]s from registry records.
pub struct TenantPoolLoader {
    registry: DatabaseConnection,
    crypto_key: CryptoKey,
    pool_config: TenantPoolConfig,
}

impl TenantPoolLoader {
    pub fn new(
        registry: DatabaseConnection,
        crypto_key: CryptoKey,
        pool_config: TenantPoolConfig,
    ) -> Self {
        Self {
            registry,
            crypto_key,
            pool_config,
        }
    }
}

#[async_trait]
impl ResourceLoader for TenantPoolLoader {
    type Resource = TenantPool;

    async fn load(&self, tenant_id: &str) -> Result<TenantPool, CacheError> {
        let repo = TenantRepository::new(&self.registry);
        let record = repo
            .find_by_tenant_id(tenant_id)
            .await
            .map_err(|err| CacheError::construction(tenant_id, err))?
            .ok_or_else(|| CacheError::UnknownTenant(tenant_id.to_string()))?;

        let password = Zeroizing::new(
            decrypt_password(&self.crypto_key, &record.tenant_id, &record.password_ciphertext)
                .map_err(|err| CacheError::construction(tenant_id, err))?,
        );

        let mut options = PgConnectOptions::from_str(&record.connection_url)
            .map_err(|err| CacheError::construction(tenant_id, err))?
            .username(&record.username)
            .password(password.as_str());

        // Schema-scoped tenants resolve unqualified table names inside their
        // own schema.
        if matches!(
            record.isolation_type,
            IsolationType::Schema | IsolationType::SchemaDiscriminator
        ) {
            options = options.options([("search_path", record.db_or_schema.as_str())]);
        }

        let pool = PgPoolOptions::new()
            .max_connections(self.pool_config.max_connections)
            .acquire_timeout(Duration::from_millis(self.pool_config.acquire_timeout_ms))
            .connect_lazy_with(options);

        tracing::info!(
            tenant_id = %record.tenant_id,
            isolation = ?record.isolation_type,
            "constructed tenant connection pool"
        );

        Ok(TenantPool {
            tenant_id: record.tenant_id,
            isolation: record.isolation_type,
            username: record.username,
            pool,
        })
    }

    async fn teardown(&self, tenant_id: &str, pool: &TenantPool) {
        tracing::info!(tenant_id = %tenant_id, "closing evicted tenant connection pool");
        pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::encrypt_password;
    use crate::repositories::NewTenantRecord;
    use migration::MigratorTrait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeLoader {
        build_delay: Duration,
        builds: AtomicUsize,
        teardowns: Mutex<Vec<String>>,
        fail_first_build_for: Mutex<HashSet<String>>,
    }

    impl FakeLoader {
        fn new(build_delay: Duration) -> Self {
            Self {
                build_delay,
                builds: AtomicUsize::new(0),
                teardowns: Mutex::new(Vec::new()),
                fail_first_build_for: Mutex::new(HashSet::new()),
            }
        }

        fn failing_once(build_delay: Duration, key: &str) -> Self {
            let loader = Self::new(build_delay);
            loader
                .fail_first_build_for
                .lock()
                .expect("test lock")
                .insert(key.to_string());
            loader
        }

        fn builds(&self) -> usize {
            self.builds.load(Ordering::SeqCst)
        }

        fn teardowns(&self) -> Vec<String> {
            self.teardowns.lock().expect("test lock").clone()
        }
    }

    #[async_trait]
    impl ResourceLoader for FakeLoader {
        type Resource = String;

        async fn load(&self, key: &str) -> Result<String, CacheError> {
            tokio::time::sleep(self.build_delay).await;
            let build = self.builds.fetch_add(1, Ordering::SeqCst) + 1;
            let should_fail = self
                .fail_first_build_for
                .lock()
                .expect("test lock")
                .remove(key);
            if should_fail {
                return Err(CacheError::construction(key, "simulated failure"));
            }
            Ok(format!("pool-{}-{}", key, build))
        }

        async fn teardown(&self, key: &str, _resource: &String) {
            self.teardowns.lock().expect("test lock").push(key.to_string());
        }
    }

    fn cache_with(
        loader: FakeLoader,
        max_entries: usize,
        expiry: Duration,
    ) -> Arc<PoolCache<FakeLoader>> {
        Arc::new(PoolCache::new(loader, max_entries, expiry))
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_build() {
        let cache = cache_with(
            FakeLoader::new(Duration::from_millis(50)),
            10,
            Duration::from_secs(600),
        );

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.get("acme").await }));
        }

        let mut resources = Vec::new();
        for handle in handles {
            resources.push(
                handle
                    .await
                    .expect("task completes")
                    .expect("build succeeds"),
            );
        }

        assert_eq!(cache.loader.builds(), 1);
        for resource in &resources[1..] {
            assert!(Arc::ptr_eq(&resources[0], resource));
        }
    }

    #[tokio::test]
    async fn test_concurrent_waiters_share_build_failure() {
        let cache = cache_with(
            FakeLoader::failing_once(Duration::from_millis(50), "acme"),
            10,
            Duration::from_secs(600),
        );

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.get("acme").await }));
        }

        for handle in handles {
            let result = handle.await.expect("task completes");
            assert!(matches!(result, Err(CacheError::Construction { .. })));
        }
        assert_eq!(cache.loader.builds(), 1);

        // A failed build leaves no entry behind; the next request rebuilds.
        let resource = cache.get("acme").await.expect("retry succeeds");
        assert_eq!(*resource, "pool-acme-2");
        assert_eq!(cache.loader.builds(), 2);
    }

    #[tokio::test]
    async fn test_capacity_eviction_tears_down_least_recently_used() {
        let cache = cache_with(
            FakeLoader::new(Duration::ZERO),
            2,
            Duration::from_secs(600),
        );

        cache.get("a").await.expect("a builds");
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.get("b").await.expect("b builds");
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Touch "a" so "b" becomes the least recently used entry.
        cache.get("a").await.expect("a hits");
        tokio::time::sleep(Duration::from_millis(10)).await;

        cache.get("c").await.expect("c builds");

        assert_eq!(cache.loader.teardowns(), vec!["b".to_string()]);
        assert_eq!(cache.len(), 2);

        // "b" was evicted, so requesting it again rebuilds.
        cache.get("b").await.expect("b rebuilds");
        assert_eq!(cache.loader.builds(), 4);
    }

    #[tokio::test]
    async fn test_access_expiry_evicts_exactly_once() {
        let cache = cache_with(
            FakeLoader::new(Duration::ZERO),
            10,
            Duration::from_millis(50),
        );

        cache.get("acme").await.expect("builds");
        tokio::time::sleep(Duration::from_millis(80)).await;

        cache.evict_expired().await;
        cache.evict_expired().await;
        assert_eq!(cache.loader.teardowns(), vec!["acme".to_string()]);
        assert!(cache.is_empty());

        let resource = cache.get("acme").await.expect("rebuilds");
        assert_eq!(*resource, "pool-acme-2");
    }

    #[tokio::test]
    async fn test_expired_entry_on_get_is_torn_down_and_rebuilt() {
        let cache = cache_with(
            FakeLoader::new(Duration::ZERO),
            10,
            Duration::from_millis(50),
        );

        cache.get("acme").await.expect("builds");
        tokio::time::sleep(Duration::from_millis(80)).await;

        // No sweeper ran; the get path itself notices the stale entry.
        let resource = cache.get("acme").await.expect("rebuilds");
        assert_eq!(*resource, "pool-acme-2");
        assert_eq!(cache.loader.teardowns(), vec!["acme".to_string()]);
    }

    #[tokio::test]
    async fn test_access_refreshes_expiry() {
        let cache = cache_with(
            FakeLoader::new(Duration::ZERO),
            10,
            Duration::from_millis(80),
        );

        cache.get("acme").await.expect("builds");
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            cache.get("acme").await.expect("hits");
        }

        assert_eq!(cache.loader.builds(), 1);
        assert!(cache.loader.teardowns().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_tears_down_all_entries() {
        let cache = cache_with(
            FakeLoader::new(Duration::ZERO),
            10,
            Duration::from_secs(600),
        );

        cache.get("a").await.expect("builds");
        cache.get("b").await.expect("builds");

        cache.shutdown().await;

        let mut teardowns = cache.loader.teardowns();
        teardowns.sort();
        assert_eq!(teardowns, vec!["a".to_string(), "b".to_string()]);
        assert!(cache.is_empty());
    }

    async fn registry_db() -> DatabaseConnection {
        let db = sea_orm::Database::connect("sqlite::memory:")
            .await
            .expect("sqlite memory db connects");
        migration::Migrator::up(&db, None)
            .await
            .expect("registry migrations apply");
        db
    }

    fn test_key() -> CryptoKey {
        CryptoKey::new(vec![9u8; 32]).expect("valid test key")
    }

    #[tokio::test]
    async fn test_loader_rejects_unregistered_tenant() {
        let loader = TenantPoolLoader::new(
            registry_db().await,
            test_key(),
            TenantPoolConfig::default(),
        );

        let result = loader.load("ghost").await;
        assert_eq!(
            result.err(),
            Some(CacheError::UnknownTenant("ghost".to_string()))
        );
    }

    #[tokio::test]
    async fn test_unregistered_tenant_surfaces_through_cache() {
        let loader = TenantPoolLoader::new(
            registry_db().await,
            test_key(),
            TenantPoolConfig::default(),
        );
        let cache = PoolCache::from_config(loader, &PoolCacheConfig::default());

        let err = cache.get("ghost").await.err();
        assert_eq!(err, Some(CacheError::UnknownTenant("ghost".to_string())));
        // A failed lookup leaves no slot behind.
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_loader_builds_pool_from_registry_record() {
        let db = registry_db().await;
        let repo = TenantRepository::new(&db);
        repo.insert_tenant(NewTenantRecord {
            tenant_id: "acme".to_string(),
            isolation_type: IsolationType::SchemaDiscriminator,
            db_or_schema: "acme".to_string(),
            connection_url: "postgres://localhost:5432/stratum".to_string(),
            username: "acme".to_string(),
            password_ciphertext: encrypt_password(&test_key(), "acme", "s3cret")
                .expect("credential encrypts"),
        })
        .await
        .expect("record inserted");

        let loader = TenantPoolLoader::new(db, test_key(), TenantPoolConfig::default());

        // connect_lazy_with defers the actual connection, so building the
        // pool needs no Postgres server.
        let pool = loader.load("acme").await.expect("pool builds");
        assert_eq!(pool.tenant_id, "acme");
        assert_eq!(pool.isolation, IsolationType::SchemaDiscriminator);
        assert_eq!(pool.username, "acme");
    }
}
