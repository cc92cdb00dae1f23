//! Pool/group and file metadata caches.
//!
//! Both caches sit in front of metadata services that must not be hammered:
//! entries live for a fixed TTL, and concurrent misses on the same key share
//! one upstream load.

use dashmap::DashMap;
use galleon_common::error::Result;
use galleon_common::{FileAttributes, FileId, PoolGroupInfo, PoolName};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::executors::RetryPolicy;
use crate::provider::{Namespace, PoolManager};

struct CacheEntry<V> {
    value: V,
    loaded_at: Instant,
}

/// Hit/miss accounting of one cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub name: String,
    pub entries: usize,
    pub hits: u64,
    pub loads: u64,
}

type Inflight<V> = Arc<OnceCell<Result<V>>>;

/// TTL cache with single-flight loading per key
pub struct LoadingCache<K, V> {
    name: &'static str,
    ttl: Duration,
    entries: DashMap<K, CacheEntry<V>>,
    inflight: DashMap<K, Inflight<V>>,
    /// Bumped by every invalidation so loads that started earlier do not
    /// resurrect stale values.
    generation: AtomicU64,
    hits: AtomicU64,
    loads: AtomicU64,
}

impl<K, V> LoadingCache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync,
    V: Clone + Send + Sync,
{
    pub fn new(name: &'static str, ttl: Duration) -> Self {
        Self {
            name,
            ttl,
            entries: DashMap::new(),
            inflight: DashMap::new(),
            generation: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            loads: AtomicU64::new(0),
        }
    }

    /// Cached value if present and not expired
    pub fn get_if_present(&self, key: &K) -> Option<V> {
        let entry = self.entries.get(key)?;
        if entry.loaded_at.elapsed() < self.ttl {
            return Some(entry.value.clone());
        }
        drop(entry);
        self.entries
            .remove_if(key, |_, e| e.loaded_at.elapsed() >= self.ttl);
        None
    }

    /// Returns the cached value or loads it. Concurrent callers for the same
    /// key wait on a single invocation of `load` and all observe its result.
    pub async fn get_with<F, Fut>(&self, key: &K, load: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if let Some(value) = self.get_if_present(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }

        let cell = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let result = cell
            .get_or_init(|| async {
                // another caller may have finished loading between our miss
                // and taking the in-flight slot
                if let Some(value) = self.get_if_present(key) {
                    return Ok(value);
                }
                let generation = self.generation.load(Ordering::SeqCst);
                self.loads.fetch_add(1, Ordering::Relaxed);
                trace!(cache = self.name, key = ?key, "loading");
                let loaded = load().await;
                if let Ok(value) = &loaded {
                    if self.generation.load(Ordering::SeqCst) == generation {
                        self.insert(key.clone(), value.clone());
                    }
                }
                loaded
            })
            .await
            .clone();

        self.inflight.remove_if(key, |_, c| Arc::ptr_eq(c, &cell));
        result
    }

    pub fn insert(&self, key: K, value: V) {
        self.entries.insert(
            key,
            CacheEntry {
                value,
                loaded_at: Instant::now(),
            },
        );
    }

    /// Current invalidation generation, for loads that insert more than
    /// their own key
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Inserts unless a live entry already exists or anything was
    /// invalidated since `generation` was read. Returns whether it inserted.
    pub fn insert_if_current(&self, key: K, value: V, generation: u64) -> bool {
        if self.generation() != generation || self.get_if_present(&key).is_some() {
            return false;
        }
        self.insert(key, value);
        true
    }

    pub fn invalidate(&self, key: &K) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.entries.remove(key);
        self.inflight.remove(key);
    }

    pub fn invalidate_where<P>(&self, mut predicate: P)
    where
        P: FnMut(&K, &V) -> bool,
    {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.entries.retain(|k, e| !predicate(k, &e.value));
    }

    pub fn invalidate_all(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.entries.clear();
        self.inflight.clear();
        debug!(cache = self.name, "invalidated all entries");
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            name: self.name.to_string(),
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
        }
    }
}

/// Pool name -> resilient pool group
pub struct PoolGroupCache {
    cache: LoadingCache<PoolName, Option<PoolGroupInfo>>,
    pool_manager: Arc<dyn PoolManager>,
    retry: RetryPolicy,
}

impl PoolGroupCache {
    pub fn new(pool_manager: Arc<dyn PoolManager>, ttl: Duration, retry: RetryPolicy) -> Self {
        Self {
            cache: LoadingCache::new("pool-group", ttl),
            pool_manager,
            retry,
        }
    }

    /// The pool's resilient group. A load also fills the entries of every
    /// other member of the group, so a group scan costs one upstream call.
    pub async fn get(&self, pool: &PoolName) -> Result<Option<PoolGroupInfo>> {
        self.cache
            .get_with(pool, || async {
                let generation = self.cache.generation();
                let group = self
                    .retry
                    .run("pool group lookup", || self.pool_manager.resilient_group_of(pool))
                    .await?;
                if let Some(group) = &group {
                    for member in group.pools.iter().filter(|m| *m != pool) {
                        if !self.cache.insert_if_current(member.clone(), Some(group.clone()), generation) {
                            trace!(pool = %member, "skipped fan-out, cache changed during load");
                        }
                    }
                }
                Ok(group)
            })
            .await
    }

    pub fn invalidate(&self, pool: &PoolName) {
        self.cache.invalidate(pool);
    }

    /// Drops every entry pointing at the named group
    pub fn invalidate_group(&self, group: &str) {
        self.cache
            .invalidate_where(|_, v| v.as_ref().is_some_and(|g| g.name == group));
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

/// File id -> namespace attributes
pub struct FileAttributeCache {
    cache: LoadingCache<FileId, FileAttributes>,
    namespace: Arc<dyn Namespace>,
    retry: RetryPolicy,
}

impl FileAttributeCache {
    pub fn new(namespace: Arc<dyn Namespace>, ttl: Duration, retry: RetryPolicy) -> Self {
        Self {
            cache: LoadingCache::new("file-attributes", ttl),
            namespace,
            retry,
        }
    }

    pub async fn get(&self, file_id: &FileId) -> Result<FileAttributes> {
        self.cache
            .get_with(file_id, || {
                self.retry
                    .run("file attribute lookup", || self.namespace.file_attributes(file_id))
            })
            .await
    }

    pub fn invalidate(&self, file_id: &FileId) {
        self.cache.invalidate(file_id);
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use galleon_common::{GalleonError, PoolInfo, ReplicaConstraints};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;
    use tokio::task::JoinSet;

    /// Answers group lookups only after `gate` is notified
    struct GatedPoolManager {
        group: PoolGroupInfo,
        entered: Notify,
        gate: Notify,
    }

    impl GatedPoolManager {
        fn new() -> Arc<Self> {
            let constraints = ReplicaConstraints::new(2, 3).unwrap();
            let members = ["pool-a", "pool-b", "pool-c"].map(PoolName::from);
            Arc::new(Self {
                group: PoolGroupInfo::new("resilient", constraints, members).unwrap(),
                entered: Notify::new(),
                gate: Notify::new(),
            })
        }
    }

    #[async_trait]
    impl PoolManager for GatedPoolManager {
        async fn resilient_group_of(&self, _pool: &PoolName) -> Result<Option<PoolGroupInfo>> {
            self.entered.notify_one();
            self.gate.notified().await;
            Ok(Some(self.group.clone()))
        }

        async fn resilient_groups(&self) -> Result<Vec<PoolGroupInfo>> {
            Ok(vec![self.group.clone()])
        }

        async fn pool_infos(&self, _pools: &[PoolName]) -> Result<Vec<PoolInfo>> {
            Ok(Vec::new())
        }
    }

    fn no_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 1,
            delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_group_load_fills_other_members() {
        let manager = GatedPoolManager::new();
        let cache = PoolGroupCache::new(manager.clone(), Duration::from_secs(60), no_retry());
        manager.gate.notify_one();

        let group = cache.get(&"pool-a".into()).await.unwrap().unwrap();
        assert_eq!(group.name, "resilient");
        assert_eq!(cache.stats().entries, 3);
        assert!(cache.cache.get_if_present(&"pool-c".into()).is_some());
    }

    #[tokio::test]
    async fn test_invalidation_during_load_skips_member_fan_out() {
        let manager = GatedPoolManager::new();
        let cache = Arc::new(PoolGroupCache::new(manager.clone(), Duration::from_secs(60), no_retry()));

        let load = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get(&"pool-a".into()).await })
        };
        manager.entered.notified().await;
        cache.invalidate_group("resilient");
        manager.gate.notify_one();

        // The caller still gets its answer, but nothing stale is kept
        assert!(load.await.unwrap().unwrap().is_some());
        assert!(cache.cache.get_if_present(&"pool-a".into()).is_none());
        assert!(cache.cache.get_if_present(&"pool-b".into()).is_none());
        assert!(cache.cache.get_if_present(&"pool-c".into()).is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_load() {
        let cache = Arc::new(LoadingCache::<String, u64>::new("test", Duration::from_secs(60)));
        let loads = Arc::new(AtomicUsize::new(0));
        let mut set = JoinSet::new();

        for _ in 0..16 {
            let cache = cache.clone();
            let loads = loads.clone();
            set.spawn(async move {
                cache
                    .get_with(&"pool-a".to_string(), || async move {
                        loads.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(7)
                    })
                    .await
            });
        }

        while let Some(result) = set.join_next().await {
            assert_eq!(result.unwrap().unwrap(), 7);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().loads, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let cache = LoadingCache::<String, u64>::new("test", Duration::from_secs(10));
        let key = "pool-a".to_string();
        cache.get_with(&key, || async { Ok(1) }).await.unwrap();
        assert_eq!(cache.get_if_present(&key), Some(1));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.get_if_present(&key), None);
        let reloaded = cache.get_with(&key, || async { Ok(2) }).await.unwrap();
        assert_eq!(reloaded, 2);
        assert_eq!(cache.stats().loads, 2);
    }

    #[tokio::test]
    async fn test_failed_load_is_not_cached() {
        let cache = LoadingCache::<String, u64>::new("test", Duration::from_secs(60));
        let key = "pool-a".to_string();
        let failed = cache
            .get_with(&key, || async {
                Err(GalleonError::UpstreamUnavailable("pool manager".into()))
            })
            .await;
        assert!(failed.is_err());
        assert_eq!(cache.get_with(&key, || async { Ok(3) }).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reload() {
        let cache = LoadingCache::<String, u64>::new("test", Duration::from_secs(60));
        let key = "pool-a".to_string();
        cache.get_with(&key, || async { Ok(1) }).await.unwrap();
        cache.invalidate(&key);
        assert_eq!(cache.get_with(&key, || async { Ok(2) }).await.unwrap(), 2);

        cache.invalidate_all();
        assert_eq!(cache.stats().entries, 0);
    }
}
