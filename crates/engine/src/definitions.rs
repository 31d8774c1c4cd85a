//! Service/function definition lookup with a short-TTL read-through cache.
//!
//! Admission consults this for per-function policy (max attempts, timeout,
//! cache TTL); result persistence consults it for the owner's
//! predictive-retries flag. Staleness of up to the TTL window (~5s) is an
//! accepted availability/consistency tradeoff.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use jobrelay_core::{ClusterSettings, FunctionPolicy, OwnerHash, ServiceDefinition};

use crate::store::StoreError;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5);

/// Upstream source of definition documents (registry table, config service).
#[async_trait]
pub trait DefinitionSource: Send + Sync {
    /// The owner's definition for `service`; `None` falls back to defaults.
    async fn service_definition(
        &self,
        owner: &OwnerHash,
        service: &str,
    ) -> Result<Option<ServiceDefinition>, StoreError>;

    async fn cluster_settings(&self, owner: &OwnerHash) -> Result<ClusterSettings, StoreError>;
}

/// Fixed in-memory source for tests/dev.
#[derive(Debug, Default)]
pub struct StaticDefinitionSource {
    services: HashMap<(OwnerHash, String), ServiceDefinition>,
    clusters: HashMap<OwnerHash, ClusterSettings>,
}

impl StaticDefinitionSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(
        mut self,
        owner: impl Into<OwnerHash>,
        service: impl Into<String>,
        definition: ServiceDefinition,
    ) -> Self {
        self.services.insert((owner.into(), service.into()), definition);
        self
    }

    pub fn with_cluster(
        mut self,
        owner: impl Into<OwnerHash>,
        settings: ClusterSettings,
    ) -> Self {
        self.clusters.insert(owner.into(), settings);
        self
    }
}

#[async_trait]
impl DefinitionSource for StaticDefinitionSource {
    async fn service_definition(
        &self,
        owner: &OwnerHash,
        service: &str,
    ) -> Result<Option<ServiceDefinition>, StoreError> {
        Ok(self
            .services
            .get(&(owner.clone(), service.to_string()))
            .cloned())
    }

    async fn cluster_settings(&self, owner: &OwnerHash) -> Result<ClusterSettings, StoreError> {
        Ok(self.clusters.get(owner).copied().unwrap_or_default())
    }
}

#[derive(Debug, Clone)]
struct CachedEntry<T> {
    fetched_at: Instant,
    value: T,
}

#[derive(Default)]
struct CacheTables {
    services: HashMap<(OwnerHash, String), CachedEntry<Option<ServiceDefinition>>>,
    clusters: HashMap<OwnerHash, CachedEntry<ClusterSettings>>,
}

/// Read-through cache over a [`DefinitionSource`].
#[derive(Clone)]
pub struct DefinitionCache {
    source: Arc<dyn DefinitionSource>,
    ttl: Duration,
    tables: Arc<Mutex<CacheTables>>,
}

impl DefinitionCache {
    pub fn new(source: Arc<dyn DefinitionSource>) -> Self {
        Self::with_ttl(source, DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(source: Arc<dyn DefinitionSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            tables: Arc::new(Mutex::new(CacheTables::default())),
        }
    }

    /// Effective policy for `(owner, service, target_fn)`.
    pub async fn function_policy(
        &self,
        owner: &OwnerHash,
        service: &str,
        target_fn: &str,
    ) -> Result<FunctionPolicy, StoreError> {
        let definition = self.service_definition(owner, service).await?;
        Ok(definition
            .map(|d| d.policy_for(target_fn))
            .unwrap_or_default())
    }

    pub async fn service_definition(
        &self,
        owner: &OwnerHash,
        service: &str,
    ) -> Result<Option<ServiceDefinition>, StoreError> {
        let key = (owner.clone(), service.to_string());
        if let Some(value) = self.fresh(|t| t.services.get(&key).cloned()) {
            return Ok(value);
        }

        let value = self.source.service_definition(owner, service).await?;
        if let Ok(mut tables) = self.tables.lock() {
            tables.services.insert(
                key,
                CachedEntry {
                    fetched_at: Instant::now(),
                    value: value.clone(),
                },
            );
        }
        Ok(value)
    }

    pub async fn cluster_settings(
        &self,
        owner: &OwnerHash,
    ) -> Result<ClusterSettings, StoreError> {
        if let Some(value) = self.fresh(|t| t.clusters.get(owner).cloned()) {
            return Ok(value);
        }

        let value = self.source.cluster_settings(owner).await?;
        if let Ok(mut tables) = self.tables.lock() {
            tables.clusters.insert(
                owner.clone(),
                CachedEntry {
                    fetched_at: Instant::now(),
                    value,
                },
            );
        }
        Ok(value)
    }

    fn fresh<T>(&self, lookup: impl FnOnce(&CacheTables) -> Option<CachedEntry<T>>) -> Option<T> {
        let tables = self.tables.lock().ok()?;
        let entry = lookup(&tables)?;
        (entry.fetched_at.elapsed() < self.ttl).then_some(entry.value)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Counts upstream fetches so tests can observe cache behavior.
    struct CountingSource {
        inner: StaticDefinitionSource,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl DefinitionSource for CountingSource {
        async fn service_definition(
            &self,
            owner: &OwnerHash,
            service: &str,
        ) -> Result<Option<ServiceDefinition>, StoreError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.inner.service_definition(owner, service).await
        }

        async fn cluster_settings(
            &self,
            owner: &OwnerHash,
        ) -> Result<ClusterSettings, StoreError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.inner.cluster_settings(owner).await
        }
    }

    #[tokio::test]
    async fn repeated_lookups_within_ttl_hit_the_cache() {
        let source = Arc::new(CountingSource {
            inner: StaticDefinitionSource::new().with_service(
                "o1",
                "svc",
                ServiceDefinition::default(),
            ),
            fetches: AtomicUsize::new(0),
        });
        let cache = DefinitionCache::with_ttl(source.clone(), Duration::from_secs(5));
        let owner = OwnerHash::new("o1");

        cache.function_policy(&owner, "svc", "f").await.unwrap();
        cache.function_policy(&owner, "svc", "f").await.unwrap();
        cache.function_policy(&owner, "svc", "g").await.unwrap();

        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entries_refetch() {
        let source = Arc::new(CountingSource {
            inner: StaticDefinitionSource::new(),
            fetches: AtomicUsize::new(0),
        });
        let cache = DefinitionCache::with_ttl(source.clone(), Duration::from_millis(50));
        let owner = OwnerHash::new("o1");

        cache.cluster_settings(&owner).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        cache.cluster_settings(&owner).await.unwrap();

        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unknown_service_resolves_default_policy() {
        let cache = DefinitionCache::new(Arc::new(StaticDefinitionSource::new()));
        let policy = cache
            .function_policy(&OwnerHash::new("o1"), "svc", "f")
            .await
            .unwrap();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.cache_ttl_seconds, None);
    }
}
