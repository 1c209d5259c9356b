use pkg_state::client::{StateStore, StoreError};
use pkg_types::namespace::Namespace;
use pkg_types::quantity::{self, ResourceList};
use pkg_types::quota::ClusterQuota;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub fn quota_key(name: &str) -> String {
    format!("/registry/clusterquotas/{}", name)
}

pub fn namespace_key(name: &str) -> String {
    format!("/registry/namespaces/{}", name)
}

#[derive(Debug, thiserror::Error)]
pub enum AccessorError {
    #[error("namespace '{0}' not visible within {1:?}")]
    NamespaceNotReady(String, Duration),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// A quota document together with its store version token.
#[derive(Debug, Clone)]
pub struct VersionedQuota {
    pub quota: ClusterQuota,
    pub version: u64,
}

/// Bounded cache of the most recent document this process wrote, keyed by
/// document name. Recency queue hand-rolled; eviction pops the oldest entry
/// once capacity is exceeded.
struct UpdatedQuotaCache {
    entries: HashMap<String, VersionedQuota>,
    recency: VecDeque<String>,
    capacity: usize,
}

impl UpdatedQuotaCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            recency: VecDeque::new(),
            capacity,
        }
    }

    fn touch(&mut self, name: &str) {
        self.recency.retain(|n| n != name);
        self.recency.push_back(name.to_string());
    }

    fn get(&mut self, name: &str) -> Option<VersionedQuota> {
        let entry = self.entries.get(name).cloned()?;
        self.touch(name);
        Some(entry)
    }

    fn insert(&mut self, entry: VersionedQuota) {
        self.touch(&entry.quota.name);
        self.entries.insert(entry.quota.name.clone(), entry);
        while self.entries.len() > self.capacity {
            let Some(oldest) = self.recency.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    fn remove(&mut self, name: &str) {
        self.entries.remove(name);
        self.recency.retain(|n| n != name);
    }
}

/// Resolves which quota documents apply to a namespace and keeps the
/// conflict-aware cache that masks the store's read-after-write latency:
/// a fresh read never supersedes a newer version this process itself wrote.
pub struct QuotaAccessor {
    store: StateStore,
    cache: Mutex<UpdatedQuotaCache>,
    poll_interval: Duration,
    poll_timeout: Duration,
}

impl QuotaAccessor {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            cache: Mutex::new(UpdatedQuotaCache::new(128)),
            poll_interval: Duration::from_millis(100),
            poll_timeout: Duration::from_secs(8),
        }
    }

    /// Override the namespace-visibility polling bounds. Test use mostly.
    pub fn with_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = interval;
        self.poll_timeout = timeout;
        self
    }

    /// All quota documents whose selector matches the namespace's labels.
    /// Waits (bounded polling) for the namespace object itself to become
    /// visible, since namespace creation and quota writes may race.
    pub async fn quotas_for_namespace(
        &self,
        namespace: &str,
    ) -> Result<Vec<VersionedQuota>, AccessorError> {
        let ns = self.wait_for_namespace(namespace).await?;

        let entries = self
            .store
            .list_versioned("/registry/clusterquotas/")
            .await
            .map_err(AccessorError::Internal)?;

        let mut result = Vec::new();
        for (key, bytes, version) in entries {
            let quota: ClusterQuota = match serde_json::from_slice(&bytes) {
                Ok(q) => q,
                Err(e) => {
                    warn!("Skipping unparsable quota document at {}: {}", key, e);
                    continue;
                }
            };
            if let Err(e) = quota.spec.selector.validate() {
                warn!("Skipping quota '{}' with invalid selector: {}", quota.name, e);
                continue;
            }
            if !quota.spec.selector.matches(&ns.labels) {
                continue;
            }
            result.push(self.reconcile_with_cache(quota, version).await);
        }
        Ok(result)
    }

    /// Fetch one document by name, honoring the cache.
    pub async fn get_quota(&self, name: &str) -> Result<VersionedQuota, AccessorError> {
        let key = quota_key(name);
        let Some((bytes, version)) = self
            .store
            .get_versioned(&key)
            .await
            .map_err(AccessorError::Internal)?
        else {
            return Err(AccessorError::Store(StoreError::NotFound(key)));
        };
        let quota: ClusterQuota =
            serde_json::from_slice(&bytes).map_err(|e| AccessorError::Internal(e.into()))?;
        Ok(self.reconcile_with_cache(quota, version).await)
    }

    /// Apply a new aggregate usage to one document on behalf of `namespace`.
    ///
    /// Re-fetches the authoritative document, computes the usage delta
    /// against it, applies the delta to both the namespace record and the
    /// total, and persists with a version check. The cache is overwritten
    /// only after the persist succeeds, so a later read in this process can
    /// never observe an older version than the one just written.
    pub async fn update_quota_status(
        &self,
        name: &str,
        namespace: &str,
        new_total_used: &ResourceList,
    ) -> Result<VersionedQuota, AccessorError> {
        let key = quota_key(name);
        let Some((bytes, version)) = self
            .store
            .get_versioned(&key)
            .await
            .map_err(AccessorError::Internal)?
        else {
            return Err(AccessorError::Store(StoreError::NotFound(key)));
        };
        let mut quota: ClusterQuota =
            serde_json::from_slice(&bytes).map_err(|e| AccessorError::Internal(e.into()))?;

        let delta = quantity::subtract(new_total_used, &quota.status.total.used);
        quota.apply_usage_delta(namespace, &delta);

        self.persist(quota, version).await
    }

    /// Persist a modified document wholesale, version checked against the
    /// version the caller read it at.
    pub async fn replace_quota_status(
        &self,
        quota: ClusterQuota,
        expected_version: u64,
    ) -> Result<VersionedQuota, AccessorError> {
        self.persist(quota, expected_version).await
    }

    async fn persist(
        &self,
        quota: ClusterQuota,
        expected_version: u64,
    ) -> Result<VersionedQuota, AccessorError> {
        let key = quota_key(&quota.name);
        let bytes = serde_json::to_vec(&quota).map_err(|e| AccessorError::Internal(e.into()))?;
        let new_version = self
            .store
            .put_versioned(&key, &bytes, Some(expected_version))
            .await?;
        debug!(
            "Persisted quota '{}' at version {} (was {})",
            quota.name, new_version, expected_version
        );

        let entry = VersionedQuota {
            quota,
            version: new_version,
        };
        self.cache.lock().await.insert(entry.clone());
        Ok(entry)
    }

    /// Prefer the cached copy when it is at least as new as the fetched one;
    /// evict the cache entry once the store has caught up.
    async fn reconcile_with_cache(&self, fetched: ClusterQuota, version: u64) -> VersionedQuota {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.get(&fetched.name) {
            if cached.version > version {
                debug!(
                    "Using cached quota '{}' v{} over stale read v{}",
                    fetched.name, cached.version, version
                );
                return cached;
            }
            // Store has caught up; the cache entry is redundant.
            cache.remove(&fetched.name);
        }
        VersionedQuota {
            quota: fetched,
            version,
        }
    }

    async fn wait_for_namespace(&self, name: &str) -> Result<Namespace, AccessorError> {
        let key = namespace_key(name);
        let deadline = tokio::time::Instant::now() + self.poll_timeout;
        loop {
            if let Some(bytes) = self
                .store
                .get(&key)
                .await
                .map_err(AccessorError::Internal)?
                && let Ok(ns) = serde_json::from_slice::<Namespace>(&bytes)
            {
                return Ok(ns);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AccessorError::NamespaceNotReady(
                    name.to_string(),
                    self.poll_timeout,
                ));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
