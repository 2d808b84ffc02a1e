use async_trait::async_trait;
use common::models::WeatherSnapshot;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};

use crate::error::StoreError;

/// Key-value store of weather snapshots with per-entry expiry.
///
/// Keys are normalized city names. `set` replaces any live entry for the key
/// and `delete` succeeds whether or not the key exists.
#[async_trait]
pub trait TtlCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<WeatherSnapshot>, StoreError>;

    async fn set(&self, key: &str, value: &WeatherSnapshot, ttl: Duration)
    -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Remove entries whose TTL has elapsed, returning how many were dropped.
    async fn purge_expired(&self) -> Result<u64, StoreError>;

    /// Number of stored entries, expired or not.
    async fn entry_count(&self) -> Result<u64, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

struct CacheEntry {
    data: WeatherSnapshot,
    expires_at: Instant,
}

/// Process-local cache. Expiry is checked lazily on read and by
/// [`TtlCache::purge_expired`].
pub struct InMemoryTtlCache {
    cache: Arc<RwLock<HashMap<String, CacheEntry>>>,
    max_ttl: Duration,
}

impl InMemoryTtlCache {
    /// `max_ttl_seconds` is the backend TTL; a longer TTL passed to `set` is capped to it.
    pub fn with_ttl(max_ttl_seconds: u64) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            max_ttl: Duration::from_secs(max_ttl_seconds),
        }
    }
}

#[async_trait]
impl TtlCache for InMemoryTtlCache {
    async fn get(&self, key: &str) -> Result<Option<WeatherSnapshot>, StoreError> {
        {
            let cache = self.cache.read().await;
            match cache.get(key) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Ok(Some(entry.data.clone()));
                }
                Some(_) => {}
                None => return Ok(None),
            }
        }

        let mut cache = self.cache.write().await;
        if cache
            .get(key)
            .is_some_and(|entry| entry.expires_at <= Instant::now())
        {
            cache.remove(key);
        }
        Ok(None)
    }

    async fn set(
        &self,
        key: &str,
        value: &WeatherSnapshot,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut cache = self.cache.write().await;
        cache.insert(
            key.to_string(),
            CacheEntry {
                data: value.clone(),
                expires_at: Instant::now() + ttl.min(self.max_ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.cache.write().await.remove(key);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        let now = Instant::now();
        cache.retain(|_, entry| entry.expires_at > now);
        Ok((before - cache.len()) as u64)
    }

    async fn entry_count(&self) -> Result<u64, StoreError> {
        Ok(self.cache.read().await.len() as u64)
    }
}

/// A process-local cache in front of a shared persistent one.
///
/// The back store is authoritative and is read on every lookup. A front copy
/// is served only while it matches the back row and is evicted otherwise, so
/// an invalidation or refresh on any instance is seen by all of them. Writes,
/// deletes and purges go to both layers.
pub struct LayeredCache {
    front: Arc<dyn TtlCache>,
    back: Arc<dyn TtlCache>,
}

impl LayeredCache {
    pub fn new(front: Arc<dyn TtlCache>, back: Arc<dyn TtlCache>) -> Self {
        Self { front, back }
    }
}

#[async_trait]
impl TtlCache for LayeredCache {
    async fn get(&self, key: &str) -> Result<Option<WeatherSnapshot>, StoreError> {
        let front = self.front.get(key).await?;
        let back = self.back.get(key).await?;

        match (front, back) {
            (Some(local), Some(shared)) if local == shared => Ok(Some(local)),
            (Some(_), shared) => {
                // Deleted or replaced elsewhere.
                self.front.delete(key).await?;
                Ok(shared)
            }
            (None, shared) => Ok(shared),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: &WeatherSnapshot,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let front = self.front.set(key, value, ttl).await;
        let back = self.back.set(key, value, ttl).await;
        front.and(back)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let front = self.front.delete(key).await;
        let back = self.back.delete(key).await;
        front.and(back)
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        Ok(self.front.purge_expired().await? + self.back.purge_expired().await?)
    }

    async fn entry_count(&self) -> Result<u64, StoreError> {
        self.back.entry_count().await
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.front.health_check().await?;
        self.back.health_check().await
    }
}
