//! Shared, TTL-bound HTTP response cache local to the serving process.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

pub const DEFAULT_CAPACITY: usize = 1024;

/// A stored response. Carries no per-caller headers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedResponse {
    pub content_type: String,
    pub cache_control: String,
    pub body: Bytes,
}

#[async_trait]
pub trait EdgeCache: Send + Sync {
    async fn lookup(&self, key: &str) -> Option<CachedResponse>;

    async fn store(&self, key: &str, response: CachedResponse, ttl: Duration);
}

struct CacheEntry {
    response: CachedResponse,
    expires_at: Instant,
}

pub struct MemoryEdgeCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    capacity: usize,
}

impl MemoryEdgeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub async fn len(&self) -> usize {
        let entries = self.entries.read().await;
        let now = Instant::now();
        entries.values().filter(|entry| entry.expires_at > now).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemoryEdgeCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl EdgeCache for MemoryEdgeCache {
    async fn lookup(&self, key: &str) -> Option<CachedResponse> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.response.clone())
    }

    async fn store(&self, key: &str, response: CachedResponse, ttl: Duration) {
        let now = Instant::now();
        let mut entries = self.entries.write().await;

        if !entries.contains_key(key) && entries.len() >= self.capacity {
            entries.retain(|_, entry| entry.expires_at > now);
        }
        if !entries.contains_key(key) && entries.len() >= self.capacity {
            let soonest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.expires_at)
                .map(|(key, _)| key.clone());
            if let Some(evicted) = soonest {
                entries.remove(&evicted);
            }
        }

        entries.insert(
            key.to_string(),
            CacheEntry {
                response,
                expires_at: now + ttl,
            },
        );
    }
}
