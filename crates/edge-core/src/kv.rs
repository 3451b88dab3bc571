//! Key-value store capability.
//!
//! The store is an opaque get/put surface with optional per-key expiry and no
//! cross-key transactions. Handlers receive it as `Arc<dyn KvStore>`.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Overwrites `key`. `ttl = None` keeps the value until overwritten.
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    async fn check_ready(&self) -> Result<()> {
        Ok(())
    }
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |expires_at| expires_at > now)
    }
}

/// Process-local store for development and tests.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        let entries = self.entries.read().await;
        let now = Instant::now();
        entries.values().filter(|entry| entry.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Entries held in memory, including expired ones not yet purged.
    pub async fn stored_entries(&self) -> usize {
        self.entries.read().await.len()
    }
}

/// Memory counterpart of `kv_postgres::spawn_purge_loop`. Expired entries are
/// invisible to reads but stay in the map until purged.
pub fn spawn_purge_loop(store: Arc<MemoryKvStore>, interval: Duration) {
    tokio::spawn(async move {
        loop {
            let removed = store.purge_expired().await;
            if removed > 0 {
                tracing::info!(removed, "memory kv retention cleanup");
            }
            tokio::time::sleep(interval).await;
        }
    });
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live(Instant::now()))
            .map(|entry| entry.value.clone()))
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let entry = Entry {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), entry);
        Ok(())
    }
}
