use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Postgres};
use std::sync::Arc;
use std::time::Duration;

use crate::db;
use crate::kv::KvStore;

/// `KvStore` over the `edge_kv` table. Expired rows are invisible to reads and
/// removed by [`spawn_purge_loop`].
#[derive(Clone)]
pub struct PgKvStore {
    pool: Pool<Postgres>,
}

impl PgKvStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub async fn purge_expired(&self) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM edge_kv WHERE expires_at IS NOT NULL AND expires_at <= NOW()")
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl KvStore for PgKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>(
            "SELECT value FROM edge_kv WHERE key = $1 AND (expires_at IS NULL OR expires_at > NOW())",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let expires_at = match ttl {
            Some(ttl) => Some(Utc::now() + chrono::Duration::from_std(ttl)?),
            None => None,
        };
        sqlx::query(
            "INSERT INTO edge_kv (key, value, expires_at, updated_at) VALUES ($1, $2, $3, NOW()) ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at, updated_at = NOW()",
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn check_ready(&self) -> Result<()> {
        db::check_ready(&self.pool).await
    }
}

pub fn spawn_purge_loop(store: Arc<PgKvStore>, interval: Duration) {
    let interval = interval.max(Duration::from_secs(60));
    tokio::spawn(async move {
        loop {
            match store.purge_expired().await {
                Ok(removed) if removed > 0 => {
                    tracing::info!(removed, "kv retention cleanup");
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "kv retention cleanup failed");
                }
            }
            tokio::time::sleep(interval).await;
        }
    });
}
