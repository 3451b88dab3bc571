//! Postgres pool for the durable KV backend.

use anyhow::{anyhow, Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use std::time::Duration;

use crate::config;

pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl DbConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    /// `None` when `DATABASE_URL` is unset or blank.
    pub fn from_env() -> Result<Option<Self>> {
        let Some(url) = config::optional_env("DATABASE_URL") else {
            return Ok(None);
        };
        let max_connections =
            config::u64_from_env("DATABASE_MAX_CONNECTIONS", u64::from(DEFAULT_MAX_CONNECTIONS))?;
        let max_connections = u32::try_from(max_connections)
            .ok()
            .filter(|max| *max > 0)
            .ok_or_else(|| anyhow!("DATABASE_MAX_CONNECTIONS must be between 1 and {}", u32::MAX))?;
        Ok(Some(Self {
            url,
            max_connections,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }))
    }

    pub fn required_from_env() -> Result<Self> {
        Self::from_env()?.ok_or_else(|| anyhow!("missing env: DATABASE_URL"))
    }
}

pub async fn connect(config: &DbConfig) -> Result<Pool<Postgres>> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(&config.url)
        .await
        .context("connect to postgres")?;
    tracing::info!(max_connections = config.max_connections, "postgres pool ready");
    Ok(pool)
}

pub async fn check_ready(pool: &Pool<Postgres>) -> Result<()> {
    sqlx::query("SELECT 1 FROM edge_kv LIMIT 1")
        .execute(pool)
        .await
        .context("edge_kv not reachable")?;
    Ok(())
}
