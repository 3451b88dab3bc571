use anyhow::{Context, Result};
use sqlx::migrate::{Migration, Migrator};
use sqlx::{Pool, Postgres};

static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// Embedded migrations, oldest first.
pub fn migrations() -> impl Iterator<Item = &'static Migration> {
    MIGRATOR.iter()
}

pub async fn run(pool: &Pool<Postgres>) -> Result<()> {
    for migration in migrations() {
        tracing::debug!(
            version = migration.version,
            description = %migration.description,
            "checking migration"
        );
    }
    MIGRATOR
        .run(pool)
        .await
        .context("apply edge_kv migrations")?;
    tracing::info!(known = migrations().count(), "edge_kv schema up to date");
    Ok(())
}
