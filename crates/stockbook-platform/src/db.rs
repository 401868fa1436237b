use anyhow::{Context, Result};
use sqlx::{PgPool, postgres::PgPoolOptions};

const INIT_SCHEMA: &str = include_str!("../../../migrations/0001_init.sql");

pub async fn connect_database(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;

    Ok(pool)
}

/// Creates any missing ledger tables. Every statement is idempotent.
pub async fn apply_migrations(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(INIT_SCHEMA)
        .execute(pool)
        .await
        .context("failed to apply ledger schema")?;
    Ok(())
}
