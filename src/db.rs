use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::config::Config;

/// Open the shared PostgreSQL pool.
///
/// The pool is lazy: connections are established on first use so that
/// commands which never touch the database (e.g. `--help`) do not require
/// one.
pub fn connect(config: &Config) -> Result<PgPool> {
    connect_dsn(&config.postgres_url)
}

/// Open a pool for an explicit DSN (used by `dbctl --dsn`).
pub fn connect_dsn(dsn: &str) -> Result<PgPool> {
    if dsn.trim().is_empty() {
        anyhow::bail!("postgres DSN must be provided");
    }
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect_lazy(dsn)
        .with_context(|| "Failed to configure database pool")?;
    Ok(pool)
}

/// Connectivity probe used by `fabric dbstatus`.
pub async fn ping(pool: &PgPool) -> Result<()> {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(pool)
        .await
        .with_context(|| "database ping failed")?;
    Ok(())
}
