use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// Initialize a connection pool to the PostgreSQL database
///
/// # Connection Limits
/// - Production default: 10 connections
/// - `DB_MAX_CONNECTIONS` / `DB_MIN_CONNECTIONS` override (tests use 1-2)
/// - `DB_ACQUIRE_TIMEOUT_SECS` overrides the 3s acquire timeout
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let max_connections = env_or("DB_MAX_CONNECTIONS", 10u32);
    let min_connections = env_or("DB_MIN_CONNECTIONS", 0u32);
    let acquire_timeout_secs = env_or("DB_ACQUIRE_TIMEOUT_SECS", 3u64);

    PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(min_connections)
        .acquire_timeout(Duration::from_secs(acquire_timeout_secs))
        .connect(database_url)
        .await
}

/// Apply the outbox schema
///
/// Consumer crates share the `_sqlx_migrations` table, so versions applied by
/// them are not treated as missing here.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator.run(pool).await
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}
