//! Postgres-backed stores shared by every service instance.

pub mod cache;
pub mod counters;
pub mod history;
pub mod migrations;

pub use cache::PgTtlCache;
pub use counters::PgCounterStore;
pub use history::PgHistoryStore;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    migrations::run_migrations(&pool).await?;

    Ok(pool)
}

pub async fn ping(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}
