use async_trait::async_trait;
use common::models::WeatherSnapshot;
use sqlx::PgPool;
use std::time::Duration;
use tracing::debug;

use crate::cache::TtlCache;
use crate::error::StoreError;

/// Persistent cache in the `weather_cache` table.
///
/// Expired rows are invisible to `get` and removed when read; the sweeper
/// deletes the rest through [`TtlCache::purge_expired`].
pub struct PgTtlCache {
    pool: PgPool,
    max_ttl: Duration,
}

impl PgTtlCache {
    pub fn new(pool: PgPool, max_ttl_seconds: u64) -> Self {
        Self {
            pool,
            max_ttl: Duration::from_secs(max_ttl_seconds),
        }
    }
}

#[async_trait]
impl TtlCache for PgTtlCache {
    async fn get(&self, key: &str) -> Result<Option<WeatherSnapshot>, StoreError> {
        let row = sqlx::query_as::<_, (String, bool)>(
            r#"
            SELECT data, expires_at <= NOW() AS expired
            FROM weather_cache
            WHERE city = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((data, false)) => Ok(Some(serde_json::from_str(&data)?)),
            Some((_, true)) => {
                debug!(city = %key, "Removing expired cache row");
                sqlx::query("DELETE FROM weather_cache WHERE city = $1 AND expires_at <= NOW()")
                    .bind(key)
                    .execute(&self.pool)
                    .await?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: &WeatherSnapshot,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let data = serde_json::to_string(value)?;
        let ttl_secs = ttl.min(self.max_ttl).as_secs_f64();

        sqlx::query(
            r#"
            INSERT INTO weather_cache (city, data, created_at, expires_at)
            VALUES ($1, $2, NOW(), NOW() + make_interval(secs => $3))
            ON CONFLICT (city) DO UPDATE
                SET data = EXCLUDED.data,
                    created_at = EXCLUDED.created_at,
                    expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(data)
        .bind(ttl_secs)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM weather_cache WHERE city = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM weather_cache WHERE expires_at < NOW()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn entry_count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM weather_cache")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        super::ping(&self.pool).await?;
        Ok(())
    }
}
