use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;

use crate::error::StoreError;
use crate::rate_limit::{CounterStore, WindowState};

/// Rate limit counters in `rate_limit_counters`, shared by all instances.
///
/// The increment is one statement so concurrent requests from the same client
/// on different instances cannot both slip under the limit.
pub struct PgCounterStore {
    pool: PgPool,
}

impl PgCounterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CounterStore for PgCounterStore {
    async fn increment_below(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<WindowState, StoreError> {
        let admitted = sqlx::query_as::<_, (i32, f64)>(
            r#"
            INSERT INTO rate_limit_counters AS c (key, count, expires_at)
            VALUES ($1, 1, NOW() + make_interval(secs => $3))
            ON CONFLICT (key) DO UPDATE
                SET count = CASE WHEN c.expires_at <= NOW() THEN 1 ELSE c.count + 1 END,
                    expires_at = CASE WHEN c.expires_at <= NOW() THEN EXCLUDED.expires_at ELSE c.expires_at END
                WHERE c.expires_at <= NOW() OR c.count < $2
            RETURNING count, GREATEST(EXTRACT(EPOCH FROM (expires_at - NOW())), 0)::DOUBLE PRECISION
            "#,
        )
        .bind(key)
        .bind(limit as i32)
        .bind(window.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        if let Some((count, remaining)) = admitted {
            return Ok(WindowState {
                admitted: true,
                count: count.max(0) as u32,
                resets_in: Duration::from_secs_f64(remaining),
            });
        }

        let (count, remaining) = sqlx::query_as::<_, (i32, f64)>(
            r#"
            SELECT count, GREATEST(EXTRACT(EPOCH FROM (expires_at - NOW())), 0)::DOUBLE PRECISION
            FROM rate_limit_counters
            WHERE key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?
        .unwrap_or((limit as i32, window.as_secs_f64()));

        Ok(WindowState {
            admitted: false,
            count: count.max(0) as u32,
            resets_in: Duration::from_secs_f64(remaining),
        })
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM rate_limit_counters WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        super::ping(&self.pool).await?;
        Ok(())
    }
}
