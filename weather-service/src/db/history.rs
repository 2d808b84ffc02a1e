use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::models::{CityCount, HistoryRecord, UsageReport};
use sqlx::PgPool;

use crate::error::StoreError;
use crate::history::{HistoryKey, HistoryStore, NewHistoryRecord};

#[derive(sqlx::FromRow)]
struct QueryRow {
    id: i64,
    city: String,
    client_ip: String,
    country: Option<String>,
    temperature: f64,
    description: String,
    humidity: Option<i32>,
    pressure: Option<f64>,
    wind_speed: Option<f64>,
    provider: String,
    created_at: DateTime<Utc>,
}

impl From<QueryRow> for HistoryRecord {
    fn from(row: QueryRow) -> Self {
        Self {
            id: row.id,
            city: row.city,
            client_ip: row.client_ip,
            country: row.country,
            temperature: row.temperature,
            description: row.description,
            humidity: row.humidity,
            pressure: row.pressure,
            wind_speed: row.wind_speed,
            provider: row.provider,
            created_at: row.created_at,
        }
    }
}

const COLUMNS: &str = "id, city, client_ip, country, temperature, description, humidity, pressure, wind_speed, provider, created_at";

/// `WHERE` fragment for a key. `$1` is the city and `$2` the client when present.
fn key_filter(key: &HistoryKey) -> &'static str {
    match key {
        HistoryKey::City(_) => "city = $1",
        HistoryKey::CityClient { .. } => "city = $1 AND client_ip = $2",
    }
}

/// Index of the first parameter after the key parameters.
fn next_param(key: &HistoryKey) -> usize {
    match key {
        HistoryKey::City(_) => 2,
        HistoryKey::CityClient { .. } => 3,
    }
}

fn bind_key<'q, O>(
    query: sqlx::query::QueryAs<'q, sqlx::Postgres, O, sqlx::postgres::PgArguments>,
    key: &'q HistoryKey,
) -> sqlx::query::QueryAs<'q, sqlx::Postgres, O, sqlx::postgres::PgArguments> {
    match key {
        HistoryKey::City(city) => query.bind(city),
        HistoryKey::CityClient { city, client_ip } => query.bind(city).bind(client_ip),
    }
}

pub struct PgHistoryStore {
    pool: PgPool,
}

impl PgHistoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HistoryStore for PgHistoryStore {
    async fn append(&self, record: NewHistoryRecord) -> Result<HistoryRecord, StoreError> {
        let snapshot = record.snapshot;
        let row = sqlx::query_as::<_, QueryRow>(&format!(
            r#"
            INSERT INTO weather_queries
                (city, client_ip, country, temperature, description, humidity, pressure, wind_speed, provider)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(&record.city)
        .bind(&record.client_ip)
        .bind(&snapshot.country)
        .bind(snapshot.temperature)
        .bind(&snapshot.description)
        .bind(snapshot.humidity)
        .bind(snapshot.pressure)
        .bind(snapshot.wind_speed)
        .bind(&snapshot.provider)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn list_recent(
        &self,
        key: &HistoryKey,
        limit: usize,
    ) -> Result<Vec<HistoryRecord>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM weather_queries WHERE {} ORDER BY created_at DESC, id DESC LIMIT ${}",
            key_filter(key),
            next_param(key),
        );
        let rows = bind_key(sqlx::query_as::<_, QueryRow>(&sql), key)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(HistoryRecord::from).collect())
    }

    async fn trim_to_last(&self, key: &HistoryKey, limit: usize) -> Result<u64, StoreError> {
        let filter = key_filter(key);
        let sql = format!(
            r#"
            WITH doomed AS (
                DELETE FROM weather_queries
                WHERE {filter} AND id NOT IN (
                    SELECT id FROM weather_queries
                    WHERE {filter}
                    ORDER BY created_at DESC, id DESC
                    LIMIT ${}
                )
                RETURNING id
            )
            SELECT COUNT(*) FROM doomed
            "#,
            next_param(key),
        );
        let (removed,) = bind_key(sqlx::query_as::<_, (i64,)>(&sql), key)
            .bind(limit as i64)
            .fetch_one(&self.pool)
            .await?;

        Ok(removed as u64)
    }

    async fn distinct_cities(&self) -> Result<Vec<String>, StoreError> {
        let cities = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT city FROM weather_queries ORDER BY city",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(cities)
    }

    async fn distinct_city_clients(&self) -> Result<Vec<HistoryKey>, StoreError> {
        let pairs = sqlx::query_as::<_, (String, String)>(
            "SELECT DISTINCT city, client_ip FROM weather_queries",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(pairs
            .into_iter()
            .map(|(city, client_ip)| HistoryKey::CityClient { city, client_ip })
            .collect())
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM weather_queries WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn usage_report(&self, since: DateTime<Utc>) -> Result<UsageReport, StoreError> {
        let (recent, cities, clients, total) = sqlx::query_as::<_, (i64, i64, i64, i64)>(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE created_at >= $1),
                COUNT(DISTINCT city) FILTER (WHERE created_at >= $1),
                COUNT(DISTINCT client_ip) FILTER (WHERE created_at >= $1),
                COUNT(*)
            FROM weather_queries
            "#,
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        let top = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT city, COUNT(*) AS count
            FROM weather_queries
            WHERE created_at >= $1
            GROUP BY city
            ORDER BY count DESC, city
            LIMIT 10
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(UsageReport {
            total_queries_24h: recent as u64,
            unique_cities_24h: cities as u64,
            unique_clients_24h: clients as u64,
            top_cities_24h: top
                .into_iter()
                .map(|(city, count)| CityCount {
                    city,
                    count: count as u64,
                })
                .collect(),
            cache_entries: 0,
            total_queries: total as u64,
        })
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        super::ping(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_bind_key_parameters_first() {
        let city = HistoryKey::City("Recife".into());
        let pair = HistoryKey::city_client("Recife", "10.0.0.1");

        assert_eq!(key_filter(&city), "city = $1");
        assert_eq!(next_param(&city), 2);
        assert_eq!(key_filter(&pair), "city = $1 AND client_ip = $2");
        assert_eq!(next_param(&pair), 3);
    }
}
