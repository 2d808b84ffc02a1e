use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::models::{CityCount, HistoryRecord, UsageReport, WeatherSnapshot};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

use crate::error::StoreError;

/// Retention key for history records.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HistoryKey {
    /// All records for a city, across clients.
    City(String),
    /// Records for a city from one client.
    CityClient { city: String, client_ip: String },
}

impl HistoryKey {
    pub fn city_client(city: impl Into<String>, client_ip: impl Into<String>) -> Self {
        Self::CityClient {
            city: city.into(),
            client_ip: client_ip.into(),
        }
    }

    pub fn matches(&self, record: &HistoryRecord) -> bool {
        match self {
            HistoryKey::City(city) => record.city == *city,
            HistoryKey::CityClient { city, client_ip } => {
                record.city == *city && record.client_ip == *client_ip
            }
        }
    }
}

/// A record about to be appended; the store assigns id and creation time.
#[derive(Debug, Clone)]
pub struct NewHistoryRecord {
    pub city: String,
    pub client_ip: String,
    pub snapshot: WeatherSnapshot,
}

/// Append-only log of served queries with bounded retention.
///
/// Ordering is always newest first: creation time descending, then id
/// descending for records created at the same instant.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, record: NewHistoryRecord) -> Result<HistoryRecord, StoreError>;

    async fn list_recent(
        &self,
        key: &HistoryKey,
        limit: usize,
    ) -> Result<Vec<HistoryRecord>, StoreError>;

    /// Delete all but the `limit` newest records for `key`; returns the number removed.
    async fn trim_to_last(&self, key: &HistoryKey, limit: usize) -> Result<u64, StoreError>;

    async fn distinct_cities(&self) -> Result<Vec<String>, StoreError>;

    async fn distinct_city_clients(&self) -> Result<Vec<HistoryKey>, StoreError>;

    /// Delete records created before `cutoff`; returns the number removed.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Aggregate counts since `since`. `cache_entries` is left at zero.
    async fn usage_report(&self, since: DateTime<Utc>) -> Result<UsageReport, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Sort newest first with the id as tie-breaker.
pub(crate) fn newest_first(records: &mut [HistoryRecord]) {
    records.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
}

pub(crate) fn top_cities(counts: HashMap<String, u64>, limit: usize) -> Vec<CityCount> {
    let mut top: Vec<CityCount> = counts
        .into_iter()
        .map(|(city, count)| CityCount { city, count })
        .collect();
    top.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.city.cmp(&b.city)));
    top.truncate(limit);
    top
}

#[derive(Default)]
struct Inner {
    records: Vec<HistoryRecord>,
    next_id: i64,
}

#[derive(Default)]
pub struct InMemoryHistoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append with an explicit creation time.
    pub async fn append_at(
        &self,
        record: NewHistoryRecord,
        created_at: DateTime<Utc>,
    ) -> HistoryRecord {
        let mut inner = self.inner.write().await;
        inner.next_id += 1;
        let snapshot = record.snapshot;
        let stored = HistoryRecord {
            id: inner.next_id,
            city: record.city,
            client_ip: record.client_ip,
            country: snapshot.country,
            temperature: snapshot.temperature,
            description: snapshot.description,
            humidity: snapshot.humidity,
            pressure: snapshot.pressure,
            wind_speed: snapshot.wind_speed,
            provider: snapshot.provider,
            created_at,
        };
        inner.records.push(stored.clone());
        stored
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn append(&self, record: NewHistoryRecord) -> Result<HistoryRecord, StoreError> {
        Ok(self.append_at(record, Utc::now()).await)
    }

    async fn list_recent(
        &self,
        key: &HistoryKey,
        limit: usize,
    ) -> Result<Vec<HistoryRecord>, StoreError> {
        let inner = self.inner.read().await;
        let mut matching: Vec<HistoryRecord> = inner
            .records
            .iter()
            .filter(|r| key.matches(r))
            .cloned()
            .collect();
        newest_first(&mut matching);
        matching.truncate(limit);
        Ok(matching)
    }

    async fn trim_to_last(&self, key: &HistoryKey, limit: usize) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let mut matching: Vec<HistoryRecord> = inner
            .records
            .iter()
            .filter(|r| key.matches(r))
            .cloned()
            .collect();
        if matching.len() <= limit {
            return Ok(0);
        }

        newest_first(&mut matching);
        let doomed: HashSet<i64> = matching[limit..].iter().map(|r| r.id).collect();
        inner.records.retain(|r| !doomed.contains(&r.id));
        Ok(doomed.len() as u64)
    }

    async fn distinct_cities(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().await;
        let mut cities: Vec<String> = inner
            .records
            .iter()
            .map(|r| r.city.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        cities.sort();
        Ok(cities)
    }

    async fn distinct_city_clients(&self) -> Result<Vec<HistoryKey>, StoreError> {
        let inner = self.inner.read().await;
        let keys: HashSet<HistoryKey> = inner
            .records
            .iter()
            .map(|r| HistoryKey::city_client(r.city.clone(), r.client_ip.clone()))
            .collect();
        Ok(keys.into_iter().collect())
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let before = inner.records.len();
        inner.records.retain(|r| r.created_at >= cutoff);
        Ok((before - inner.records.len()) as u64)
    }

    async fn usage_report(&self, since: DateTime<Utc>) -> Result<UsageReport, StoreError> {
        let inner = self.inner.read().await;
        let recent: Vec<&HistoryRecord> = inner
            .records
            .iter()
            .filter(|r| r.created_at >= since)
            .collect();

        let mut per_city: HashMap<String, u64> = HashMap::new();
        for record in &recent {
            *per_city.entry(record.city.clone()).or_default() += 1;
        }
        let clients: HashSet<&str> = recent.iter().map(|r| r.client_ip.as_str()).collect();

        Ok(UsageReport {
            total_queries_24h: recent.len() as u64,
            unique_cities_24h: per_city.len() as u64,
            unique_clients_24h: clients.len() as u64,
            top_cities_24h: top_cities(per_city, 10),
            cache_entries: 0,
            total_queries: inner.records.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn new_record(city: &str, client_ip: &str, temperature: f64) -> NewHistoryRecord {
        NewHistoryRecord {
            city: city.to_string(),
            client_ip: client_ip.to_string(),
            snapshot: WeatherSnapshot {
                city: city.to_string(),
                country: Some("BR".to_string()),
                temperature,
                description: "Sunny".to_string(),
                humidity: Some(60),
                pressure: Some(1013.25),
                wind_speed: Some(5.5),
                provider: "mock".to_string(),
                cached: false,
                timestamp: Utc::now(),
            },
        }
    }

    #[tokio::test]
    async fn lists_newest_first_with_limit() {
        let store = InMemoryHistoryStore::new();
        let base = Utc::now();
        for i in 0..5 {
            store
                .append_at(
                    new_record("Recife", "10.0.0.1", i as f64),
                    base + Duration::seconds(i),
                )
                .await;
        }

        let key = HistoryKey::city_client("Recife", "10.0.0.1");
        let recent = store.list_recent(&key, 3).await.unwrap();
        let temps: Vec<f64> = recent.iter().map(|r| r.temperature).collect();
        assert_eq!(temps, vec![4.0, 3.0, 2.0]);
    }

    #[tokio::test]
    async fn trim_keeps_newest_and_breaks_ties_by_id() {
        let store = InMemoryHistoryStore::new();
        let same_instant = Utc::now();
        for i in 0..12 {
            store
                .append_at(new_record("Recife", "10.0.0.1", i as f64), same_instant)
                .await;
        }

        let key = HistoryKey::city_client("Recife", "10.0.0.1");
        assert_eq!(store.trim_to_last(&key, 10).await.unwrap(), 2);

        let kept = store.list_recent(&key, 50).await.unwrap();
        assert_eq!(kept.len(), 10);
        assert_eq!(kept.first().unwrap().temperature, 11.0);
        assert_eq!(kept.last().unwrap().temperature, 2.0);

        assert_eq!(store.trim_to_last(&key, 10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn client_trim_leaves_other_clients_alone() {
        let store = InMemoryHistoryStore::new();
        for i in 0..3 {
            store.append(new_record("Recife", "10.0.0.1", i as f64)).await.unwrap();
            store.append(new_record("Recife", "10.0.0.2", i as f64)).await.unwrap();
        }

        let removed = store
            .trim_to_last(&HistoryKey::city_client("Recife", "10.0.0.1"), 1)
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(
            store
                .list_recent(&HistoryKey::City("Recife".into()), 50)
                .await
                .unwrap()
                .len(),
            4
        );
    }

    #[tokio::test]
    async fn purge_and_usage_report() {
        let store = InMemoryHistoryStore::new();
        let now = Utc::now();
        store
            .append_at(new_record("Recife", "10.0.0.1", 1.0), now - Duration::days(40))
            .await;
        store.append_at(new_record("Recife", "10.0.0.1", 2.0), now).await;
        store.append_at(new_record("Recife", "10.0.0.2", 3.0), now).await;
        store.append_at(new_record("Natal", "10.0.0.2", 4.0), now).await;

        let report = store.usage_report(now - Duration::hours(24)).await.unwrap();
        assert_eq!(report.total_queries_24h, 3);
        assert_eq!(report.unique_cities_24h, 2);
        assert_eq!(report.unique_clients_24h, 2);
        assert_eq!(report.top_cities_24h[0].city, "Recife");
        assert_eq!(report.top_cities_24h[0].count, 2);
        assert_eq!(report.total_queries, 4);

        assert_eq!(
            store.purge_older_than(now - Duration::days(30)).await.unwrap(),
            1
        );
        assert_eq!(store.len().await, 3);
        assert_eq!(store.distinct_cities().await.unwrap(), vec!["Natal", "Recife"]);
        assert_eq!(store.distinct_city_clients().await.unwrap().len(), 3);
    }
}
