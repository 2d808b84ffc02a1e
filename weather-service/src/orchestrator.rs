use chrono::Utc;
use common::models::{HistoryResponse, WeatherSnapshot};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{error, info, instrument, warn};

use crate::cache::TtlCache;
use crate::city::normalize_city;
use crate::error::{ProviderError, WeatherError};
use crate::history::{HistoryKey, HistoryStore, NewHistoryRecord};
use crate::metrics::Metrics;
use crate::provider::WeatherProvider;

pub const DEFAULT_HISTORY_LIMIT: usize = 10;
pub const MAX_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// TTL requested for freshly fetched snapshots.
    pub cache_ttl: Duration,
    /// Records kept per (city, client) after each fetch.
    pub history_limit: usize,
    pub provider_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(60),
            history_limit: DEFAULT_HISTORY_LIMIT,
            provider_timeout: Duration::from_secs(10),
        }
    }
}

/// Clamp a requested history page size. Missing values fall back to the default.
pub fn clamp_history_limit(requested: Option<i64>) -> usize {
    match requested {
        Some(n) => n.clamp(1, MAX_HISTORY_LIMIT as i64) as usize,
        None => DEFAULT_HISTORY_LIMIT,
    }
}

/// Cache-aside weather lookups with history recording.
pub struct WeatherOrchestrator {
    provider: Arc<dyn WeatherProvider>,
    cache: Arc<dyn TtlCache>,
    history: Arc<dyn HistoryStore>,
    metrics: Arc<Metrics>,
    settings: OrchestratorSettings,
}

impl WeatherOrchestrator {
    pub fn new(
        provider: Arc<dyn WeatherProvider>,
        cache: Arc<dyn TtlCache>,
        history: Arc<dyn HistoryStore>,
        metrics: Arc<Metrics>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            provider,
            cache,
            history,
            metrics,
            settings,
        }
    }

    #[instrument(skip(self), fields(provider = self.provider.name()))]
    pub async fn get_weather(
        &self,
        city: &str,
        client_ip: &str,
    ) -> Result<WeatherSnapshot, WeatherError> {
        let city = normalize_city(city).ok_or(WeatherError::InvalidCity)?;
        info!(city = %city, client_ip = %client_ip, "Getting weather");

        let started = Instant::now();
        let cached = match self.cache.get(&city).await {
            Ok(hit) => hit,
            Err(e) => {
                self.metrics.store_error("cache", "get");
                warn!(city = %city, error = %e, "Cache read failed, treating as miss");
                None
            }
        };

        if let Some(snapshot) = cached {
            self.metrics.cache_hits.inc();
            self.metrics.weather_requests.with_label_values(&["true"]).inc();
            self.metrics
                .request_duration
                .with_label_values(&["true"])
                .observe(started.elapsed().as_secs_f64());
            info!(city = %city, "Cache hit");
            return Ok(snapshot.served(true, Utc::now()));
        }

        self.metrics.cache_misses.inc();
        info!(city = %city, "Cache miss, fetching from provider");

        let snapshot = self.fetch_from_provider(&city).await;
        self.metrics
            .request_duration
            .with_label_values(&["false"])
            .observe(started.elapsed().as_secs_f64());
        let snapshot = snapshot?;
        self.metrics.weather_requests.with_label_values(&["false"]).inc();

        if let Err(e) = self
            .cache
            .set(&city, &snapshot, self.settings.cache_ttl)
            .await
        {
            self.metrics.store_error("cache", "set");
            error!(city = %city, error = %e, "Failed to cache weather data");
        }

        self.record_history(&city, client_ip, &snapshot).await;

        info!(city = %city, "Retrieved and cached weather data");
        Ok(snapshot.served(false, Utc::now()))
    }

    async fn fetch_from_provider(&self, city: &str) -> Result<WeatherSnapshot, WeatherError> {
        let result = timeout(self.settings.provider_timeout, self.provider.fetch(city))
            .await
            .map_err(|_| {
                ProviderError::Connection(format!(
                    "weather fetch for {} timed out after {}s",
                    city,
                    self.settings.provider_timeout.as_secs()
                ))
            })
            .and_then(|inner| inner);

        result.map_err(|e| {
            warn!(city = %city, error = %e, "Weather provider error");
            WeatherError::Provider(e)
        })
    }

    /// Append to history and trim the (city, client) log. Failures are logged only.
    async fn record_history(&self, city: &str, client_ip: &str, snapshot: &WeatherSnapshot) {
        let record = NewHistoryRecord {
            city: city.to_string(),
            client_ip: client_ip.to_string(),
            snapshot: snapshot.clone(),
        };

        if let Err(e) = self.history.append(record).await {
            self.metrics.store_error("history", "append");
            error!(city = %city, client_ip = %client_ip, error = %e, "Error saving weather query to history");
            return;
        }

        let key = HistoryKey::city_client(city, client_ip);
        match self
            .history
            .trim_to_last(&key, self.settings.history_limit)
            .await
        {
            Ok(removed) if removed > 0 => {
                self.metrics.history_records_trimmed.inc_by(removed);
                info!(city = %city, client_ip = %client_ip, removed, "Trimmed query history");
            }
            Ok(_) => {}
            Err(e) => {
                self.metrics.store_error("history", "trim");
                error!(city = %city, client_ip = %client_ip, error = %e, "Error cleaning up old queries");
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn get_history(
        &self,
        city: &str,
        client_ip: &str,
        limit: Option<i64>,
    ) -> Result<HistoryResponse, WeatherError> {
        let city = normalize_city(city).ok_or(WeatherError::InvalidCity)?;
        let limit = clamp_history_limit(limit);
        info!(city = %city, client_ip = %client_ip, limit, "Getting weather history");

        let key = HistoryKey::city_client(city.clone(), client_ip);
        let queries = match self.history.list_recent(&key, limit).await {
            Ok(queries) => queries,
            Err(e) => {
                self.metrics.store_error("history", "list");
                error!(city = %city, error = %e, "Error getting weather history");
                Vec::new()
            }
        };

        Ok(HistoryResponse {
            total: queries.len(),
            city,
            queries,
            limit,
        })
    }

    #[instrument(skip(self))]
    pub async fn invalidate_cache(&self, city: &str) -> Result<String, WeatherError> {
        let city = normalize_city(city).ok_or(WeatherError::InvalidCity)?;

        match self.cache.delete(&city).await {
            Ok(()) => info!(city = %city, "Cache invalidated"),
            Err(e) => {
                self.metrics.store_error("cache", "delete");
                error!(city = %city, error = %e, "Error invalidating cache");
            }
        }

        Ok(city)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryTtlCache;
    use crate::error::StoreError;
    use crate::history::InMemoryHistoryStore;
    use crate::provider::MockWeatherProvider;
    use async_trait::async_trait;
    use chrono::DateTime;
    use common::models::{HistoryRecord, UsageReport};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Mock provider that counts calls and varies temperature per call.
    #[derive(Default)]
    struct CountingProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl WeatherProvider for CountingProvider {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn fetch(&self, city: &str) -> Result<WeatherSnapshot, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let mut snapshot = MockWeatherProvider::new().fetch(city).await?;
            snapshot.temperature = 20.0 + call as f64;
            Ok(snapshot)
        }
    }

    struct SlowProvider;

    #[async_trait]
    impl WeatherProvider for SlowProvider {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn fetch(&self, city: &str) -> Result<WeatherSnapshot, ProviderError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            MockWeatherProvider::new().fetch(city).await
        }
    }

    struct FailingCache;

    #[async_trait]
    impl TtlCache for FailingCache {
        async fn get(&self, _key: &str) -> Result<Option<WeatherSnapshot>, StoreError> {
            Err(StoreError::Database(sqlx::Error::PoolTimedOut))
        }

        async fn set(
            &self,
            _key: &str,
            _value: &WeatherSnapshot,
            _ttl: Duration,
        ) -> Result<(), StoreError> {
            Err(StoreError::Database(sqlx::Error::PoolTimedOut))
        }

        async fn delete(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Database(sqlx::Error::PoolTimedOut))
        }

        async fn purge_expired(&self) -> Result<u64, StoreError> {
            Ok(0)
        }

        async fn entry_count(&self) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    struct FailingHistory;

    #[async_trait]
    impl HistoryStore for FailingHistory {
        async fn append(&self, _record: NewHistoryRecord) -> Result<HistoryRecord, StoreError> {
            Err(StoreError::Database(sqlx::Error::PoolClosed))
        }

        async fn list_recent(
            &self,
            _key: &HistoryKey,
            _limit: usize,
        ) -> Result<Vec<HistoryRecord>, StoreError> {
            Err(StoreError::Database(sqlx::Error::PoolClosed))
        }

        async fn trim_to_last(&self, _key: &HistoryKey, _limit: usize) -> Result<u64, StoreError> {
            Err(StoreError::Database(sqlx::Error::PoolClosed))
        }

        async fn distinct_cities(&self) -> Result<Vec<String>, StoreError> {
            Ok(Vec::new())
        }

        async fn distinct_city_clients(&self) -> Result<Vec<HistoryKey>, StoreError> {
            Ok(Vec::new())
        }

        async fn purge_older_than(&self, _cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
            Ok(0)
        }

        async fn usage_report(&self, _since: DateTime<Utc>) -> Result<UsageReport, StoreError> {
            Ok(UsageReport::default())
        }
    }

    struct Fixture {
        orchestrator: WeatherOrchestrator,
        provider: Arc<CountingProvider>,
        history: Arc<InMemoryHistoryStore>,
        metrics: Arc<Metrics>,
    }

    fn fixture(cache_ttl_secs: u64) -> Fixture {
        let provider = Arc::new(CountingProvider::default());
        let history = Arc::new(InMemoryHistoryStore::new());
        let metrics = Arc::new(Metrics::new().expect("metrics"));
        let orchestrator = WeatherOrchestrator::new(
            provider.clone(),
            Arc::new(InMemoryTtlCache::with_ttl(600)),
            history.clone(),
            metrics.clone(),
            OrchestratorSettings {
                cache_ttl: Duration::from_secs(cache_ttl_secs),
                ..OrchestratorSettings::default()
            },
        );
        Fixture {
            orchestrator,
            provider,
            history,
            metrics,
        }
    }

    #[tokio::test]
    async fn second_call_within_ttl_is_served_from_cache() {
        let f = fixture(600);

        let first = f.orchestrator.get_weather("São Paulo", "1.2.3.4").await.unwrap();
        let second = f.orchestrator.get_weather("São Paulo", "1.2.3.4").await.unwrap();

        assert!(!first.cached);
        assert!(second.cached);
        assert!(first.same_weather(&second));
        assert_eq!(first.temperature, second.temperature);
        assert!(second.timestamp >= first.timestamp);
        assert_eq!(f.provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.metrics.cache_hits.get(), 1);
        assert_eq!(f.metrics.cache_misses.get(), 1);
    }

    #[tokio::test]
    async fn cache_hits_do_not_write_history() {
        let f = fixture(600);

        for _ in 0..3 {
            f.orchestrator.get_weather("Recife", "1.2.3.4").await.unwrap();
        }

        assert_eq!(f.history.len().await, 1);
    }

    #[tokio::test]
    async fn city_spellings_share_cache_and_history() {
        let f = fixture(600);

        f.orchestrator.get_weather("são paulo", "1.2.3.4").await.unwrap();
        let hit = f.orchestrator.get_weather(" SÃO PAULO ", "1.2.3.4").await.unwrap();
        assert!(hit.cached);

        let history = f
            .orchestrator
            .get_history("  são   paulo", "1.2.3.4", None)
            .await
            .unwrap();
        assert_eq!(history.city, "São Paulo");
        assert_eq!(history.total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn history_keeps_ten_most_recent_per_client() {
        let f = fixture(1);

        for _ in 0..13 {
            f.orchestrator.get_weather("Recife", "1.2.3.4").await.unwrap();
            tokio::time::advance(Duration::from_secs(2)).await;
        }
        f.orchestrator.get_weather("Recife", "5.6.7.8").await.unwrap();

        let history = f
            .orchestrator
            .get_history("Recife", "1.2.3.4", Some(50))
            .await
            .unwrap();
        assert_eq!(history.total, 10);
        assert_eq!(history.limit, 50);
        let temps: Vec<f64> = history.queries.iter().map(|q| q.temperature).collect();
        let expected: Vec<f64> = (3..13).rev().map(|i| 20.0 + i as f64).collect();
        assert_eq!(temps, expected);

        let other = f
            .orchestrator
            .get_history("Recife", "5.6.7.8", None)
            .await
            .unwrap();
        assert_eq!(other.total, 1);
    }

    #[tokio::test]
    async fn invalidation_is_idempotent_and_forces_a_miss() {
        let f = fixture(600);

        assert_eq!(
            f.orchestrator.invalidate_cache("lisbon").await.unwrap(),
            "Lisbon"
        );

        f.orchestrator.get_weather("Lisbon", "1.2.3.4").await.unwrap();
        f.orchestrator.invalidate_cache("LISBON").await.unwrap();
        let after = f.orchestrator.get_weather("Lisbon", "1.2.3.4").await.unwrap();

        assert!(!after.cached);
        assert_eq!(f.provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn provider_not_found_propagates() {
        let f = fixture(600);

        let err = f
            .orchestrator
            .get_weather("notfound", "1.2.3.4")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WeatherError::Provider(ProviderError::CityNotFound(_))
        ));
        assert!(f.history.is_empty().await);
    }

    #[tokio::test]
    async fn blank_city_is_rejected() {
        let f = fixture(600);

        assert!(matches!(
            f.orchestrator.get_weather("   ", "1.2.3.4").await,
            Err(WeatherError::InvalidCity)
        ));
        assert_eq!(f.provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_provider_times_out_as_connection_error() {
        let orchestrator = WeatherOrchestrator::new(
            Arc::new(SlowProvider),
            Arc::new(InMemoryTtlCache::with_ttl(600)),
            Arc::new(InMemoryHistoryStore::new()),
            Arc::new(Metrics::new().expect("metrics")),
            OrchestratorSettings::default(),
        );

        let err = orchestrator.get_weather("Recife", "1.2.3.4").await.unwrap_err();
        assert!(matches!(
            err,
            WeatherError::Provider(ProviderError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn store_failures_do_not_fail_requests() {
        let metrics = Arc::new(Metrics::new().expect("metrics"));
        let orchestrator = WeatherOrchestrator::new(
            Arc::new(MockWeatherProvider::new()),
            Arc::new(FailingCache),
            Arc::new(FailingHistory),
            metrics.clone(),
            OrchestratorSettings::default(),
        );

        let snapshot = orchestrator.get_weather("Recife", "1.2.3.4").await.unwrap();
        assert!(!snapshot.cached);

        let history = orchestrator.get_history("Recife", "1.2.3.4", None).await.unwrap();
        assert!(history.queries.is_empty());

        orchestrator.invalidate_cache("Recife").await.unwrap();

        for (store, op) in [
            ("cache", "get"),
            ("cache", "set"),
            ("cache", "delete"),
            ("history", "append"),
            ("history", "list"),
        ] {
            assert_eq!(
                metrics.store_errors.with_label_values(&[store, op]).get(),
                1,
                "{store}/{op}"
            );
        }
    }

    #[test]
    fn history_limit_is_clamped() {
        assert_eq!(clamp_history_limit(None), 10);
        assert_eq!(clamp_history_limit(Some(0)), 1);
        assert_eq!(clamp_history_limit(Some(-3)), 1);
        assert_eq!(clamp_history_limit(Some(25)), 25);
        assert_eq!(clamp_history_limit(Some(500)), 50);
    }
}
