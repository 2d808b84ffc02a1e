//! Prometheus metrics for the weather service.
//!
//! A single [`Metrics`] value owns its registry and is passed explicitly to
//! every component that records something.

use common::errors::AppError;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

pub struct Metrics {
    registry: Registry,
    pub weather_requests: IntCounterVec,
    pub cache_hits: IntCounter,
    pub cache_misses: IntCounter,
    pub request_duration: HistogramVec,
    pub provider_requests: IntCounterVec,
    pub provider_duration: HistogramVec,
    pub rate_limit_blocked: IntCounter,
    pub history_records_trimmed: IntCounter,
    pub cache_entries_purged: IntCounter,
    pub store_errors: IntCounterVec,
    pub queries_last_24h: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let weather_requests = IntCounterVec::new(
            Opts::new(
                "weather_service_requests_total",
                "Total number of weather requests",
            ),
            &["cached"],
        )?;
        let cache_hits = IntCounter::new(
            "weather_service_cache_hits_total",
            "Total number of cache hits",
        )?;
        let cache_misses = IntCounter::new(
            "weather_service_cache_misses_total",
            "Total number of cache misses",
        )?;
        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "weather_service_request_duration_seconds",
                "Duration of weather requests",
            ),
            &["cached"],
        )?;
        let provider_requests = IntCounterVec::new(
            Opts::new(
                "weather_service_external_api_requests_total",
                "Total number of external API requests",
            ),
            &["provider", "status"],
        )?;
        let provider_duration = HistogramVec::new(
            HistogramOpts::new(
                "weather_service_external_api_duration_seconds",
                "Duration of external API requests",
            ),
            &["provider"],
        )?;
        let rate_limit_blocked = IntCounter::new(
            "weather_service_rate_limit_blocked_total",
            "Total number of requests blocked by rate limiting",
        )?;
        let history_records_trimmed = IntCounter::new(
            "weather_service_history_records_trimmed_total",
            "Total number of history records removed by retention",
        )?;
        let cache_entries_purged = IntCounter::new(
            "weather_service_cache_entries_purged_total",
            "Total number of expired cache entries purged",
        )?;
        let store_errors = IntCounterVec::new(
            Opts::new(
                "weather_service_store_errors_total",
                "Store operations that failed and were recovered locally",
            ),
            &["store", "operation"],
        )?;
        let queries_last_24h = IntGauge::new(
            "weather_service_queries_last_24h",
            "Weather queries recorded in the last 24 hours at the latest rollup",
        )?;

        registry.register(Box::new(weather_requests.clone()))?;
        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(cache_misses.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(provider_requests.clone()))?;
        registry.register(Box::new(provider_duration.clone()))?;
        registry.register(Box::new(rate_limit_blocked.clone()))?;
        registry.register(Box::new(history_records_trimmed.clone()))?;
        registry.register(Box::new(cache_entries_purged.clone()))?;
        registry.register(Box::new(store_errors.clone()))?;
        registry.register(Box::new(queries_last_24h.clone()))?;

        Ok(Self {
            registry,
            weather_requests,
            cache_hits,
            cache_misses,
            request_duration,
            provider_requests,
            provider_duration,
            rate_limit_blocked,
            history_records_trimmed,
            cache_entries_purged,
            store_errors,
            queries_last_24h,
        })
    }

    pub fn store_error(&self, store: &str, operation: &str) {
        self.store_errors.with_label_values(&[store, operation]).inc();
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String, AppError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| AppError::internal(format!("Failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer)
            .map_err(|e| AppError::internal(format!("Metrics are not valid UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_registered_counters() {
        let metrics = Metrics::new().expect("metrics");
        metrics.cache_hits.inc();
        metrics.store_error("history", "append");

        let text = metrics.render().expect("render");
        assert!(text.contains("weather_service_cache_hits_total 1"));
        assert!(text.contains("weather_service_store_errors_total"));
    }
}
