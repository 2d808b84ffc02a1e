use common::tracing::LogFormat;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Where weather snapshots are cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheBackend {
    #[default]
    Memory,
    Postgres,
    /// In-memory front checked against Postgres on every read.
    Layered,
}

impl FromStr for CacheBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "postgres" | "database" => Ok(Self::Postgres),
            "layered" => Ok(Self::Layered),
            other => Err(format!("unknown cache backend: {}", other)),
        }
    }
}

pub struct Config {
    pub port: u16,
    pub database_url: Option<String>,
    pub cache_backend: CacheBackend,
    pub log_format: LogFormat,

    pub weather_provider: Option<String>,
    pub openweather_api_key: String,
    pub openweather_base_url: String,
    pub openweather_lang: String,
    pub provider_timeout_seconds: u64,
    pub provider_max_retries: u32,

    /// Upper bound on any cache entry's lifetime.
    pub cache_ttl_seconds: u64,
    /// TTL requested when caching a fresh snapshot.
    pub cache_freshness_seconds: u64,
    pub history_limit: usize,
    pub history_retention_days: i64,

    pub rate_limit_enabled: bool,
    pub rate_limit_requests: u32,
    pub rate_limit_window_seconds: u64,

    pub history_sweep_interval_seconds: u64,
    pub client_history_sweep_interval_seconds: u64,
    pub cache_purge_interval_seconds: u64,
    pub stale_purge_interval_seconds: u64,
    pub metrics_rollup_interval_seconds: u64,
}

fn parsed<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn non_empty(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

/// Cache shared through the database when one is configured, process-local otherwise.
fn default_cache_backend(database_url: Option<&str>) -> CacheBackend {
    if database_url.is_some() {
        CacheBackend::Postgres
    } else {
        CacheBackend::Memory
    }
}

impl Config {
    pub fn from_env() -> Self {
        let database_url = non_empty("DATABASE_URL");
        let cache_backend = parsed(
            "CACHE_BACKEND",
            default_cache_backend(database_url.as_deref()),
        );

        Self {
            port: parsed("PORT", 8000),
            database_url,
            cache_backend,
            log_format: parsed("LOG_FORMAT", LogFormat::Pretty),

            weather_provider: non_empty("WEATHER_PROVIDER").map(|p| p.to_ascii_lowercase()),
            openweather_api_key: env::var("OPENWEATHER_API_KEY").unwrap_or_default(),
            openweather_base_url: env::var("OPENWEATHER_BASE_URL")
                .unwrap_or_else(|_| "https://api.openweathermap.org/data/2.5".to_string()),
            openweather_lang: env::var("OPENWEATHER_LANG").unwrap_or_else(|_| "en".to_string()),
            provider_timeout_seconds: parsed("PROVIDER_TIMEOUT_SECONDS", 10),
            provider_max_retries: parsed("PROVIDER_MAX_RETRIES", 1),

            cache_ttl_seconds: parsed("CACHE_TTL_SECONDS", 600), // 10 minutes
            cache_freshness_seconds: parsed("CACHE_FRESHNESS_SECONDS", 60),
            history_limit: parsed("HISTORY_LIMIT", 10),
            history_retention_days: parsed("HISTORY_RETENTION_DAYS", 30),

            rate_limit_enabled: flag("RATE_LIMIT_ENABLED", true),
            rate_limit_requests: parsed("RATE_LIMIT_REQUESTS", 5),
            rate_limit_window_seconds: parsed("RATE_LIMIT_WINDOW", 60),

            history_sweep_interval_seconds: parsed("HISTORY_SWEEP_INTERVAL_SECONDS", 60),
            client_history_sweep_interval_seconds: parsed(
                "CLIENT_HISTORY_SWEEP_INTERVAL_SECONDS",
                3600,
            ),
            cache_purge_interval_seconds: parsed("CACHE_PURGE_INTERVAL_SECONDS", 1800),
            stale_purge_interval_seconds: parsed("STALE_PURGE_INTERVAL_SECONDS", 86400),
            metrics_rollup_interval_seconds: parsed("METRICS_ROLLUP_INTERVAL_SECONDS", 300),
        }
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_backend_names() {
        assert_eq!("memory".parse(), Ok(CacheBackend::Memory));
        assert_eq!(" Postgres ".parse(), Ok(CacheBackend::Postgres));
        assert_eq!("layered".parse(), Ok(CacheBackend::Layered));
        assert!("redis".parse::<CacheBackend>().is_err());
    }

    #[test]
    fn database_url_makes_the_cache_shared_by_default() {
        assert_eq!(
            default_cache_backend(Some("postgres://localhost/weather")),
            CacheBackend::Postgres
        );
        assert_eq!(default_cache_backend(None), CacheBackend::Memory);
    }

    #[test]
    fn unset_variables_fall_back_to_defaults() {
        assert_eq!(parsed("WEATHER_SERVICE_TEST_UNSET_NUMBER", 42u64), 42);
        assert!(flag("WEATHER_SERVICE_TEST_UNSET_FLAG", true));
        assert_eq!(non_empty("WEATHER_SERVICE_TEST_UNSET_STRING"), None);
    }
}
