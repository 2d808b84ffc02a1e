//! Weather providers.
//!
//! The orchestrator depends only on [`WeatherProvider`]; which implementation
//! backs it is decided once at startup from configuration.

mod mock;
mod openweather;

pub use mock::MockWeatherProvider;
pub use openweather::{OpenWeatherConfig, OpenWeatherMapProvider};

use async_trait::async_trait;
use common::models::WeatherSnapshot;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::ProviderError;
use crate::metrics::Metrics;

const PLACEHOLDER_API_KEY: &str = "your_openweathermap_api_key_here";

#[async_trait]
pub trait WeatherProvider: Send + Sync {
    /// Identifier recorded on snapshots and in metrics labels.
    fn name(&self) -> &'static str;

    /// Fetch the current weather for an already normalized city name.
    async fn fetch(&self, city: &str) -> Result<WeatherSnapshot, ProviderError>;
}

/// Build the provider named by `WEATHER_PROVIDER`, falling back to the mock
/// when no usable API key is configured.
pub fn from_config(
    config: &Config,
    metrics: Arc<Metrics>,
) -> Result<Arc<dyn WeatherProvider>, common::errors::AppError> {
    let key_missing = config.openweather_api_key.trim().is_empty()
        || config.openweather_api_key == PLACEHOLDER_API_KEY;

    let use_mock = match config.weather_provider.as_deref() {
        Some("mock") => true,
        Some("openweathermap") => false,
        Some(other) => {
            warn!(provider = %other, "Unknown weather provider, using mock");
            true
        }
        None => key_missing,
    };

    if use_mock {
        info!("Using mock weather provider");
        return Ok(Arc::new(MockWeatherProvider::new()));
    }

    if key_missing {
        warn!("OpenWeatherMap API key not configured");
    }

    let provider = OpenWeatherMapProvider::new(
        OpenWeatherConfig {
            api_key: config.openweather_api_key.clone(),
            base_url: config.openweather_base_url.clone(),
            lang: config.openweather_lang.clone(),
            timeout_secs: config.provider_timeout_seconds,
            max_retries: config.provider_max_retries,
        },
        metrics,
    )?;
    info!(base_url = %config.openweather_base_url, "Using OpenWeatherMap provider");
    Ok(Arc::new(provider))
}
