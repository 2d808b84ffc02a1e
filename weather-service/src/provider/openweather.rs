use async_trait::async_trait;
use chrono::Utc;
use common::errors::AppError;
use common::http_client::HttpClient;
use common::models::WeatherSnapshot;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info, instrument};

use super::WeatherProvider;
use crate::city::normalize_city;
use crate::error::ProviderError;
use crate::metrics::Metrics;

const PROVIDER_NAME: &str = "openweathermap";

#[derive(Debug, Deserialize)]
struct OpenWeatherResponse {
    name: String,
    #[serde(default)]
    sys: Option<Sys>,
    main: Main,
    weather: Vec<Condition>,
    #[serde(default)]
    wind: Option<Wind>,
}

#[derive(Debug, Deserialize)]
struct Sys {
    country: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Main {
    temp: f64,
    humidity: Option<i32>,
    pressure: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Condition {
    description: String,
}

#[derive(Debug, Deserialize)]
struct Wind {
    speed: Option<f64>,
}

pub struct OpenWeatherConfig {
    pub api_key: String,
    pub base_url: String,
    pub lang: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

pub struct OpenWeatherMapProvider {
    http_client: HttpClient,
    config: OpenWeatherConfig,
    metrics: Arc<Metrics>,
}

impl OpenWeatherMapProvider {
    pub fn new(config: OpenWeatherConfig, metrics: Arc<Metrics>) -> Result<Self, AppError> {
        Ok(Self {
            http_client: HttpClient::new(config.timeout_secs, config.max_retries)?,
            config,
            metrics,
        })
    }

    async fn request(&self, city: &str) -> Result<WeatherSnapshot, ProviderError> {
        if self.config.api_key.trim().is_empty() {
            return Err(ProviderError::NotConfigured);
        }

        let url = format!("{}/weather", self.config.base_url.trim_end_matches('/'));
        let params = [
            ("q", city),
            ("appid", self.config.api_key.as_str()),
            ("units", "metric"),
            ("lang", self.config.lang.as_str()),
        ];

        let response: OpenWeatherResponse = self
            .http_client
            .get_json_with_query(&url, &params)
            .await
            .map_err(|e| map_http_error(e, city))?;

        normalize(response)
    }
}

#[async_trait]
impl WeatherProvider for OpenWeatherMapProvider {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    #[instrument(skip(self), fields(provider = PROVIDER_NAME))]
    async fn fetch(&self, city: &str) -> Result<WeatherSnapshot, ProviderError> {
        info!(city = %city, "Fetching weather data from OpenWeatherMap");

        let timer = self
            .metrics
            .provider_duration
            .with_label_values(&[PROVIDER_NAME])
            .start_timer();
        let result = self.request(city).await;
        timer.observe_duration();

        let status = match &result {
            Ok(_) => "success",
            Err(e) => {
                error!(city = %city, error = %e, "OpenWeatherMap request failed");
                e.status_label()
            }
        };
        self.metrics
            .provider_requests
            .with_label_values(&[PROVIDER_NAME, status])
            .inc();

        result
    }
}

fn map_http_error(err: AppError, city: &str) -> ProviderError {
    match err {
        AppError::HttpError { status: 404, .. } => ProviderError::CityNotFound(city.to_string()),
        AppError::HttpError { status: 401, .. } => ProviderError::Unauthorized,
        AppError::HttpError { status, message } => ProviderError::Upstream { status, message },
        AppError::TimeoutError(msg) => ProviderError::Connection(msg),
        AppError::NetworkError(e) => ProviderError::Connection(e.to_string()),
        AppError::ParseError(e) => ProviderError::Parse(e.to_string()),
        other => ProviderError::Connection(other.to_string()),
    }
}

fn normalize(response: OpenWeatherResponse) -> Result<WeatherSnapshot, ProviderError> {
    let condition = response
        .weather
        .first()
        .ok_or_else(|| ProviderError::Parse("missing weather condition".to_string()))?;
    let description = normalize_city(&condition.description).unwrap_or_default();

    Ok(WeatherSnapshot {
        city: response.name,
        country: response.sys.and_then(|s| s.country),
        temperature: (response.main.temp * 10.0).round() / 10.0,
        description,
        humidity: response.main.humidity,
        pressure: response.main.pressure,
        wind_speed: Some(response.wind.and_then(|w| w.speed).unwrap_or(0.0)),
        provider: PROVIDER_NAME.to_string(),
        cached: false,
        timestamp: Utc::now(),
    })
}
