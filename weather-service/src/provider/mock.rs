use async_trait::async_trait;
use chrono::Utc;
use common::models::WeatherSnapshot;
use tracing::info;

use super::WeatherProvider;
use crate::error::ProviderError;

/// Deterministic provider for development and tests.
///
/// `"error"` and `"fail"` produce an upstream failure and `"notfound"` a
/// missing city; any other name gets the same canned conditions.
#[derive(Debug, Default, Clone)]
pub struct MockWeatherProvider;

impl MockWeatherProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl WeatherProvider for MockWeatherProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn fetch(&self, city: &str) -> Result<WeatherSnapshot, ProviderError> {
        info!(city = %city, "Returning mock weather data");

        match city.to_lowercase().as_str() {
            "error" | "fail" => Err(ProviderError::Upstream {
                status: 500,
                message: "Mock error for testing".to_string(),
            }),
            "notfound" => Err(ProviderError::CityNotFound(city.to_string())),
            _ => Ok(WeatherSnapshot {
                city: city.to_string(),
                country: Some("BR".to_string()),
                temperature: 25.0,
                description: "Sunny".to_string(),
                humidity: Some(60),
                pressure: Some(1013.25),
                wind_speed: Some(5.5),
                provider: self.name().to_string(),
                cached: false,
                timestamp: Utc::now(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_canned_snapshot() {
        let snapshot = MockWeatherProvider::new()
            .fetch("Recife")
            .await
            .expect("mock should succeed");

        assert_eq!(snapshot.city, "Recife");
        assert_eq!(snapshot.temperature, 25.0);
        assert_eq!(snapshot.provider, "mock");
        assert!(!snapshot.cached);
    }

    #[tokio::test]
    async fn synthetic_failures() {
        let provider = MockWeatherProvider::new();

        assert!(matches!(
            provider.fetch("Error").await,
            Err(ProviderError::Upstream { status: 500, .. })
        ));
        assert!(matches!(
            provider.fetch("fail").await,
            Err(ProviderError::Upstream { .. })
        ));
        assert!(matches!(
            provider.fetch("Notfound").await,
            Err(ProviderError::CityNotFound(_))
        ));
    }
}
