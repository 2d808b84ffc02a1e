use common::errors::AppError;
use thiserror::Error;

/// Failure kinds reported by a [`crate::provider::WeatherProvider`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Weather provider API key not configured")]
    NotConfigured,

    #[error("City '{0}' not found")]
    CityNotFound(String),

    #[error("Weather provider rejected the API key")]
    Unauthorized,

    #[error("Weather provider returned status {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("Connection to weather provider failed: {0}")]
    Connection(String),

    #[error("Could not parse weather provider response: {0}")]
    Parse(String),
}

impl ProviderError {
    /// Label used for the external request counter.
    pub fn status_label(&self) -> &'static str {
        match self {
            ProviderError::NotConfigured => "not_configured",
            ProviderError::CityNotFound(_) => "not_found",
            ProviderError::Unauthorized => "unauthorized",
            ProviderError::Upstream { .. } => "error",
            ProviderError::Connection(_) => "connection_error",
            ProviderError::Parse(_) => "parse_error",
        }
    }
}

/// Errors from the cache, history and rate limit counter stores.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by the orchestrator to the HTTP layer.
#[derive(Error, Debug)]
pub enum WeatherError {
    #[error("City name is required")]
    InvalidCity,

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl From<WeatherError> for AppError {
    fn from(err: WeatherError) -> Self {
        match err {
            WeatherError::InvalidCity => AppError::validation(err.to_string()),
            WeatherError::Provider(ProviderError::CityNotFound(city)) => {
                AppError::not_found(format!("City '{}' not found", city))
            }
            WeatherError::Provider(e) => AppError::internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn maps_weather_errors_to_status_codes() {
        let cases = [
            (WeatherError::InvalidCity, StatusCode::BAD_REQUEST),
            (
                ProviderError::CityNotFound("Atlantis".into()).into(),
                StatusCode::NOT_FOUND,
            ),
            (
                ProviderError::NotConfigured.into(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                ProviderError::Unauthorized.into(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                ProviderError::Connection("timed out".into()).into(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(AppError::from(err).status_code(), expected);
        }
    }
}
