use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;

/// Current weather for a city, normalized from a provider response
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, ToSchema)]
pub struct WeatherSnapshot {
    pub city: String,
    pub country: Option<String>,
    /// Degrees Celsius
    pub temperature: f64,
    pub description: String,
    /// Relative humidity, 0-100
    pub humidity: Option<i32>,
    /// hPa
    pub pressure: Option<f64>,
    /// m/s
    pub wind_speed: Option<f64>,
    pub provider: String,
    #[serde(default)]
    pub cached: bool,
    /// Time the snapshot was served, not the provider observation time
    pub timestamp: DateTime<Utc>,
}

impl WeatherSnapshot {
    /// Re-stamp presentation metadata for the current serving context.
    pub fn served(mut self, cached: bool, at: DateTime<Utc>) -> Self {
        self.cached = cached;
        self.timestamp = at;
        self
    }

    /// True when the weather fields match, ignoring `cached` and `timestamp`.
    pub fn same_weather(&self, other: &Self) -> bool {
        self.city == other.city
            && self.country == other.country
            && self.temperature == other.temperature
            && self.description == other.description
            && self.humidity == other.humidity
            && self.pressure == other.pressure
            && self.wind_speed == other.wind_speed
            && self.provider == other.provider
    }
}

/// One served weather query as stored in history
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, ToSchema)]
pub struct HistoryRecord {
    pub id: i64,
    pub city: String,
    #[serde(skip_serializing, default)]
    pub client_ip: String,
    pub country: Option<String>,
    pub temperature: f64,
    pub description: String,
    pub humidity: Option<i32>,
    pub pressure: Option<f64>,
    pub wind_speed: Option<f64>,
    pub provider: String,
    pub created_at: DateTime<Utc>,
}

/// Weather query history for a city and client
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HistoryResponse {
    pub city: String,
    pub queries: Vec<HistoryRecord>,
    pub total: usize,
    pub limit: usize,
}

/// Generic message response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct MessageResponse {
    pub message: String,
}

/// Aggregate usage figures produced by the periodic rollup job
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, ToSchema)]
pub struct UsageReport {
    pub total_queries_24h: u64,
    pub unique_cities_24h: u64,
    pub unique_clients_24h: u64,
    pub top_cities_24h: Vec<CityCount>,
    pub cache_entries: u64,
    pub total_queries: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, ToSchema)]
pub struct CityCount {
    pub city: String,
    pub count: u64,
}

/// Health of the service and each backing store
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthReport {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub services: BTreeMap<String, String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}
