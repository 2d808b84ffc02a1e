use axum::{
    Json, Router,
    extract::{Query, Request, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get},
};
use chrono::Utc;
use common::errors::AppError;
use common::models::{HealthReport, HistoryResponse, MessageResponse, WeatherSnapshot};
use serde::Deserialize;
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use utoipa::IntoParams;

use crate::cache::TtlCache;
use crate::client_ip::ClientIp;
use crate::metrics::Metrics;
use crate::openapi;
use crate::orchestrator::WeatherOrchestrator;
use crate::rate_limit::{Admission, RateLimiter};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<WeatherOrchestrator>,
    /// `None` when rate limiting is disabled.
    pub rate_limiter: Option<Arc<dyn RateLimiter>>,
    pub cache: Arc<dyn TtlCache>,
    pub db: Option<PgPool>,
    pub metrics: Arc<Metrics>,
}

pub fn router(state: AppState) -> Router {
    let limited = Router::new()
        .route("/api/v1/weather", get(get_weather))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    Router::new()
        .route("/", get(home))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .merge(limited)
        .route("/api/v1/weather/history", get(get_history))
        .route("/api/v1/weather/cache", delete(invalidate_cache))
        .merge(openapi::swagger_ui())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Reject clients over their request budget with 429 before the handler runs.
pub async fn rate_limit(
    State(state): State<AppState>,
    ClientIp(client_ip): ClientIp,
    request: Request,
    next: Next,
) -> Response {
    let Some(limiter) = &state.rate_limiter else {
        return next.run(request).await;
    };

    match limiter.try_admit(&client_ip).await {
        Admission::Admitted { .. } => next.run(request).await,
        Admission::Rejected { retry_after } => {
            // Round up so clients never retry into the same window.
            let retry_after = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            AppError::RateLimited {
                limit: limiter.limit(),
                window_seconds: limiter.window().as_secs(),
                retry_after: retry_after.max(1),
            }
            .into_response()
        }
    }
}

#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Service information")
    )
)]
pub async fn home() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": "weather-service",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "weather": "/api/v1/weather?city={city}",
            "history": "/api/v1/weather/history?city={city}&limit={limit}",
            "invalidate_cache": "/api/v1/weather/cache?city={city}",
            "health": "/health",
            "metrics": "/metrics",
            "docs": "/swagger-ui",
        },
    }))
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "All backing services are healthy", body = HealthReport),
        (status = 503, description = "At least one backing service is unhealthy", body = HealthReport)
    )
)]
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let mut services = BTreeMap::new();
    let mut healthy = true;

    let mut record = |name: &str, result: Result<(), String>| {
        let status = match result {
            Ok(()) => "healthy".to_string(),
            Err(e) => {
                warn!(service = %name, error = %e, "Health check failed");
                healthy = false;
                format!("unhealthy: {}", e)
            }
        };
        services.insert(name.to_string(), status);
    };

    if let Some(pool) = &state.db {
        record(
            "database",
            crate::db::ping(pool).await.map_err(|e| e.to_string()),
        );
    }
    record(
        "cache",
        state.cache.health_check().await.map_err(|e| e.to_string()),
    );
    if let Some(limiter) = &state.rate_limiter {
        record(
            "rate_limit",
            limiter.health_check().await.map_err(|e| e.to_string()),
        );
    }

    let report = HealthReport {
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
        timestamp: Utc::now(),
        services,
    };
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(report))
}

#[utoipa::path(
    get,
    path = "/metrics",
    responses(
        (status = 200, description = "Prometheus metrics", body = String, content_type = "text/plain")
    )
)]
pub async fn metrics(State(state): State<AppState>) -> Result<Response, AppError> {
    let body = state.metrics.render()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response())
}

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct WeatherQuery {
    /// City name, any casing
    pub city: Option<String>,
}

#[utoipa::path(
    get,
    path = "/api/v1/weather",
    params(WeatherQuery),
    responses(
        (status = 200, description = "Current weather for the city", body = WeatherSnapshot),
        (status = 400, description = "City name missing or blank"),
        (status = 404, description = "City not found"),
        (status = 429, description = "Rate limit exceeded"),
        (status = 500, description = "Weather provider error")
    ),
    tag = "weather"
)]
pub async fn get_weather(
    State(state): State<AppState>,
    ClientIp(client_ip): ClientIp,
    Query(params): Query<WeatherQuery>,
) -> Result<Json<WeatherSnapshot>, AppError> {
    let city = params.city.unwrap_or_default();
    info!(city = %city, client_ip = %client_ip, "Weather request received");

    let weather = state.orchestrator.get_weather(&city, &client_ip).await?;

    Ok(Json(weather))
}

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct HistoryQuery {
    /// City name, any casing
    pub city: Option<String>,
    /// Number of records to return, 1 to 50 (default 10)
    pub limit: Option<String>,
}

#[utoipa::path(
    get,
    path = "/api/v1/weather/history",
    params(HistoryQuery),
    responses(
        (status = 200, description = "Most recent queries for the city by this client", body = HistoryResponse),
        (status = 400, description = "City name missing or blank")
    ),
    tag = "weather"
)]
pub async fn get_history(
    State(state): State<AppState>,
    ClientIp(client_ip): ClientIp,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, AppError> {
    let city = params.city.unwrap_or_default();
    let limit = params.limit.and_then(|l| l.trim().parse::<i64>().ok());

    let history = state
        .orchestrator
        .get_history(&city, &client_ip, limit)
        .await?;

    Ok(Json(history))
}

#[utoipa::path(
    delete,
    path = "/api/v1/weather/cache",
    params(WeatherQuery),
    responses(
        (status = 200, description = "Cache entry removed", body = MessageResponse),
        (status = 400, description = "City name missing or blank")
    ),
    tag = "weather"
)]
pub async fn invalidate_cache(
    State(state): State<AppState>,
    Query(params): Query<WeatherQuery>,
) -> Result<Json<MessageResponse>, AppError> {
    let city = params.city.unwrap_or_default();
    let city = state.orchestrator.invalidate_cache(&city).await?;

    Ok(Json(MessageResponse {
        message: format!("Cache invalidated for {}", city),
    }))
}
