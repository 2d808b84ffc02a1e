use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use weather_service::cache::{InMemoryTtlCache, LayeredCache, TtlCache};
use weather_service::config::{CacheBackend, Config};
use weather_service::db::{self, PgCounterStore, PgHistoryStore, PgTtlCache};
use weather_service::handlers::{self, AppState};
use weather_service::history::{HistoryStore, InMemoryHistoryStore};
use weather_service::metrics::Metrics;
use weather_service::orchestrator::{OrchestratorSettings, WeatherOrchestrator};
use weather_service::provider;
use weather_service::rate_limit::{
    CounterStore, FixedWindowRateLimiter, InMemoryCounterStore, RateLimiter,
};
use weather_service::sweeper::{RetentionSweeper, SweepSchedule};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env();
    common::tracing::init(config.log_format);

    let cancellation_token = CancellationToken::new();
    let metrics = Arc::new(Metrics::new()?);

    let pool = match &config.database_url {
        Some(url) => {
            info!("Connecting to database");
            Some(db::create_pool(url).await?)
        }
        None => {
            warn!("DATABASE_URL not set, using in-memory stores");
            None
        }
    };

    let cache: Arc<dyn TtlCache> = match (config.cache_backend, &pool) {
        (CacheBackend::Postgres, Some(pool)) => {
            Arc::new(PgTtlCache::new(pool.clone(), config.cache_ttl_seconds))
        }
        (CacheBackend::Layered, Some(pool)) => Arc::new(LayeredCache::new(
            Arc::new(InMemoryTtlCache::with_ttl(config.cache_ttl_seconds)),
            Arc::new(PgTtlCache::new(pool.clone(), config.cache_ttl_seconds)),
        )),
        (backend, None) if backend != CacheBackend::Memory => {
            warn!(backend = ?backend, "Cache backend needs DATABASE_URL, falling back to memory");
            Arc::new(InMemoryTtlCache::with_ttl(config.cache_ttl_seconds))
        }
        _ => Arc::new(InMemoryTtlCache::with_ttl(config.cache_ttl_seconds)),
    };

    let (history, counters): (Arc<dyn HistoryStore>, Arc<dyn CounterStore>) = match &pool {
        Some(pool) => (
            Arc::new(PgHistoryStore::new(pool.clone())),
            Arc::new(PgCounterStore::new(pool.clone())),
        ),
        None => (
            Arc::new(InMemoryHistoryStore::new()),
            Arc::new(InMemoryCounterStore::new()),
        ),
    };

    let rate_limiter: Option<Arc<dyn RateLimiter>> = if config.rate_limit_enabled {
        info!(
            requests = config.rate_limit_requests,
            window_seconds = config.rate_limit_window_seconds,
            "Rate limiting enabled"
        );
        Some(Arc::new(FixedWindowRateLimiter::new(
            counters.clone(),
            config.rate_limit_requests,
            config.rate_limit_window_seconds,
            metrics.clone(),
        )))
    } else {
        warn!("Rate limiting disabled");
        None
    };

    let weather_provider = provider::from_config(&config, metrics.clone())?;
    let orchestrator = Arc::new(WeatherOrchestrator::new(
        weather_provider,
        cache.clone(),
        history.clone(),
        metrics.clone(),
        OrchestratorSettings {
            cache_ttl: Duration::from_secs(config.cache_freshness_seconds),
            history_limit: config.history_limit,
            provider_timeout: config.provider_timeout(),
        },
    ));

    let sweeper = Arc::new(RetentionSweeper::new(
        history,
        cache.clone(),
        Some(counters),
        metrics.clone(),
        config.history_limit,
        config.history_retention_days,
    ));
    let sweep_tasks = sweeper.spawn(
        SweepSchedule::from_config(&config),
        cancellation_token.clone(),
    );

    let state = AppState {
        orchestrator,
        rate_limiter,
        cache,
        db: pool,
        metrics,
    };
    let app = handlers::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Weather service starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(cancellation_token.clone()))
    .await?;

    cancellation_token.cancel();
    for task in sweep_tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Sweep task ended abnormally");
        }
    }

    info!("Weather service stopped");
    Ok(())
}

async fn shutdown_signal(cancellation_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, starting graceful shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        },
    }

    // Stop the sweep loops; axum drains in-flight requests
    cancellation_token.cancel();
    warn!("Stopping background jobs, shutting down gracefully...");
}
