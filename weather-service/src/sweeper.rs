//! Periodic retention jobs for history, cache and rate limit counters.
//!
//! Every job is idempotent and runs on its own interval loop. A failure for
//! one key or one job is logged and the rest carry on.

use chrono::Utc;
use common::models::UsageReport;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::cache::TtlCache;
use crate::config::Config;
use crate::error::StoreError;
use crate::history::{HistoryKey, HistoryStore};
use crate::metrics::Metrics;
use crate::rate_limit::CounterStore;

#[derive(Debug, Clone)]
pub struct SweepSchedule {
    pub trim_history_per_city: Duration,
    pub trim_history_per_client: Duration,
    pub purge_expired_cache: Duration,
    pub purge_stale_records: Duration,
    pub usage_rollup: Duration,
}

impl SweepSchedule {
    pub fn from_config(config: &Config) -> Self {
        let secs = |s: u64| Duration::from_secs(s.max(1));
        Self {
            trim_history_per_city: secs(config.history_sweep_interval_seconds),
            trim_history_per_client: secs(config.client_history_sweep_interval_seconds),
            purge_expired_cache: secs(config.cache_purge_interval_seconds),
            purge_stale_records: secs(config.stale_purge_interval_seconds),
            usage_rollup: secs(config.metrics_rollup_interval_seconds),
        }
    }
}

impl Default for SweepSchedule {
    fn default() -> Self {
        Self {
            trim_history_per_city: Duration::from_secs(60),
            trim_history_per_client: Duration::from_secs(3600),
            purge_expired_cache: Duration::from_secs(1800),
            purge_stale_records: Duration::from_secs(86400),
            usage_rollup: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Job {
    TrimHistoryPerCity,
    TrimHistoryPerClient,
    PurgeExpiredCache,
    PurgeStaleRecords,
    UsageRollup,
}

impl Job {
    fn name(self) -> &'static str {
        match self {
            Job::TrimHistoryPerCity => "trim_history_per_city",
            Job::TrimHistoryPerClient => "trim_history_per_client",
            Job::PurgeExpiredCache => "purge_expired_cache",
            Job::PurgeStaleRecords => "purge_stale_records",
            Job::UsageRollup => "usage_rollup",
        }
    }
}

pub struct RetentionSweeper {
    history: Arc<dyn HistoryStore>,
    cache: Arc<dyn TtlCache>,
    counters: Option<Arc<dyn CounterStore>>,
    metrics: Arc<Metrics>,
    history_limit: usize,
    retention: chrono::Duration,
}

impl RetentionSweeper {
    pub fn new(
        history: Arc<dyn HistoryStore>,
        cache: Arc<dyn TtlCache>,
        counters: Option<Arc<dyn CounterStore>>,
        metrics: Arc<Metrics>,
        history_limit: usize,
        retention_days: i64,
    ) -> Self {
        Self {
            history,
            cache,
            counters,
            metrics,
            history_limit,
            retention: chrono::Duration::days(retention_days.max(1)),
        }
    }

    /// Keep only the newest records for every city, across all clients.
    #[instrument(skip(self))]
    pub async fn trim_history_per_city(&self) -> Result<u64, StoreError> {
        let cities = self.history.distinct_cities().await?;
        let keys = cities.into_iter().map(HistoryKey::City).collect();
        Ok(self.trim_keys(keys).await)
    }

    /// Keep only the newest records for every (city, client) pair.
    #[instrument(skip(self))]
    pub async fn trim_history_per_client(&self) -> Result<u64, StoreError> {
        let keys = self.history.distinct_city_clients().await?;
        Ok(self.trim_keys(keys).await)
    }

    async fn trim_keys(&self, keys: Vec<HistoryKey>) -> u64 {
        let mut total = 0;
        for key in keys {
            match self.history.trim_to_last(&key, self.history_limit).await {
                Ok(removed) => {
                    if removed > 0 {
                        debug!(key = ?key, removed, "Trimmed history");
                    }
                    total += removed;
                }
                Err(e) => {
                    self.metrics.store_error("history", "trim");
                    error!(key = ?key, error = %e, "Failed to trim history");
                }
            }
        }
        self.metrics.history_records_trimmed.inc_by(total);
        total
    }

    /// Drop expired cache entries and rate limit counters.
    #[instrument(skip(self))]
    pub async fn purge_expired_cache(&self) -> Result<u64, StoreError> {
        let purged = self.cache.purge_expired().await?;
        self.metrics.cache_entries_purged.inc_by(purged);

        if let Some(counters) = &self.counters {
            match counters.purge_expired().await {
                Ok(n) if n > 0 => debug!(counters = n, "Purged expired rate limit counters"),
                Ok(_) => {}
                Err(e) => {
                    self.metrics.store_error("rate_limit", "purge");
                    error!(error = %e, "Failed to purge rate limit counters");
                }
            }
        }

        Ok(purged)
    }

    /// Delete history older than the retention period.
    #[instrument(skip(self))]
    pub async fn purge_stale_records(&self) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - self.retention;
        self.history.purge_older_than(cutoff).await
    }

    /// Compute the 24 hour usage report and publish the query gauge.
    #[instrument(skip(self))]
    pub async fn usage_rollup(&self) -> Result<UsageReport, StoreError> {
        let since = Utc::now() - chrono::Duration::hours(24);
        let mut report = self.history.usage_report(since).await?;
        report.cache_entries = match self.cache.entry_count().await {
            Ok(n) => n,
            Err(e) => {
                self.metrics.store_error("cache", "count");
                error!(error = %e, "Failed to count cache entries");
                0
            }
        };
        self.metrics
            .queries_last_24h
            .set(report.total_queries_24h.min(i64::MAX as u64) as i64);
        Ok(report)
    }

    async fn run_job(&self, job: Job) {
        match job {
            Job::TrimHistoryPerCity => match self.trim_history_per_city().await {
                Ok(n) => info!(job = job.name(), removed = n, "Sweep finished"),
                Err(e) => self.job_failed(job, e),
            },
            Job::TrimHistoryPerClient => match self.trim_history_per_client().await {
                Ok(n) => info!(job = job.name(), removed = n, "Sweep finished"),
                Err(e) => self.job_failed(job, e),
            },
            Job::PurgeExpiredCache => match self.purge_expired_cache().await {
                Ok(n) => info!(job = job.name(), removed = n, "Sweep finished"),
                Err(e) => self.job_failed(job, e),
            },
            Job::PurgeStaleRecords => match self.purge_stale_records().await {
                Ok(n) => info!(job = job.name(), removed = n, "Sweep finished"),
                Err(e) => self.job_failed(job, e),
            },
            Job::UsageRollup => match self.usage_rollup().await {
                Ok(report) => info!(
                    job = job.name(),
                    total_queries_24h = report.total_queries_24h,
                    unique_cities_24h = report.unique_cities_24h,
                    unique_clients_24h = report.unique_clients_24h,
                    cache_entries = report.cache_entries,
                    total_queries = report.total_queries,
                    top_cities = ?report.top_cities_24h,
                    "Usage rollup"
                ),
                Err(e) => self.job_failed(job, e),
            },
        }
    }

    fn job_failed(&self, job: Job, e: StoreError) {
        self.metrics.store_error("sweeper", job.name());
        error!(job = job.name(), error = %e, "Sweep failed");
    }

    /// Spawn one loop per job. Loops exit when `shutdown` is cancelled.
    pub fn spawn(
        self: Arc<Self>,
        schedule: SweepSchedule,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        [
            (Job::TrimHistoryPerCity, schedule.trim_history_per_city),
            (Job::TrimHistoryPerClient, schedule.trim_history_per_client),
            (Job::PurgeExpiredCache, schedule.purge_expired_cache),
            (Job::PurgeStaleRecords, schedule.purge_stale_records),
            (Job::UsageRollup, schedule.usage_rollup),
        ]
        .into_iter()
        .map(|(job, period)| {
            let sweeper = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { sweeper.run_loop(job, period, shutdown).await })
        })
        .collect()
    }

    async fn run_loop(&self, job: Job, period: Duration, shutdown: CancellationToken) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so jobs start one period in.
        ticker.tick().await;

        info!(job = job.name(), interval_secs = period.as_secs(), "Starting sweep loop");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_job(job).await,
                _ = shutdown.cancelled() => {
                    info!(job = job.name(), "Sweep loop shutting down");
                    break;
                }
            }
        }
    }
}
