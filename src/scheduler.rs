// Scheduler module - periodic refresh of every metric snapshot
//
// This module implements the polling loop using Tokio tasks.
//
// # Architecture
// - One background loop ticks on a fixed interval
// - Each tick spawns one task per enabled metric and waits for all of them;
//   cancelling the tick aborts whatever is still in flight
// - Tasks are independent: a failed or hung metric never delays its siblings
// - Every task is bounded by the poll interval, so ticks never overlap
// - The loop stops when its cancellation token fires

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::azion::{AnalyticsSource, ApiError};
use crate::metrics::{assert_latest_value, decode_series, DecodeError, MetricDefinition, MetricRegistry};
use crate::storage::SnapshotStore;

/// Default time between two poll ticks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Why a metric could not be refreshed
#[derive(Error, Debug)]
pub enum PollError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("could not decode analytics payload: {0}")]
    Decode(#[from] DecodeError),
}

/// Outcome of one poll tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub succeeded: usize,
    pub failed: usize,
}

/// Periodically refreshes the snapshot of every enabled metric
pub struct PollingScheduler {
    registry: Arc<MetricRegistry>,
    store: Arc<SnapshotStore>,
    source: Arc<dyn AnalyticsSource>,
    interval: Duration,
    task_timeout: Duration,
}

impl PollingScheduler {
    /// Creates a scheduler; per-metric tasks are bounded by `interval`.
    pub fn new(
        registry: Arc<MetricRegistry>,
        store: Arc<SnapshotStore>,
        source: Arc<dyn AnalyticsSource>,
        interval: Duration,
    ) -> Self {
        PollingScheduler {
            registry,
            store,
            source,
            interval,
            task_timeout: interval,
        }
    }

    /// Overrides the per-metric time budget (never above the interval).
    #[cfg(test)]
    pub fn with_task_timeout(mut self, task_timeout: Duration) -> Self {
        self.task_timeout = task_timeout.min(self.interval);
        self
    }

    /// Runs poll ticks until `cancel` fires.
    ///
    /// The first tick happens immediately. A tick that overruns the interval
    /// delays the next one instead of bursting to catch up.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            "Starting poller for {} metric(s) every {}s",
            self.registry.len(),
            self.interval.as_secs_f64()
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Poller shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            info!("Poller shutting down, abandoning tick in progress");
                            break;
                        }
                        summary = self.poll_once() => {
                            info!(
                                "Poll tick complete: {}/{} metric(s) refreshed",
                                summary.succeeded,
                                summary.succeeded + summary.failed
                            );
                        }
                    }
                }
            }
        }
    }

    /// Refreshes every metric once, concurrently, and waits for all of them.
    ///
    /// Dropping the returned future aborts the metric tasks still running.
    pub async fn poll_once(&self) -> PollSummary {
        let mut tasks = JoinSet::new();
        for definition in self.registry.definitions().iter().cloned() {
            let source = Arc::clone(&self.source);
            let store = Arc::clone(&self.store);
            let task_timeout = self.task_timeout;

            tasks.spawn(Self::run_metric_task(source, store, definition, task_timeout));
        }

        let mut summary = PollSummary::default();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(true) => summary.succeeded += 1,
                Ok(false) => summary.failed += 1,
                Err(e) => {
                    error!("Metric poll task panicked: {}", e);
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    /// Fetches, decodes and stores one metric; returns whether it succeeded.
    async fn run_metric_task(
        source: Arc<dyn AnalyticsSource>,
        store: Arc<SnapshotStore>,
        definition: MetricDefinition,
        task_timeout: Duration,
    ) -> bool {
        let identifier = definition.identifier.as_str();

        let outcome = match timeout(task_timeout, Self::poll_metric(source.as_ref(), &definition)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(PollError::Api(ApiError::Timeout(task_timeout))),
        };

        let stored = match outcome {
            Ok(value) => {
                debug!("Polled {} ({}) = {}", identifier, definition.query, value);
                store.record_success(identifier, value, Utc::now()).map(|_| true)
            }
            Err(e) => {
                match store.read(identifier).ok().and_then(|s| s.last_updated) {
                    Some(at) => warn!(
                        "Failed to poll metric '{}': {}. Keeping value from {}",
                        identifier, e, at
                    ),
                    None => warn!("Failed to poll metric '{}': {}. No value yet", identifier, e),
                }
                store.record_failure(identifier, Arc::new(e)).map(|_| false)
            }
        };

        stored.unwrap_or_else(|e| {
            error!("Failed to store snapshot for '{}': {}", identifier, e);
            false
        })
    }

    async fn poll_metric(
        source: &dyn AnalyticsSource,
        definition: &MetricDefinition,
    ) -> Result<f64, PollError> {
        let payload = source.fetch(&definition.query).await?;
        let series = decode_series(&payload, &definition.query)?;
        Ok(assert_latest_value(&series))
    }
}
