use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "prometheus")]
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(feature = "prometheus")]
use std::sync::Mutex;
#[cfg(feature = "prometheus")]
use std::thread::JoinHandle;

use crate::types::Timestamp;

/// Structured, in-process event hook for observability.
///
/// This crate is a library; emitting logs directly (e.g. `println!`) is not acceptable for
/// production. Instead, callers provide an implementation that forwards these events to
/// `tracing`, metrics, or custom sinks. [`TracingEventListener`] is the stock forwarder.
pub trait IngestEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: IngestEvent);
}

/// Structured events emitted by the ingestion pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestEvent {
    CopierCountClamped { requested: i64 },
    ThroughputReporterStarted { interval_secs: u64 },
    ThroughputReport { samples_per_sec: u64, interval_secs: u64 },

    MetricWorkerStarted { metric: String },
    MetricWorkerInitFailed { metric: String, error: String },
    FinalizeMetricCreationFailed { error: String },

    SeriesResolutionFailed { metric: String, requests: usize, error: String },

    DuplicateSamples { table: String, duplicates: u64, rows: u64 },
    RegionCompressed { table: String, min_time: Timestamp, age: Duration, delay: Duration },
    CompactionRescheduleFailed { table: String, error: String },
    DecompressionFailed { table: String, error: String },
    InsertRecoveryFailed { table: String, error: String },
    UnexpectedInsertError { table: String, error: String },
    UnresolvedSeriesAtInsert { table: String },

    AsyncInsertFailed { rows: u64, error: String },

    BackgroundThreadPanicked { thread: String },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl IngestEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: IngestEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn IngestEventListener> {
    Arc::new(NoopEventListener)
}

/// Forwards every event to `tracing`, at the level an operator would expect:
/// recoverable conditions at `warn`, dropped data and failed recovery at `error`.
#[derive(Debug, Default)]
pub struct TracingEventListener;

impl IngestEventListener for TracingEventListener {
    fn on_event(&self, event: IngestEvent) {
        use IngestEvent::*;
        match event {
            CopierCountClamped { requested } => {
                tracing::warn!(requested, "num copiers less than 1, setting to 1");
            }
            ThroughputReporterStarted { interval_secs } => {
                tracing::info!(interval_secs, "outputting throughput info once every {}s", interval_secs);
            }
            ThroughputReport { samples_per_sec, .. } => {
                tracing::info!(samples_per_sec, "Samples write throughput");
            }
            MetricWorkerStarted { metric } => {
                tracing::debug!(%metric, "metric worker started");
            }
            MetricWorkerInitFailed { metric, error } => {
                tracing::warn!(%metric, err = %error, "initializing the insert routine failed");
            }
            FinalizeMetricCreationFailed { error } => {
                tracing::warn!(err = %error, "Got an error finalizing metric");
            }
            SeriesResolutionFailed { metric, requests, error } => {
                tracing::warn!(%metric, requests, err = %error, "series id resolution failed");
            }
            DuplicateSamples { table, duplicates, rows } => {
                tracing::warn!(%table, duplicate_count = duplicates, row_count = rows, "duplicate data in sample");
            }
            RegionCompressed { table, min_time, age, delay } => {
                tracing::warn!(
                    %table,
                    min_time,
                    age = ?age,
                    delay_job_by = ?delay,
                    "Table {} was compressed, decompressing",
                    table
                );
            }
            CompactionRescheduleFailed { table, error } => {
                tracing::error!(%table, err = %error, "Rescheduling compression");
            }
            DecompressionFailed { table, error } => {
                tracing::error!(%table, err = %error, "Decompressing chunks");
            }
            InsertRecoveryFailed { table, error } => {
                tracing::warn!(%table, err = %error, "recovering insert into {} failed, returning original error", table);
            }
            UnexpectedInsertError { table, error } => {
                tracing::warn!(%table, err = %error, "unexpected error while inserting to {}", table);
            }
            UnresolvedSeriesAtInsert { table } => {
                tracing::error!(%table, "unresolved series id reached insert; flush abandoned");
            }
            AsyncInsertFailed { rows, error } => {
                tracing::error!(err = %error, "error on async send, dropping {} datapoints", rows);
            }
            BackgroundThreadPanicked { thread } => {
                tracing::error!(%thread, "background thread panicked");
            }
        }
    }
}

/// Metrics instrumentation for the write path.
///
/// ## Key properties
/// - Library-safe: emitting metrics is effectively a no-op until a recorder is installed.
/// - Serverless scraping: with the `prometheus` feature callers can render Prometheus
///   exposition text in-process.
pub mod ingest_metrics {
    use super::*;

    use ::metrics::{describe_counter, describe_gauge, Unit};

    #[cfg(feature = "prometheus")]
    use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

    // --- metric names ---
    //
    // Counters are exposed as `<name>_total` by the Prometheus exporter.

    pub const INGESTED_SAMPLES: &str = "tsingest_ingested_samples";
    pub const DUPLICATE_SAMPLES: &str = "tsingest_duplicate_samples";
    pub const DUPLICATE_WRITES: &str = "tsingest_duplicate_writes";
    pub const DECOMPRESS_CALLS: &str = "tsingest_decompress_calls";
    pub const DECOMPRESS_EARLIEST_SECONDS: &str = "tsingest_decompress_earliest_seconds";
    pub const THROUGHPUT_SAMPLES_PER_SECOND: &str = "tsingest_throughput_samples_per_second";

    /// Handle to the in-process Prometheus recorder/scrape renderer.
    ///
    /// This does **not** start an HTTP server. Call [`InProcessPrometheus::render`] to scrape.
    #[cfg(feature = "prometheus")]
    #[derive(Debug)]
    pub struct InProcessPrometheus {
        handle: PrometheusHandle,
        stop: Arc<AtomicBool>,
        upkeep_thread: Mutex<Option<JoinHandle<()>>>,
    }

    #[cfg(feature = "prometheus")]
    impl InProcessPrometheus {
        /// Installs a global Prometheus recorder (once per process) and starts a small upkeep
        /// thread that keeps exporter internals bounded.
        pub fn install(upkeep_interval: Duration) -> Result<Self, MetricsInitError> {
            describe_all();

            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(MetricsInitError::from_build_error)?;

            let stop = Arc::new(AtomicBool::new(false));
            let stop_clone = stop.clone();
            let handle_clone = handle.clone();
            let upkeep_thread = std::thread::Builder::new()
                .name("tsingest-metrics-upkeep".to_string())
                .spawn(move || {
                    while !stop_clone.load(Ordering::Relaxed) {
                        std::thread::sleep(upkeep_interval);
                        handle_clone.run_upkeep();
                    }
                })
                .map_err(|e| MetricsInitError::ThreadSpawn(e.to_string()))?;

            Ok(Self {
                handle,
                stop,
                upkeep_thread: Mutex::new(Some(upkeep_thread)),
            })
        }

        /// Renders the current metrics in the Prometheus text exposition format.
        pub fn render(&self) -> String {
            self.handle.render()
        }
    }

    #[cfg(feature = "prometheus")]
    impl Drop for InProcessPrometheus {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Ok(mut guard) = self.upkeep_thread.lock() {
                if let Some(t) = guard.take() {
                    let _ = t.join();
                }
            }
        }
    }

    #[cfg(feature = "prometheus")]
    #[derive(Debug, thiserror::Error)]
    pub enum MetricsInitError {
        #[error("metrics recorder already installed")]
        AlreadyInstalled,
        #[error("failed to install prometheus recorder: {0}")]
        Install(String),
        #[error("failed to spawn upkeep thread: {0}")]
        ThreadSpawn(String),
    }

    #[cfg(feature = "prometheus")]
    impl MetricsInitError {
        fn from_build_error(e: BuildError) -> Self {
            match e {
                BuildError::FailedToSetGlobalRecorder(_) => MetricsInitError::AlreadyInstalled,
                other => MetricsInitError::Install(other.to_string()),
            }
        }
    }

    #[inline]
    pub fn record_ingested_samples(samples: u64) {
        if samples > 0 {
            ::metrics::counter!(INGESTED_SAMPLES).increment(samples);
        }
    }

    #[inline]
    pub fn record_duplicates(duplicates: u64) {
        ::metrics::counter!(DUPLICATE_SAMPLES).increment(duplicates);
        ::metrics::counter!(DUPLICATE_WRITES).increment(1);
    }

    #[inline]
    pub fn record_decompression(table: &str, min_time: Timestamp) {
        ::metrics::counter!(DECOMPRESS_CALLS).increment(1);
        ::metrics::gauge!(DECOMPRESS_EARLIEST_SECONDS, "table" => table.to_string())
            .set(min_time as f64 / 1e3);
    }

    #[inline]
    pub fn record_throughput(samples_per_sec: u64) {
        ::metrics::gauge!(THROUGHPUT_SAMPLES_PER_SECOND).set(samples_per_sec as f64);
    }

    pub fn describe_all() {
        describe_counter!(
            INGESTED_SAMPLES,
            Unit::Count,
            "Total number of samples written by the writer pool."
        );
        describe_counter!(
            DUPLICATE_SAMPLES,
            Unit::Count,
            "Total number of samples ignored as duplicates of an existing (series_id, time) row."
        );
        describe_counter!(
            DUPLICATE_WRITES,
            Unit::Count,
            "Total number of bulk inserts that contained at least one duplicate sample."
        );
        describe_counter!(
            DECOMPRESS_CALLS,
            Unit::Count,
            "Total number of compressed regions decompressed to accept backfill."
        );
        describe_gauge!(
            DECOMPRESS_EARLIEST_SECONDS,
            Unit::Seconds,
            "Earliest timestamp decompressed per table."
        );
        describe_gauge!(
            THROUGHPUT_SAMPLES_PER_SECOND,
            "Samples per second acknowledged in asynchronous mode over the last report interval."
        );
    }
}
