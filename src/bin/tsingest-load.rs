//! Load driver for the tsingest pipeline.
//!
//! Loads configuration from (in precedence order): defaults, config file, environment variables
//! (`TSINGEST_*`), and CLI flags. Opens a backend, pushes synthetic samples through
//! [`Ingestor::insert_data`] and reports how long it took.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use clap::Parser;
use tracing_subscriber::EnvFilter;
use tsingest::config::{load_file_config, merge_into_ingest_config, FileConfig};
use tsingest::{
    Backend, IngestConfig, Ingestor, Labels, MemoryBackend, Sample, SampleBatch, SqliteBackend,
    TracingEventListener,
};

const DEFAULT_CONFIG_PATH: &str = "tsingest.toml";
const DEFAULT_DB_PATH: &str = "./tsingest.db";

// ---------- CLI ----------

/// Push synthetic time-series data through the ingestion pipeline.
#[derive(Parser, Debug)]
#[command(name = "tsingest-load", version, about)]
pub struct Cli {
    /// Path to config file (TOML). If omitted, `tsingest.toml` is loaded when it exists.
    #[arg(long, env = "TSINGEST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Do not load any config file; use defaults + env + CLI only.
    #[arg(long, default_value_t = false)]
    pub no_config: bool,

    /// Load and validate config (file + env + CLI), print the effective values, then exit.
    #[arg(long, default_value_t = false)]
    pub validate_config: bool,

    /// SQLite database file to write into.
    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// Write into the in-process memory backend instead of SQLite.
    #[arg(long, default_value_t = false)]
    pub memory: bool,

    /// Number of writer threads.
    #[arg(long, allow_negative_numbers = true)]
    pub num_copiers: Option<i64>,

    /// Acknowledge inserts before they are written.
    #[arg(long)]
    pub async_acks: Option<bool>,

    /// Throughput report interval in seconds (async mode only).
    #[arg(long)]
    pub report_interval_secs: Option<u64>,

    /// Metric name cache capacity.
    #[arg(long)]
    pub metric_cache_size: Option<u64>,

    /// Number of distinct metrics per batch.
    #[arg(long, default_value_t = 4)]
    pub metrics: usize,

    /// Number of series per metric.
    #[arg(long, default_value_t = 100)]
    pub series: usize,

    /// Samples per series per batch.
    #[arg(long, default_value_t = 10)]
    pub samples: usize,

    /// Number of `insert_data` calls.
    #[arg(long, default_value_t = 10)]
    pub batches: usize,
}

/// Effective settings after layering.
#[derive(Debug)]
struct LoadOptions {
    ingest: IngestConfig,
    db_path: PathBuf,
}

/// Load merged config. CLI overrides file/env.
fn load_config(cli: &Cli) -> Result<LoadOptions, String> {
    let path = if cli.no_config {
        None
    } else if let Some(path) = &cli.config {
        Some(path.clone())
    } else {
        let default_path = PathBuf::from(DEFAULT_CONFIG_PATH);
        default_path.exists().then_some(default_path)
    };

    let mut partial = load_file_config(path.as_deref()).map_err(|e| e.to_string())?;
    apply_cli_overrides(&mut partial, cli);

    let mut ingest = IngestConfig::default();
    merge_into_ingest_config(&mut ingest, &partial);

    let db_path = partial
        .db_path
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));
    Ok(LoadOptions { ingest, db_path })
}

fn apply_cli_overrides(partial: &mut FileConfig, cli: &Cli) {
    if let Some(n) = cli.num_copiers {
        partial.num_copiers = Some(n);
    }
    if let Some(b) = cli.async_acks {
        partial.async_acks = Some(b);
    }
    if let Some(secs) = cli.report_interval_secs {
        partial.report_interval_secs = Some(secs);
    }
    if let Some(n) = cli.metric_cache_size {
        partial.metric_cache_size = Some(n);
    }
    if let Some(p) = &cli.db_path {
        partial.db_path = Some(p.display().to_string());
    }
}

// ---------- Synthetic data ----------

struct Workload {
    /// metric name -> label sets of its series
    series: Vec<(String, Vec<Arc<Labels>>)>,
    samples: usize,
    start_ms: i64,
}

impl Workload {
    fn new(metrics: usize, series: usize, samples: usize) -> Self {
        let series = (0..metrics)
            .map(|m| {
                let metric = format!("load_metric_{}", m);
                let labels = (0..series)
                    .map(|s| {
                        Arc::new(Labels::new(
                            &metric,
                            [("instance", format!("host-{}", s)), ("job", "load".to_string())],
                        ))
                    })
                    .collect();
                (metric, labels)
            })
            .collect();
        let start_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        Workload {
            series,
            samples,
            start_ms,
        }
    }

    fn batch(&self, round: usize) -> HashMap<String, Vec<SampleBatch>> {
        self.series
            .iter()
            .map(|(metric, labels)| {
                let batches = labels
                    .iter()
                    .map(|l| {
                        let samples = (0..self.samples)
                            .map(|i| {
                                let ts = self.start_ms + ((round * self.samples + i) as i64) * 1_000;
                                Sample::new(ts, (round + i) as f64)
                            })
                            .collect();
                        SampleBatch::new(l.clone(), samples)
                    })
                    .collect();
                (metric.clone(), batches)
            })
            .collect()
    }
}

// ---------- Main ----------

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    let mut options = load_config(&cli).map_err(|e| {
        eprintln!("config error: {}", e);
        e
    })?;

    if cli.validate_config {
        println!("num_copiers={}", options.ingest.num_copiers);
        println!("async_acks={}", options.ingest.async_acks);
        println!("report_interval_secs={}", options.ingest.report_interval_secs);
        println!("metric_cache_size={}", options.ingest.metric_cache_size);
        println!("db_path={}", options.db_path.display());
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    options.ingest.event_listener = Arc::new(TracingEventListener);

    let backend: Arc<dyn Backend> = if cli.memory {
        Arc::new(MemoryBackend::new())
    } else {
        Arc::new(SqliteBackend::open(&options.db_path).map_err(|e| {
            eprintln!("failed to open {}: {}", options.db_path.display(), e);
            e
        })?)
    };

    let ingestor = Ingestor::with_config(backend, options.ingest)?;
    let workload = Workload::new(cli.metrics, cli.series, cli.samples);

    let started = Instant::now();
    let mut accepted = 0u64;
    let mut failed = 0usize;
    for round in 0..cli.batches {
        let outcome = ingestor.insert_data(workload.batch(round));
        accepted += outcome.rows_accepted;
        if let Err(e) = outcome.result {
            failed += 1;
            tracing::error!(round, err = %e, "insert failed");
        }
    }
    ingestor.close();
    let elapsed = started.elapsed();

    let rate = accepted as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    println!(
        "accepted {} samples in {:.3}s ({:.0} samples/s), {} failed calls",
        accepted,
        elapsed.as_secs_f64(),
        rate,
        failed
    );
    Ok(())
}
