//! Ingestor configuration and its layered loading (defaults < file < environment).

use std::path::Path;
use std::sync::Arc;

use config::{Config, Environment, File};

use crate::cache::DEFAULT_METRIC_CACHE_SIZE;
use crate::error::IngestError;
use crate::telemetry::{noop_event_listener, IngestEventListener};

/// Default size of the writer pool.
pub const DEFAULT_NUM_COPIERS: i64 = 4;

/// Prefix of environment variables read by [`load_file_config`], e.g. `TSINGEST_NUM_COPIERS`.
pub const ENV_PREFIX: &str = "TSINGEST";

/// Configuration options for the [`Ingestor`](crate::Ingestor).
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Acknowledge `insert_data` before the data is written.
    pub async_acks: bool,
    /// Throughput report interval in seconds; 0 disables. Only used with `async_acks`.
    pub report_interval_secs: u64,
    /// Capacity of the metric → table name cache.
    pub metric_cache_size: u64,
    /// Number of writer threads. Values below 1 are raised to 1.
    pub num_copiers: i64,
    /// Structured event hook for observability (no-op by default).
    pub event_listener: Arc<dyn IngestEventListener>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            async_acks: false,
            report_interval_secs: 0,
            metric_cache_size: DEFAULT_METRIC_CACHE_SIZE,
            num_copiers: DEFAULT_NUM_COPIERS,
            event_listener: noop_event_listener(),
        }
    }
}

/// Partial configuration as read from file and environment. Every field is optional so
/// sources can be layered.
#[derive(Debug, Default, Clone, PartialEq, serde::Deserialize)]
pub struct FileConfig {
    pub async_acks: Option<bool>,
    pub report_interval_secs: Option<u64>,
    pub metric_cache_size: Option<u64>,
    pub num_copiers: Option<i64>,
    /// SQLite database used by the load driver.
    pub db_path: Option<String>,
}

/// Reads `path` (TOML, when given) and `TSINGEST_*` environment variables.
///
/// A missing file is an error; use `None` to read the environment only.
pub fn load_file_config(path: Option<&Path>) -> Result<FileConfig, IngestError> {
    let mut builder = Config::builder();
    if let Some(path) = path {
        if !path.exists() {
            return Err(IngestError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        builder = builder.add_source(File::from(path));
    }
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .ignore_empty(true),
    );

    let merged = builder
        .build()
        .map_err(|e| IngestError::Config(e.to_string()))?;
    merged
        .try_deserialize()
        .map_err(|e| IngestError::Config(e.to_string()))
}

/// Overwrites the fields of `base` that are set in `partial`.
pub fn merge_into_ingest_config(base: &mut IngestConfig, partial: &FileConfig) {
    if let Some(b) = partial.async_acks {
        base.async_acks = b;
    }
    if let Some(secs) = partial.report_interval_secs {
        base.report_interval_secs = secs;
    }
    if let Some(n) = partial.metric_cache_size {
        base.metric_cache_size = n;
    }
    if let Some(n) = partial.num_copiers {
        base.num_copiers = n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_merge_only_overwrites_set_fields() {
        let mut cfg = IngestConfig::default();
        merge_into_ingest_config(
            &mut cfg,
            &FileConfig {
                num_copiers: Some(0),
                async_acks: Some(true),
                ..FileConfig::default()
            },
        );
        assert_eq!(cfg.num_copiers, 0);
        assert!(cfg.async_acks);
        assert_eq!(cfg.metric_cache_size, DEFAULT_METRIC_CACHE_SIZE);
        assert_eq!(cfg.report_interval_secs, 0);
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "num_copiers = 8\nreport_interval_secs = 10\ndb_path = \"/tmp/x.db\"").unwrap();
        let partial = load_file_config(Some(file.path())).unwrap();
        assert_eq!(partial.num_copiers, Some(8));
        assert_eq!(partial.report_interval_secs, Some(10));
        assert_eq!(partial.db_path.as_deref(), Some("/tmp/x.db"));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = load_file_config(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(matches!(err, IngestError::Config(_)));
    }
}
