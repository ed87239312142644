//! Metric name → table name cache shared by all metric workers.

use moka::sync::Cache;

use crate::error::IngestError;

/// Default number of metric → table mappings kept in memory.
pub const DEFAULT_METRIC_CACHE_SIZE: u64 = 10_000;

/// Bounded cache of destination table names. Eviction is up to the implementation.
pub trait MetricCache: std::fmt::Debug + Send + Sync {
    fn get(&self, metric: &str) -> Option<String>;
    fn set(&self, metric: &str, table_name: &str) -> Result<(), IngestError>;
}

/// [`MetricCache`] backed by a `moka` concurrent cache.
#[derive(Debug, Clone)]
pub struct MetricNameCache {
    inner: Cache<String, String>,
}

impl MetricNameCache {
    pub fn with_capacity(max_entries: u64) -> Self {
        MetricNameCache {
            inner: Cache::new(max_entries),
        }
    }

    /// Approximate number of cached entries.
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

impl Default for MetricNameCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_METRIC_CACHE_SIZE)
    }
}

impl MetricCache for MetricNameCache {
    fn get(&self, metric: &str) -> Option<String> {
        self.inner.get(metric)
    }

    fn set(&self, metric: &str, table_name: &str) -> Result<(), IngestError> {
        self.inner.insert(metric.to_string(), table_name.to_string());
        Ok(())
    }
}
