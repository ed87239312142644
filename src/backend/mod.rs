//! Backend capability contract and the bundled implementations.
//!
//! Any relational engine satisfying [`Backend`] can sit behind the pipeline. The crate ships
//! [`MemoryBackend`] (in-process, supports compressed regions) and [`SqliteBackend`].

mod memory;
mod sqlite;

pub use memory::{BackendCallCounts, MemoryBackend};
pub use sqlite::SqliteBackend;

use std::collections::HashSet;
use std::time::SystemTime;

use crate::error::BackendError;
use crate::labels::Labels;
use crate::types::{InsertRows, SeriesId, Timestamp};

/// Maximum length of a generated table name.
pub const MAX_TABLE_NAME_LEN: usize = 62;

/// Destination table of a metric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricTable {
    pub table_name: String,
    /// True when this call may have created the table; the caller then schedules
    /// [`Backend::finalize_pending_table_creation`].
    pub possibly_new: bool,
}

/// Result of one series resolution call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSeries {
    pub table_name: String,
    pub series_id: SeriesId,
}

/// Operations the ingestion pipeline needs from the storage engine.
///
/// Implementations are shared by every worker thread and must be internally synchronized.
pub trait Backend: Send + Sync {
    /// Returns the table for `metric`, creating it if needed. Idempotent and safe to call
    /// concurrently for the same metric.
    fn resolve_or_create_table(&self, metric: &str) -> Result<MetricTable, BackendError>;

    /// Completes any in-progress table setup. Safe to call with nothing pending.
    fn finalize_pending_table_creation(&self) -> Result<(), BackendError>;

    /// Resolves (or creates) one series per entry of `series`, in order.
    ///
    /// The calls are pipelined in one round trip, but each label set is resolved in its own
    /// transaction so concurrent batches for distinct label sets cannot deadlock.
    fn resolve_series_batch(
        &self,
        metric: &str,
        series: &[&Labels],
    ) -> Result<Vec<ResolvedSeries>, BackendError>;

    /// Inserts `rows` into `table`, ignoring rows that collide on `(series_id, time)`.
    /// Returns the number of rows actually written.
    fn bulk_insert(&self, table: &str, rows: &InsertRows) -> Result<u64, BackendError>;

    /// Delays the background recompression job of `table` until at least `not_before`.
    fn reschedule_background_compaction(
        &self,
        table: &str,
        not_before: SystemTime,
    ) -> Result<(), BackendError>;

    /// Decompresses every region of `table` holding data at or after `min_time`.
    fn decompress_region(&self, table: &str, min_time: Timestamp) -> Result<(), BackendError>;
}

/// Derives a table name for `metric` that does not collide with `taken`.
///
/// Non-alphanumeric characters become `_`, the result is lowercased and truncated, and a
/// numeric suffix is appended on collision.
pub(crate) fn table_name_for(metric: &str, taken: &HashSet<String>) -> String {
    let mut base: String = metric
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    if base.is_empty() || base.starts_with(|c: char| c.is_ascii_digit()) {
        base.insert(0, '_');
    }
    base.truncate(MAX_TABLE_NAME_LEN);

    if !taken.contains(&base) {
        return base;
    }
    let mut n = 1u64;
    loop {
        let suffix = format!("_{}", n);
        let mut candidate = base.clone();
        candidate.truncate(MAX_TABLE_NAME_LEN - suffix.len());
        candidate.push_str(&suffix);
        if !taken.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_sanitized() {
        let taken = HashSet::new();
        assert_eq!(table_name_for("http_requests_total", &taken), "http_requests_total");
        assert_eq!(table_name_for("Node:CPU.seconds", &taken), "node_cpu_seconds");
        assert_eq!(table_name_for("9lives", &taken), "_9lives");
        assert_eq!(table_name_for("", &taken), "_");
    }

    #[test]
    fn test_table_name_collision_gets_suffix() {
        let mut taken = HashSet::new();
        taken.insert("a_b".to_string());
        assert_eq!(table_name_for("a.b", &taken), "a_b_1");
        taken.insert("a_b_1".to_string());
        assert_eq!(table_name_for("a-b", &taken), "a_b_2");
    }

    #[test]
    fn test_table_name_truncated() {
        let long = "x".repeat(100);
        let mut taken = HashSet::new();
        let first = table_name_for(&long, &taken);
        assert_eq!(first.len(), MAX_TABLE_NAME_LEN);
        taken.insert(first);
        let second = table_name_for(&long, &taken);
        assert_eq!(second.len(), MAX_TABLE_NAME_LEN);
        assert!(second.ends_with("_1"));
    }
}
