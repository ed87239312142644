use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use super::{table_name_for, Backend, MetricTable, ResolvedSeries};
use crate::error::BackendError;
use crate::labels::Labels;
use crate::types::{InsertRows, SeriesId, Timestamp, Value};

/// In-process backend implementing the full [`Backend`] contract.
///
/// Tables are ordered maps keyed by `(series_id, time)`. A table can be marked compressed
/// below a watermark with [`MemoryBackend::compress_before`]; inserts touching that range
/// fail with [`BackendError::CompressedRegion`] until
/// [`decompress_region`](Backend::decompress_region) moves the watermark.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    calls: CallCounters,
}

#[derive(Debug, Default)]
struct MemoryState {
    /// metric name -> (table name, creation completed)
    metrics: HashMap<String, (String, bool)>,
    /// canonical labels -> series id
    series: HashMap<String, SeriesId>,
    next_series_id: i64,
    tables: HashMap<String, BTreeMap<(SeriesId, Timestamp), Value>>,
    compressed_before: HashMap<String, Timestamp>,
    compaction_not_before: HashMap<String, SystemTime>,
}

#[derive(Debug, Default)]
struct CallCounters {
    resolve_table: AtomicU64,
    finalize: AtomicU64,
    series_batches: AtomicU64,
    series_requests: AtomicU64,
    bulk_inserts: AtomicU64,
    reschedules: AtomicU64,
    decompressions: AtomicU64,
}

/// Snapshot of how often each backend operation was invoked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendCallCounts {
    pub resolve_table: u64,
    pub finalize: u64,
    pub series_batches: u64,
    pub series_requests: u64,
    pub bulk_inserts: u64,
    pub reschedules: u64,
    pub decompressions: u64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, BackendError> {
        self.state
            .lock()
            .map_err(|e| BackendError::Connection(format!("memory backend poisoned: {}", e)))
    }

    /// Marks every region of `table` before `before` as compressed.
    pub fn compress_before(&self, table: &str, before: Timestamp) {
        if let Ok(mut state) = self.lock() {
            state.compressed_before.insert(table.to_string(), before);
        }
    }

    /// Returns the compressed watermark of `table`, if any.
    pub fn compressed_before(&self, table: &str) -> Option<Timestamp> {
        self.lock().ok()?.compressed_before.get(table).copied()
    }

    /// Returns the recompression schedule set for `table`, if any.
    pub fn compaction_not_before(&self, table: &str) -> Option<SystemTime> {
        self.lock().ok()?.compaction_not_before.get(table).copied()
    }

    /// Table name registered for `metric`.
    pub fn table_for(&self, metric: &str) -> Option<String> {
        self.lock().ok()?.metrics.get(metric).map(|(t, _)| t.clone())
    }

    /// True once table creation for `metric` has been finalized.
    pub fn is_finalized(&self, metric: &str) -> bool {
        self.lock()
            .ok()
            .and_then(|s| s.metrics.get(metric).map(|(_, done)| *done))
            .unwrap_or(false)
    }

    /// All rows of `table`, ordered by `(series_id, time)`.
    pub fn rows(&self, table: &str) -> Vec<(SeriesId, Timestamp, Value)> {
        self.lock()
            .ok()
            .and_then(|s| {
                s.tables
                    .get(table)
                    .map(|t| t.iter().map(|(&(id, ts), &v)| (id, ts, v)).collect())
            })
            .unwrap_or_default()
    }

    /// Series id registered for `labels`, if any.
    pub fn series_id(&self, labels: &Labels) -> Option<SeriesId> {
        self.lock().ok()?.series.get(labels.canonical()).copied()
    }

    pub fn call_counts(&self) -> BackendCallCounts {
        let c = &self.calls;
        BackendCallCounts {
            resolve_table: c.resolve_table.load(Ordering::Relaxed),
            finalize: c.finalize.load(Ordering::Relaxed),
            series_batches: c.series_batches.load(Ordering::Relaxed),
            series_requests: c.series_requests.load(Ordering::Relaxed),
            bulk_inserts: c.bulk_inserts.load(Ordering::Relaxed),
            reschedules: c.reschedules.load(Ordering::Relaxed),
            decompressions: c.decompressions.load(Ordering::Relaxed),
        }
    }
}

impl MemoryState {
    fn table_for_metric(&mut self, metric: &str) -> MetricTable {
        if let Some((table_name, _)) = self.metrics.get(metric) {
            return MetricTable {
                table_name: table_name.clone(),
                possibly_new: false,
            };
        }
        let taken: HashSet<String> = self.metrics.values().map(|(t, _)| t.clone()).collect();
        let table_name = table_name_for(metric, &taken);
        self.metrics
            .insert(metric.to_string(), (table_name.clone(), false));
        self.tables.entry(table_name.clone()).or_default();
        MetricTable {
            table_name,
            possibly_new: true,
        }
    }
}

impl Backend for MemoryBackend {
    fn resolve_or_create_table(&self, metric: &str) -> Result<MetricTable, BackendError> {
        self.calls.resolve_table.fetch_add(1, Ordering::Relaxed);
        Ok(self.lock()?.table_for_metric(metric))
    }

    fn finalize_pending_table_creation(&self) -> Result<(), BackendError> {
        self.calls.finalize.fetch_add(1, Ordering::Relaxed);
        let mut state = self.lock()?;
        for (_, done) in state.metrics.values_mut() {
            *done = true;
        }
        Ok(())
    }

    fn resolve_series_batch(
        &self,
        metric: &str,
        series: &[&Labels],
    ) -> Result<Vec<ResolvedSeries>, BackendError> {
        self.calls.series_batches.fetch_add(1, Ordering::Relaxed);
        self.calls
            .series_requests
            .fetch_add(series.len() as u64, Ordering::Relaxed);

        let mut state = self.lock()?;
        let table_name = state.table_for_metric(metric).table_name;
        let mut out = Vec::with_capacity(series.len());
        for labels in series {
            let existing = state.series.get(labels.canonical()).copied();
            let id = match existing {
                Some(id) => id,
                None => {
                    state.next_series_id += 1;
                    let id = SeriesId(state.next_series_id);
                    state.series.insert(labels.canonical().to_string(), id);
                    id
                }
            };
            out.push(ResolvedSeries {
                table_name: table_name.clone(),
                series_id: id,
            });
        }
        Ok(out)
    }

    fn bulk_insert(&self, table: &str, rows: &InsertRows) -> Result<u64, BackendError> {
        self.calls.bulk_inserts.fetch_add(1, Ordering::Relaxed);
        let mut state = self.lock()?;

        if let Some(&before) = state.compressed_before.get(table) {
            if let Some(row) = rows.iter().find(|r| r.timestamp < before) {
                return Err(BackendError::CompressedRegion {
                    table: table.to_string(),
                    message: format!("row at {} falls in a compressed region", row.timestamp),
                });
            }
        }

        let data = state
            .tables
            .get_mut(table)
            .ok_or_else(|| BackendError::Query(format!("relation \"{}\" does not exist", table)))?;
        let mut affected = 0;
        for row in rows {
            if let std::collections::btree_map::Entry::Vacant(slot) =
                data.entry((row.series_id, row.timestamp))
            {
                slot.insert(row.value);
                affected += 1;
            }
        }
        Ok(affected)
    }

    fn reschedule_background_compaction(
        &self,
        table: &str,
        not_before: SystemTime,
    ) -> Result<(), BackendError> {
        self.calls.reschedules.fetch_add(1, Ordering::Relaxed);
        self.lock()?
            .compaction_not_before
            .insert(table.to_string(), not_before);
        Ok(())
    }

    fn decompress_region(&self, table: &str, min_time: Timestamp) -> Result<(), BackendError> {
        self.calls.decompressions.fetch_add(1, Ordering::Relaxed);
        let mut state = self.lock()?;
        if let Some(before) = state.compressed_before.get_mut(table) {
            *before = (*before).min(min_time);
        }
        Ok(())
    }
}
