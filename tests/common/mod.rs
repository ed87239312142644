#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use tsingest::backend::{MetricTable, ResolvedSeries};
use tsingest::types::{InsertRow, InsertRows};
use tsingest::{
    Backend, BackendError, IngestEvent, IngestEventListener, Labels, MemoryBackend, Sample,
    SampleBatch, Timestamp,
};

/// Listener that keeps every event for later inspection.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<IngestEvent>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<IngestEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&IngestEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }
}

impl IngestEventListener for RecordingListener {
    fn on_event(&self, event: IngestEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Switches for [`FaultyBackend`]. Counters fail the next N calls.
#[derive(Debug, Default)]
pub struct Faults {
    pub resolve_table_failures: AtomicUsize,
    pub finalize_failures: AtomicUsize,
    pub series_failures: AtomicUsize,
    pub drop_one_series_result: AtomicBool,
    pub reschedule_fails: AtomicBool,
    pub decompress_fails: AtomicBool,
    /// Decompression reports success but leaves the region compressed.
    pub decompress_is_noop: AtomicBool,
    /// While set, `bulk_insert` blocks.
    pub inserts_paused: AtomicBool,
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// [`MemoryBackend`] with fault injection and a log of every bulk insert.
#[derive(Debug, Default)]
pub struct FaultyBackend {
    pub inner: MemoryBackend,
    pub faults: Faults,
    inserts: Mutex<Vec<(String, Vec<InsertRow>)>>,
    table_threads: Mutex<Vec<Option<String>>>,
}

impl FaultyBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every `bulk_insert` call seen so far, in order.
    pub fn inserts(&self) -> Vec<(String, Vec<InsertRow>)> {
        self.inserts.lock().unwrap().clone()
    }

    /// Names of the threads that called `resolve_or_create_table`.
    pub fn table_threads(&self) -> Vec<Option<String>> {
        self.table_threads.lock().unwrap().clone()
    }
}

impl Backend for FaultyBackend {
    fn resolve_or_create_table(&self, metric: &str) -> Result<MetricTable, BackendError> {
        self.table_threads
            .lock()
            .unwrap()
            .push(thread::current().name().map(str::to_string));
        if take_failure(&self.faults.resolve_table_failures) {
            return Err(BackendError::Connection("injected table failure".to_string()));
        }
        self.inner.resolve_or_create_table(metric)
    }

    fn finalize_pending_table_creation(&self) -> Result<(), BackendError> {
        if take_failure(&self.faults.finalize_failures) {
            return Err(BackendError::Query("injected finalize failure".to_string()));
        }
        self.inner.finalize_pending_table_creation()
    }

    fn resolve_series_batch(
        &self,
        metric: &str,
        series: &[&Labels],
    ) -> Result<Vec<ResolvedSeries>, BackendError> {
        if take_failure(&self.faults.series_failures) {
            return Err(BackendError::Query("injected series failure".to_string()));
        }
        let mut out = self.inner.resolve_series_batch(metric, series)?;
        if self.faults.drop_one_series_result.load(Ordering::SeqCst) {
            out.pop();
        }
        Ok(out)
    }

    fn bulk_insert(&self, table: &str, rows: &InsertRows) -> Result<u64, BackendError> {
        while self.faults.inserts_paused.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }
        self.inserts
            .lock()
            .unwrap()
            .push((table.to_string(), rows.as_slice().to_vec()));
        self.inner.bulk_insert(table, rows)
    }

    fn reschedule_background_compaction(
        &self,
        table: &str,
        not_before: SystemTime,
    ) -> Result<(), BackendError> {
        if self.faults.reschedule_fails.load(Ordering::SeqCst) {
            return Err(BackendError::Query("injected reschedule failure".to_string()));
        }
        self.inner.reschedule_background_compaction(table, not_before)
    }

    fn decompress_region(&self, table: &str, min_time: Timestamp) -> Result<(), BackendError> {
        if self.faults.decompress_fails.load(Ordering::SeqCst) {
            return Err(BackendError::Query("injected decompress failure".to_string()));
        }
        if self.faults.decompress_is_noop.load(Ordering::SeqCst) {
            // Still counted by the inner backend, but the watermark stays put.
            let watermark = self.inner.compressed_before(table);
            self.inner.decompress_region(table, min_time)?;
            if let Some(before) = watermark {
                self.inner.compress_before(table, before);
            }
            return Ok(());
        }
        self.inner.decompress_region(table, min_time)
    }
}

/// One metric with one series per `(host, timestamps)` entry.
pub fn metric_rows(
    metric: &str,
    series: &[(&str, &[Timestamp])],
) -> HashMap<String, Vec<SampleBatch>> {
    let batches = series
        .iter()
        .map(|(host, timestamps)| {
            let labels = Arc::new(Labels::new(metric, [("host", *host)]));
            let samples = timestamps.iter().map(|&t| Sample::new(t, t as f64)).collect();
            SampleBatch::new(labels, samples)
        })
        .collect();
    HashMap::from([(metric.to_string(), batches)])
}

/// Polls `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}
