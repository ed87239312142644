//! Writer pool: a fixed set of threads draining one shared bounded queue of flushes.
//!
//! Each flush is bulk inserted; an insert rejected because it targets a compressed region
//! gets exactly one decompress-and-retry before the error is reported.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam::channel::Receiver;

use crate::backend::Backend;
use crate::buffer::PendingBuffer;
use crate::error::IngestError;
use crate::pool::BufferPool;
use crate::telemetry::{ingest_metrics, IngestEvent, IngestEventListener};
use crate::types::Timestamp;

/// How much faster than wall-clock time ingestion is assumed to catch up with backfill.
pub const INGEST_SPEEDUP: u32 = 2;
/// Constant slack added to every recompression delay.
pub const COMPACTION_SAFETY_MARGIN: Duration = Duration::from_secs(60 * 60);
/// Upper bound of the recompression delay.
pub const MAX_COMPACTION_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// A flushed buffer on its way to the backend.
#[derive(Debug)]
pub(crate) struct CopyRequest {
    pub data: PendingBuffer,
    pub table: String,
}

#[derive(Clone)]
pub(crate) struct CopierContext {
    pub backend: Arc<dyn Backend>,
    pub pool: Arc<BufferPool>,
    pub events: Arc<dyn IngestEventListener>,
}

/// Starts `n` writer threads on `queue`. They exit once every sender is dropped and the
/// queue is drained.
pub(crate) fn spawn_copiers(
    n: usize,
    queue: Receiver<CopyRequest>,
    ctx: CopierContext,
) -> Result<Vec<JoinHandle<()>>, IngestError> {
    (0..n)
        .map(|i| {
            let queue = queue.clone();
            let ctx = ctx.clone();
            thread::Builder::new()
                .name(format!("tsingest-copier-{}", i))
                .spawn(move || run_copier(queue, ctx))
                .map_err(|e| IngestError::BackgroundTask(format!("failed to spawn copier {}: {}", i, e)))
        })
        .collect()
}

fn run_copier(queue: Receiver<CopyRequest>, ctx: CopierContext) {
    for CopyRequest { mut data, table } in queue.iter() {
        let result = insert_with_recovery(ctx.backend.as_ref(), &table, &mut data, ctx.events.as_ref());
        data.report_results(result.err().as_ref());
        ctx.pool.put(data);
    }
}

/// Inserts the buffer, retrying once if the failure can be repaired by decompression.
///
/// When recovery itself fails the original insert error is returned.
pub(crate) fn insert_with_recovery(
    backend: &dyn Backend,
    table: &str,
    data: &mut PendingBuffer,
    events: &dyn IngestEventListener,
) -> Result<(), IngestError> {
    let err = match do_insert(backend, table, data, events) {
        Ok(()) => return Ok(()),
        Err(err) => err,
    };
    if !try_recovery(backend, table, data.min_seen(), &err, events) {
        return Err(err);
    }
    do_insert(backend, table, data, events)
}

fn do_insert(
    backend: &dyn Backend,
    table: &str,
    data: &mut PendingBuffer,
    events: &dyn IngestEventListener,
) -> Result<(), IngestError> {
    let rows = match data.fill_insert_rows() {
        Ok(rows) => rows,
        Err(err) => {
            events.on_event(IngestEvent::UnresolvedSeriesAtInsert {
                table: table.to_string(),
            });
            return Err(err);
        }
    };
    if rows.is_empty() {
        return Ok(());
    }

    let attempted = rows.len() as u64;
    let inserted = backend.bulk_insert(table, rows)?;
    ingest_metrics::record_ingested_samples(inserted);
    if inserted < attempted {
        let duplicates = attempted - inserted;
        ingest_metrics::record_duplicates(duplicates);
        events.on_event(IngestEvent::DuplicateSamples {
            table: table.to_string(),
            duplicates,
            rows: attempted,
        });
    }
    Ok(())
}

/// Returns true if the failed insert is worth retrying.
fn try_recovery(
    backend: &dyn Backend,
    table: &str,
    min_time: Timestamp,
    err: &IngestError,
    events: &dyn IngestEventListener,
) -> bool {
    match err {
        IngestError::Backend(e) if e.is_compressed_region() => {
            let recovered = decompress_regions(backend, table, min_time, events);
            if !recovered {
                events.on_event(IngestEvent::InsertRecoveryFailed {
                    table: table.to_string(),
                    error: err.to_string(),
                });
            }
            recovered
        }
        IngestError::Backend(e) => {
            events.on_event(IngestEvent::UnexpectedInsertError {
                table: table.to_string(),
                error: e.to_string(),
            });
            false
        }
        _ => false,
    }
}

fn decompress_regions(
    backend: &dyn Backend,
    table: &str,
    min_time: Timestamp,
    events: &dyn IngestEventListener,
) -> bool {
    let now = SystemTime::now();
    let age = age_of(min_time, now);
    let delay = compaction_delay(age);
    events.on_event(IngestEvent::RegionCompressed {
        table: table.to_string(),
        min_time,
        age,
        delay,
    });

    if let Err(e) = backend.reschedule_background_compaction(table, now + delay) {
        events.on_event(IngestEvent::CompactionRescheduleFailed {
            table: table.to_string(),
            error: e.to_string(),
        });
        return false;
    }
    if let Err(e) = backend.decompress_region(table, min_time) {
        events.on_event(IngestEvent::DecompressionFailed {
            table: table.to_string(),
            error: e.to_string(),
        });
        return false;
    }
    ingest_metrics::record_decompression(table, min_time);
    true
}

/// How long to hold off recompression after decompressing data `age` old.
pub fn compaction_delay(age: Duration) -> Duration {
    (age / INGEST_SPEEDUP + COMPACTION_SAFETY_MARGIN).min(MAX_COMPACTION_DELAY)
}

fn age_of(min_time: Timestamp, now: SystemTime) -> Duration {
    let now_ms = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64;
    Duration::from_millis(now_ms.saturating_sub(min_time).max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::completion::CompletionGroup;
    use crate::telemetry::noop_event_listener;
    use crate::types::{Sample, SampleBatch, SeriesId};

    fn buffer_with(group: &CompletionGroup, samples: &[(i64, Timestamp)]) -> PendingBuffer {
        let mut buffer = PendingBuffer::default();
        let data = samples
            .iter()
            .map(|&(id, ts)| SampleBatch::with_series_id(SeriesId(id), vec![Sample::new(ts, 1.0)]))
            .collect();
        buffer.add_request(data, group.task());
        buffer
    }

    #[test]
    fn test_compaction_delay_bounds() {
        assert_eq!(compaction_delay(Duration::ZERO), Duration::from_secs(3600));
        assert_eq!(
            compaction_delay(Duration::from_secs(2 * 3600)),
            Duration::from_secs(2 * 3600)
        );
        assert_eq!(compaction_delay(Duration::from_secs(10 * 86_400)), MAX_COMPACTION_DELAY);
    }

    #[test]
    fn test_age_never_negative() {
        let now = SystemTime::now();
        let future = now.duration_since(UNIX_EPOCH).unwrap().as_millis() as i64 + 60_000;
        assert_eq!(age_of(future, now), Duration::ZERO);
    }

    #[test]
    fn test_compressed_region_recovered_once() {
        let backend = MemoryBackend::new();
        let table = backend.resolve_or_create_table("cpu").unwrap().table_name;
        backend.compress_before(&table, 1_000);

        let group = CompletionGroup::new();
        let mut buffer = buffer_with(&group, &[(1, 100), (1, 2_000)]);
        let events = noop_event_listener();
        insert_with_recovery(&backend, &table, &mut buffer, events.as_ref()).unwrap();

        let calls = backend.call_counts();
        assert_eq!(calls.bulk_inserts, 2);
        assert_eq!(calls.reschedules, 1);
        assert_eq!(calls.decompressions, 1);
        assert_eq!(backend.compressed_before(&table), Some(100));
        assert_eq!(backend.rows(&table).len(), 2);

        buffer.report_results(None);
        group.wait().unwrap();
    }

    #[test]
    fn test_empty_buffer_skips_backend() {
        let backend = MemoryBackend::new();
        let group = CompletionGroup::new();
        let mut buffer = buffer_with(&group, &[]);
        let events = noop_event_listener();
        insert_with_recovery(&backend, "cpu", &mut buffer, events.as_ref()).unwrap();
        assert_eq!(backend.call_counts().bulk_inserts, 0);
        buffer.report_results(None);
        group.wait().unwrap();
    }
}
