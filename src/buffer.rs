use crate::completion::CompletionTask;
use crate::error::IngestError;
use crate::types::{InsertRows, SampleBatch, Timestamp};

/// Maximum number of sample batches a metric worker accumulates before it flushes to the
/// writer pool. Larger buffers amortize more round trips but lose more writes if the
/// process dies mid-flush.
pub const FLUSH_SIZE: usize = 2000;

/// A unit of write accumulation owned by a metric worker, then by a writer.
///
/// Buffers are recycled through [`BufferPool`](crate::pool::BufferPool); after
/// [`report_results`](PendingBuffer::report_results) every sequence is empty but keeps its
/// allocation.
#[derive(Debug)]
pub struct PendingBuffer {
    needs_response: Vec<CompletionTask>,
    batch: Vec<SampleBatch>,
    min_seen: Timestamp,
    rows: InsertRows,
}

impl Default for PendingBuffer {
    fn default() -> Self {
        PendingBuffer {
            needs_response: Vec::new(),
            batch: Vec::new(),
            min_seen: Timestamp::MAX,
            rows: InsertRows::default(),
        }
    }
}

impl PendingBuffer {
    /// Merges a request into the buffer.
    ///
    /// Returns true when the merged sample-batch count exceeds [`FLUSH_SIZE`].
    pub fn add_request(&mut self, data: Vec<SampleBatch>, completion: CompletionTask) -> bool {
        self.needs_response.push(completion);
        for batch in &data {
            for sample in &batch.samples {
                self.min_seen = self.min_seen.min(sample.timestamp);
            }
        }
        self.batch.extend(data);
        self.batch.len() > FLUSH_SIZE
    }

    /// True if any request is waiting on this buffer.
    pub fn has_pending(&self) -> bool {
        !self.needs_response.is_empty() || !self.batch.is_empty()
    }

    pub fn batch(&self) -> &[SampleBatch] {
        &self.batch
    }

    pub fn batch_mut(&mut self) -> &mut [SampleBatch] {
        &mut self.batch
    }

    /// Number of sample batches accumulated so far.
    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    /// Number of requests waiting on this buffer.
    pub fn num_requests(&self) -> usize {
        self.needs_response.len()
    }

    /// Total number of samples across all batches.
    pub fn num_rows(&self) -> usize {
        self.batch.iter().map(SampleBatch::len).sum()
    }

    /// Oldest sample timestamp merged into the buffer (`Timestamp::MAX` when empty).
    pub fn min_seen(&self) -> Timestamp {
        self.min_seen
    }

    /// Flattens the batch into insert rows, rebuilding them from scratch on every call.
    pub(crate) fn fill_insert_rows(&mut self) -> Result<&InsertRows, IngestError> {
        self.rows.fill_from(&self.batch).map_err(|idx| {
            IngestError::Internal(format!(
                "sample batch {} reached insert with unresolved series id {}",
                idx, self.batch[idx].series_id.0
            ))
        })?;
        Ok(&self.rows)
    }

    /// Reports `err` to every waiting request and resets the buffer for reuse.
    ///
    /// All per-row data is released here, so a pooled buffer holds no label references.
    pub fn report_results(&mut self, err: Option<&IngestError>) {
        for task in self.needs_response.drain(..) {
            task.report_result(err.cloned());
        }
        self.reset();
    }

    fn reset(&mut self) {
        self.batch.clear();
        self.rows.clear();
        self.min_seen = Timestamp::MAX;
    }

    /// Clears a buffer before it goes back on the free list. Any request still attached is
    /// failed rather than silently forgotten.
    pub(crate) fn recycle(&mut self) {
        if !self.needs_response.is_empty() {
            self.report_results(Some(&IngestError::Internal(
                "pending buffer recycled with outstanding requests".to_string(),
            )));
        }
        self.reset();
    }

    /// Capacity of the batch sequence; exposed for pool tests.
    pub fn batch_capacity(&self) -> usize {
        self.batch.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::CompletionGroup;
    use crate::labels::Labels;
    use crate::types::{Sample, SeriesId};
    use std::sync::Arc;

    fn resolved_batches(n: usize) -> Vec<SampleBatch> {
        (0..n)
            .map(|i| SampleBatch::with_series_id(SeriesId(i as i64 + 1), vec![Sample::new(i as i64, 1.0)]))
            .collect()
    }

    #[test]
    fn test_flush_threshold_uses_count_after_merge() {
        let group = CompletionGroup::new();
        let mut buffer = PendingBuffer::default();

        assert!(!buffer.add_request(resolved_batches(FLUSH_SIZE - 1), group.task()));
        // Exactly FLUSH_SIZE is not enough.
        assert!(!buffer.add_request(resolved_batches(1), group.task()));
        assert_eq!(buffer.len(), FLUSH_SIZE);
        assert!(buffer.add_request(resolved_batches(1), group.task()));

        buffer.report_results(None);
        assert!(group.wait().is_ok());
    }

    #[test]
    fn test_single_request_over_threshold_needs_flush() {
        let group = CompletionGroup::new();
        let mut buffer = PendingBuffer::default();
        assert!(buffer.add_request(resolved_batches(FLUSH_SIZE + 1), group.task()));
        buffer.report_results(None);
        group.wait().unwrap();
    }

    #[test]
    fn test_min_seen_tracks_oldest_sample() {
        let group = CompletionGroup::new();
        let mut buffer = PendingBuffer::default();
        assert_eq!(buffer.min_seen(), Timestamp::MAX);

        let data = vec![
            SampleBatch::with_series_id(SeriesId(1), vec![Sample::new(500, 1.0), Sample::new(300, 2.0)]),
            SampleBatch::with_series_id(SeriesId(2), vec![Sample::new(400, 3.0)]),
        ];
        buffer.add_request(data, group.task());
        assert_eq!(buffer.min_seen(), 300);
        assert_eq!(buffer.num_rows(), 3);

        buffer.report_results(None);
        assert_eq!(buffer.min_seen(), Timestamp::MAX);
        group.wait().unwrap();
    }

    #[test]
    fn test_report_results_releases_labels_and_keeps_capacity() {
        let labels = Arc::new(Labels::new("cpu", [("host", "a")]));
        let group = CompletionGroup::new();
        let mut buffer = PendingBuffer::default();

        let data: Vec<SampleBatch> = (0..16)
            .map(|i| SampleBatch::new(labels.clone(), vec![Sample::new(i, 0.0)]))
            .collect();
        buffer.add_request(data, group.task());
        assert_eq!(Arc::strong_count(&labels), 17);

        let err = IngestError::Internal("boom".to_string());
        buffer.report_results(Some(&err));

        assert_eq!(Arc::strong_count(&labels), 1, "buffer kept label references alive");
        assert!(!buffer.has_pending());
        assert!(buffer.batch_capacity() >= 16);
        assert!(matches!(group.wait(), Err(IngestError::Internal(_))));
    }

    #[test]
    fn test_request_without_data_is_still_pending() {
        let group = CompletionGroup::new();
        let mut buffer = PendingBuffer::default();
        buffer.add_request(Vec::new(), group.task());
        assert!(buffer.has_pending());
        assert!(buffer.is_empty());
        buffer.report_results(None);
        group.wait().unwrap();
    }

    #[test]
    fn test_fill_insert_rows_rejects_sentinel() {
        let labels = Arc::new(Labels::new("cpu", [("host", "a")]));
        let group = CompletionGroup::new();
        let mut buffer = PendingBuffer::default();
        buffer.add_request(vec![SampleBatch::new(labels, vec![Sample::new(1, 1.0)])], group.task());

        assert!(matches!(buffer.fill_insert_rows(), Err(IngestError::Internal(_))));
        buffer.report_results(None);
        group.wait().unwrap();
    }
}
