use std::sync::Arc;

use crate::labels::Labels;

/// Timestamp type (milliseconds since epoch).
pub type Timestamp = i64;

/// Value type.
pub type Value = f64;

/// A single (timestamp, value) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp: Timestamp,
    pub value: Value,
}

impl Sample {
    pub fn new(timestamp: Timestamp, value: Value) -> Self {
        Sample { timestamp, value }
    }
}

/// Backend-assigned identifier of a series.
///
/// Resolved ids are strictly positive; [`SeriesId::UNRESOLVED`] marks a batch whose
/// labels still have to be looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesId(pub i64);

impl SeriesId {
    pub const UNRESOLVED: SeriesId = SeriesId(-1);

    #[inline]
    pub fn is_resolved(self) -> bool {
        self.0 > 0
    }
}

/// The samples of one series, as produced by the wire-format parser.
#[derive(Debug, Clone)]
pub struct SampleBatch {
    /// Label set of the series. Released once the series id is known.
    pub labels: Option<Arc<Labels>>,
    pub series_id: SeriesId,
    pub samples: Vec<Sample>,
}

impl SampleBatch {
    /// Creates an unresolved batch for the given label set.
    pub fn new(labels: Arc<Labels>, samples: Vec<Sample>) -> Self {
        SampleBatch {
            labels: Some(labels),
            series_id: SeriesId::UNRESOLVED,
            samples,
        }
    }

    /// Creates a batch whose series id is already known.
    pub fn with_series_id(series_id: SeriesId, samples: Vec<Sample>) -> Self {
        SampleBatch {
            labels: None,
            series_id,
            samples,
        }
    }

    /// Returns the number of samples in the batch.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns true if the batch holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// A single row handed to [`Backend::bulk_insert`](crate::backend::Backend::bulk_insert).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InsertRow {
    pub series_id: SeriesId,
    pub timestamp: Timestamp,
    pub value: Value,
}

/// Flattened rows of one flush, ordered by `(series_id, timestamp)`.
///
/// Owned by a pooled buffer so the backing allocation survives across flushes.
#[derive(Debug, Default)]
pub struct InsertRows {
    rows: Vec<InsertRow>,
}

impl InsertRows {
    /// Rebuilds the rows from `batches`, replacing any previous content.
    ///
    /// Fails without touching the backend if any batch still carries an unresolved id.
    pub(crate) fn fill_from(&mut self, batches: &[SampleBatch]) -> Result<(), usize> {
        self.rows.clear();
        for (idx, batch) in batches.iter().enumerate() {
            if !batch.series_id.is_resolved() && !batch.samples.is_empty() {
                self.rows.clear();
                return Err(idx);
            }
            self.rows.extend(batch.samples.iter().map(|s| InsertRow {
                series_id: batch.series_id,
                timestamp: s.timestamp,
                value: s.value,
            }));
        }
        self.rows
            .sort_by(|a, b| (a.series_id, a.timestamp).cmp(&(b.series_id, b.timestamp)));
        Ok(())
    }

    pub(crate) fn clear(&mut self) {
        self.rows.clear();
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, InsertRow> {
        self.rows.iter()
    }

    pub fn as_slice(&self) -> &[InsertRow] {
        &self.rows
    }

    /// Builds rows directly from a slice; mainly useful for backend tests.
    pub fn from_rows(mut rows: Vec<InsertRow>) -> Self {
        rows.sort_by(|a, b| (a.series_id, a.timestamp).cmp(&(b.series_id, b.timestamp)));
        InsertRows { rows }
    }
}

impl<'a> IntoIterator for &'a InsertRows {
    type Item = &'a InsertRow;
    type IntoIter = std::slice::Iter<'a, InsertRow>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_sorted_by_series_then_time() {
        let batches = vec![
            SampleBatch::with_series_id(SeriesId(7), vec![Sample::new(30, 3.0), Sample::new(10, 1.0)]),
            SampleBatch::with_series_id(SeriesId(2), vec![Sample::new(20, 2.0)]),
        ];
        let mut rows = InsertRows::default();
        rows.fill_from(&batches).unwrap();

        let keys: Vec<(i64, Timestamp)> = rows.iter().map(|r| (r.series_id.0, r.timestamp)).collect();
        assert_eq!(keys, vec![(2, 20), (7, 10), (7, 30)]);
    }

    #[test]
    fn test_unresolved_batch_is_rejected() {
        let labels = Arc::new(Labels::new("cpu", [("host", "a")]));
        let batches = vec![
            SampleBatch::with_series_id(SeriesId(1), vec![Sample::new(1, 1.0)]),
            SampleBatch::new(labels, vec![Sample::new(2, 2.0)]),
        ];
        let mut rows = InsertRows::default();
        assert_eq!(rows.fill_from(&batches), Err(1));
        assert!(rows.is_empty(), "rejected fill must not leave partial rows");
    }

    #[test]
    fn test_series_id_resolution_state() {
        assert!(!SeriesId::UNRESOLVED.is_resolved());
        assert!(!SeriesId(0).is_resolved());
        assert!(SeriesId(1).is_resolved());
    }
}
