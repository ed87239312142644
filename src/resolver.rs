//! Series id resolution for one metric worker.
//!
//! Each worker owns a [`SeriesCache`]; nothing here is shared between threads.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::Backend;
use crate::error::IngestError;
use crate::labels::Labels;
use crate::types::{SampleBatch, SeriesId};

/// Worker-local map from canonical label strings to series ids.
#[derive(Debug, Default)]
pub struct SeriesCache {
    ids: HashMap<String, SeriesId>,
}

impl SeriesCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn get(&self, labels: &Labels) -> Option<SeriesId> {
        self.ids.get(labels.canonical()).copied()
    }

    /// Fills in every id already known to this cache and releases the matching labels.
    ///
    /// Returns how many batches remain unresolved. Calling it twice is harmless.
    pub fn fill_known_series_ids(&self, batches: &mut [SampleBatch]) -> usize {
        let mut missing = 0;
        for batch in batches.iter_mut() {
            if batch.series_id.is_resolved() {
                continue;
            }
            let known = batch.labels.as_deref().and_then(|labels| self.get(labels));
            match known {
                Some(id) => {
                    batch.series_id = id;
                    batch.labels = None;
                }
                None => missing += 1,
            }
        }
        missing
    }

    /// Resolves every still-unresolved batch with a single backend round trip.
    ///
    /// Batches sharing a label set are grouped so each distinct series is requested once.
    /// On error no batch is modified beyond what [`fill_known_series_ids`] already did.
    ///
    /// [`fill_known_series_ids`]: SeriesCache::fill_known_series_ids
    pub fn resolve_series_ids(
        &mut self,
        backend: &dyn Backend,
        metric: &str,
        batches: &mut [SampleBatch],
    ) -> Result<(), IngestError> {
        let mut unresolved: Vec<(Arc<Labels>, usize)> = Vec::new();
        for (idx, batch) in batches.iter().enumerate() {
            if batch.series_id.is_resolved() {
                continue;
            }
            let labels = batch.labels.clone().ok_or_else(|| {
                IngestError::Internal(format!(
                    "sample batch {} of metric {} has neither series id nor labels",
                    idx, metric
                ))
            })?;
            unresolved.push((labels, idx));
        }
        if unresolved.is_empty() {
            return Ok(());
        }
        unresolved.sort_by(|a, b| a.0.cmp(&b.0));

        let mut groups: Vec<(Arc<Labels>, Vec<usize>)> = Vec::new();
        for (labels, idx) in unresolved {
            match groups.last_mut() {
                Some((last, members)) if **last == *labels => members.push(idx),
                _ => groups.push((labels, vec![idx])),
            }
        }

        let requests: Vec<&Labels> = groups.iter().map(|(labels, _)| labels.as_ref()).collect();
        let resolved = backend
            .resolve_series_batch(metric, &requests)
            .map_err(IngestError::SeriesResolution)?;

        if resolved.len() != groups.len() {
            return Err(IngestError::Internal(format!(
                "series resolution for {} returned {} ids for {} label sets",
                metric,
                resolved.len(),
                groups.len()
            )));
        }
        if let Some(bad) = resolved.iter().find(|r| !r.series_id.is_resolved()) {
            return Err(IngestError::Internal(format!(
                "backend returned non-positive series id {} for metric {}",
                bad.series_id.0, metric
            )));
        }

        for ((labels, members), result) in groups.into_iter().zip(resolved) {
            for idx in members {
                let batch = &mut batches[idx];
                batch.series_id = result.series_id;
                batch.labels = None;
            }
            self.ids.insert(labels.canonical().to_string(), result.series_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::types::Sample;

    fn batch(labels: &Arc<Labels>, ts: i64) -> SampleBatch {
        SampleBatch::new(labels.clone(), vec![Sample::new(ts, 1.0)])
    }

    #[test]
    fn test_duplicate_label_sets_resolved_once() {
        let backend = MemoryBackend::new();
        let a = Arc::new(Labels::new("cpu", [("host", "a")]));
        let b = Arc::new(Labels::new("cpu", [("host", "b")]));
        let mut batches = vec![batch(&b, 1), batch(&a, 2), batch(&b, 3), batch(&a, 4)];

        let mut cache = SeriesCache::new();
        assert_eq!(cache.fill_known_series_ids(&mut batches), 4);
        cache.resolve_series_ids(&backend, "cpu", &mut batches).unwrap();

        let calls = backend.call_counts();
        assert_eq!(calls.series_batches, 1);
        assert_eq!(calls.series_requests, 2);
        assert_eq!(batches[0].series_id, batches[2].series_id);
        assert_eq!(batches[1].series_id, batches[3].series_id);
        assert_ne!(batches[0].series_id, batches[1].series_id);
        assert!(batches.iter().all(|b| b.labels.is_none()));
        assert_eq!(Arc::strong_count(&a), 1);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_cached_ids_skip_backend() {
        let backend = MemoryBackend::new();
        let a = Arc::new(Labels::new("cpu", [("host", "a")]));
        let mut cache = SeriesCache::new();
        let mut first = vec![batch(&a, 1)];
        cache.resolve_series_ids(&backend, "cpu", &mut first).unwrap();

        let mut second = vec![batch(&a, 2)];
        assert_eq!(cache.fill_known_series_ids(&mut second), 0);
        assert_eq!(cache.fill_known_series_ids(&mut second), 0);
        cache.resolve_series_ids(&backend, "cpu", &mut second).unwrap();
        assert_eq!(second[0].series_id, first[0].series_id);
        assert_eq!(backend.call_counts().series_batches, 1);
    }

    #[test]
    fn test_missing_labels_is_internal_error() {
        let backend = MemoryBackend::new();
        let mut batches = vec![SampleBatch {
            labels: None,
            series_id: SeriesId::UNRESOLVED,
            samples: vec![Sample::new(1, 1.0)],
        }];
        let err = SeriesCache::new()
            .resolve_series_ids(&backend, "cpu", &mut batches)
            .unwrap_err();
        assert!(matches!(err, IngestError::Internal(_)));
        assert_eq!(backend.call_counts().series_batches, 0);
    }
}
