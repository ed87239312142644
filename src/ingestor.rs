//! The ingestor: public entry point, lazy metric-worker registry, and the background threads
//! that keep the pipeline going (writer pool, table finalization, async acknowledgements,
//! throughput reporting).

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, unbounded, Receiver, RecvTimeoutError, SendError, Sender};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::backend::Backend;
use crate::cache::{MetricCache, MetricNameCache};
use crate::completion::CompletionGroup;
use crate::config::IngestConfig;
use crate::copier::{spawn_copiers, CopierContext, CopyRequest};
use crate::error::IngestError;
use crate::pool::{BufferPool, PoolStatsSnapshot};
use crate::telemetry::{ingest_metrics, IngestEvent, IngestEventListener};
use crate::types::SampleBatch;
use crate::worker::{spawn_metric_worker, InsertRequest, WorkerContext};

/// Result of one [`Ingestor::insert_data`] call.
#[derive(Debug)]
pub struct InsertOutcome {
    /// Samples handed to the pipeline, counted whether or not the write succeeded.
    pub rows_accepted: u64,
    pub result: Result<(), IngestError>,
}

/// Routing state; `None` once the ingestor is closed.
struct Dispatch {
    worker: WorkerContext,
    acks: Option<Sender<PendingAck>>,
}

/// An asynchronous call whose outcome is still being awaited.
struct PendingAck {
    group: CompletionGroup,
    rows: u64,
}

#[derive(Default)]
struct Background {
    copiers: Vec<JoinHandle<()>>,
    maintenance: Option<JoinHandle<()>>,
    reporter: Option<(Sender<()>, JoinHandle<()>)>,
    acker: Option<JoinHandle<()>>,
}

/// Concurrent ingestion pipeline in front of a [`Backend`].
///
/// Each metric is served by its own worker thread, created the first time the metric is
/// seen. Workers batch requests, resolve series ids, and hand flushes to a fixed pool of
/// writer threads.
pub struct Ingestor {
    backend: Arc<dyn Backend>,
    workers: DashMap<String, Sender<InsertRequest>>,
    state: RwLock<Option<Dispatch>>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    background: Mutex<Background>,
    pool: Arc<BufferPool>,
    inserted_samples: Option<Arc<AtomicU64>>,
    config: IngestConfig,
}

impl Ingestor {
    /// Creates an ingestor and starts its background threads.
    ///
    /// Table creation left unfinished by a previous run is completed first; if that fails
    /// the ingestor is not created.
    ///
    /// # Errors
    /// Returns an error if finalization fails or a background thread cannot be spawned.
    pub fn new(
        backend: Arc<dyn Backend>,
        metric_tables: Arc<dyn MetricCache>,
        config: IngestConfig,
    ) -> Result<Self, IngestError> {
        backend.finalize_pending_table_creation()?;

        let events = config.event_listener.clone();
        let num_copiers = if config.num_copiers < 1 {
            events.on_event(IngestEvent::CopierCountClamped {
                requested: config.num_copiers,
            });
            1
        } else {
            config.num_copiers as usize
        };

        let pool = Arc::new(BufferPool::default());
        let (copy_tx, copy_rx) = bounded::<CopyRequest>(num_copiers);
        let copiers = spawn_copiers(
            num_copiers,
            copy_rx,
            CopierContext {
                backend: backend.clone(),
                pool: pool.clone(),
                events: events.clone(),
            },
        )?;

        let (finalize_tx, finalize_rx) = bounded::<()>(1);
        let maintenance = {
            let backend = backend.clone();
            let events = events.clone();
            spawn_named("tsingest-maintenance", move || {
                run_maintenance(finalize_rx, backend, events)
            })?
        };

        let inserted_samples = (config.async_acks && config.report_interval_secs > 0)
            .then(|| Arc::new(AtomicU64::new(0)));

        let reporter = match &inserted_samples {
            Some(counter) => {
                let (stop_tx, stop_rx) = bounded::<()>(1);
                let counter = counter.clone();
                let interval_secs = config.report_interval_secs;
                let events = events.clone();
                let handle = spawn_named("tsingest-reporter", move || {
                    run_reporter(stop_rx, counter, interval_secs, events)
                })?;
                Some((stop_tx, handle))
            }
            None => None,
        };

        let (acks, acker) = if config.async_acks {
            let (tx, rx) = unbounded::<PendingAck>();
            let counter = inserted_samples.clone();
            let events = events.clone();
            let handle = spawn_named("tsingest-acker", move || run_acker(rx, counter, events))?;
            (Some(tx), Some(handle))
        } else {
            (None, None)
        };

        let worker = WorkerContext {
            backend: backend.clone(),
            metric_tables,
            finalize_signal: finalize_tx,
            copiers: copy_tx,
            pool: pool.clone(),
            events,
        };

        Ok(Ingestor {
            backend,
            workers: DashMap::new(),
            state: RwLock::new(Some(Dispatch { worker, acks })),
            worker_handles: Mutex::new(Vec::new()),
            background: Mutex::new(Background {
                copiers,
                maintenance: Some(maintenance),
                reporter,
                acker,
            }),
            pool,
            inserted_samples,
            config,
        })
    }

    /// Creates an ingestor with a [`MetricNameCache`] sized from `config`.
    pub fn with_config(backend: Arc<dyn Backend>, config: IngestConfig) -> Result<Self, IngestError> {
        let cache = Arc::new(MetricNameCache::with_capacity(config.metric_cache_size));
        Self::new(backend, cache, config)
    }

    /// Creates an ingestor with the default configuration.
    pub fn with_defaults(backend: Arc<dyn Backend>) -> Result<Self, IngestError> {
        Self::with_config(backend, IngestConfig::default())
    }

    /// Routes `rows` (metric name → sample batches) to the metric workers.
    ///
    /// In synchronous mode this waits until every metric's data is written and returns the
    /// first error any of them hit. In asynchronous mode it returns as soon as the data is
    /// queued; failures are then only reported as [`IngestEvent::AsyncInsertFailed`].
    ///
    /// `rows_accepted` is the number of samples in `rows` regardless of the outcome.
    pub fn insert_data(&self, rows: HashMap<String, Vec<SampleBatch>>) -> InsertOutcome {
        let rows_accepted: u64 = rows
            .values()
            .flat_map(|batches| batches.iter())
            .map(|batch| batch.len() as u64)
            .sum();
        if rows.is_empty() {
            return InsertOutcome {
                rows_accepted,
                result: Ok(()),
            };
        }

        let group = CompletionGroup::new();
        {
            let state = match self.state.read() {
                Ok(state) => state,
                Err(e) => {
                    return InsertOutcome {
                        rows_accepted,
                        result: Err(e.into()),
                    }
                }
            };
            let dispatch = match state.as_ref() {
                Some(dispatch) => dispatch,
                None => {
                    return InsertOutcome {
                        rows_accepted,
                        result: Err(IngestError::Closed),
                    }
                }
            };

            for (metric, data) in rows {
                let completion = group.task();
                match self.metric_sender(dispatch, &metric) {
                    Ok(tx) => {
                        let req = InsertRequest {
                            metric,
                            data,
                            completion,
                        };
                        if let Err(SendError(req)) = tx.send(req) {
                            req.completion.report_result(Some(IngestError::BackgroundTask(format!(
                                "metric worker for {} is gone",
                                req.metric
                            ))));
                        }
                    }
                    Err(err) => completion.report_result(Some(err)),
                }
            }

            if let Some(acks) = &dispatch.acks {
                let _ = acks.send(PendingAck {
                    group,
                    rows: rows_accepted,
                });
                return InsertOutcome {
                    rows_accepted,
                    result: Ok(()),
                };
            }
        }

        InsertOutcome {
            rows_accepted,
            result: group.wait(),
        }
    }

    /// Returns the input queue of `metric`'s worker, spawning the worker on first use.
    fn metric_sender(
        &self,
        dispatch: &Dispatch,
        metric: &str,
    ) -> Result<Sender<InsertRequest>, IngestError> {
        if let Some(tx) = self.workers.get(metric) {
            return Ok(tx.clone());
        }
        match self.workers.entry(metric.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let (tx, handle) = spawn_metric_worker(metric.to_string(), dispatch.worker.clone())?;
                self.worker_handles.lock()?.push(handle);
                entry.insert(tx.clone());
                Ok(tx)
            }
        }
    }

    /// Completes any table creation the backend still has pending.
    pub fn complete_metric_creation(&self) -> Result<(), IngestError> {
        self.backend.finalize_pending_table_creation()?;
        Ok(())
    }

    /// Number of metric workers started so far.
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Samples acknowledged asynchronously since the last throughput report, when
    /// reporting is enabled.
    pub fn unreported_samples(&self) -> Option<u64> {
        self.inserted_samples
            .as_ref()
            .map(|c| c.load(Ordering::Relaxed))
    }

    pub fn pool_stats(&self) -> PoolStatsSnapshot {
        self.pool.stats()
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Stops accepting data, lets every worker flush what it holds, and joins all threads.
    ///
    /// Calling it again is a no-op. Later `insert_data` calls fail with
    /// [`IngestError::Closed`].
    pub fn close(&self) {
        let dispatch = self
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(dispatch) = dispatch else {
            return;
        };
        drop(dispatch);

        // Workers drain their queues and exit once their sender is gone.
        self.workers.clear();
        let workers = std::mem::take(
            &mut *self
                .worker_handles
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in workers {
            self.join("tsingest-metric", handle);
        }

        let background = std::mem::take(
            &mut *self
                .background
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in background.copiers {
            self.join("tsingest-copier", handle);
        }
        if let Some(handle) = background.acker {
            self.join("tsingest-acker", handle);
        }
        if let Some(handle) = background.maintenance {
            self.join("tsingest-maintenance", handle);
        }
        if let Some((stop, handle)) = background.reporter {
            drop(stop);
            self.join("tsingest-reporter", handle);
        }
    }

    fn join(&self, fallback: &str, handle: JoinHandle<()>) {
        let thread = handle.thread().name().unwrap_or(fallback).to_string();
        if handle.join().is_err() {
            self.config
                .event_listener
                .on_event(IngestEvent::BackgroundThreadPanicked { thread });
        }
    }
}

impl fmt::Debug for Ingestor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ingestor")
            .field("workers", &self.workers.len())
            .field("pool", &self.pool)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Shuts the pipeline down, flushing buffered data.
impl Drop for Ingestor {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_named<F>(name: &str, f: F) -> Result<JoinHandle<()>, IngestError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|e| IngestError::BackgroundTask(format!("failed to spawn {}: {}", name, e)))
}

fn run_maintenance(
    signal: Receiver<()>,
    backend: Arc<dyn Backend>,
    events: Arc<dyn IngestEventListener>,
) {
    for () in signal.iter() {
        if let Err(e) = backend.finalize_pending_table_creation() {
            events.on_event(IngestEvent::FinalizeMetricCreationFailed {
                error: e.to_string(),
            });
        }
    }
}

fn run_acker(
    acks: Receiver<PendingAck>,
    inserted: Option<Arc<AtomicU64>>,
    events: Arc<dyn IngestEventListener>,
) {
    for PendingAck { group, rows } in acks.iter() {
        match group.wait() {
            Ok(()) => {
                if let Some(counter) = &inserted {
                    counter.fetch_add(rows, Ordering::Relaxed);
                }
            }
            Err(err) => events.on_event(IngestEvent::AsyncInsertFailed {
                rows,
                error: err.to_string(),
            }),
        }
    }
}

fn run_reporter(
    stop: Receiver<()>,
    counter: Arc<AtomicU64>,
    interval_secs: u64,
    events: Arc<dyn IngestEventListener>,
) {
    events.on_event(IngestEvent::ThroughputReporterStarted { interval_secs });
    let interval = Duration::from_secs(interval_secs);
    loop {
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                report_throughput(&counter, interval_secs, events.as_ref());
            }
            _ => return,
        }
    }
}

/// Emits one throughput report and resets the counter. Returns samples per second.
pub fn report_throughput(
    counter: &AtomicU64,
    interval_secs: u64,
    events: &dyn IngestEventListener,
) -> u64 {
    let inserted = counter.swap(0, Ordering::Relaxed);
    let samples_per_sec = inserted / interval_secs.max(1);
    ingest_metrics::record_throughput(samples_per_sec);
    events.on_event(IngestEvent::ThroughputReport {
        samples_per_sec,
        interval_secs,
    });
    samples_per_sec
}
