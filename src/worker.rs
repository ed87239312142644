//! Per-metric worker threads.
//!
//! Every metric gets one long-lived thread that owns the metric's pending buffer and series
//! cache. Requests for the same metric are merged in the order they are received and handed
//! to the writer pool in flushes of at most [`FLUSH_SIZE`] sample batches (plus whatever
//! the last request carried).

use std::mem;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{bounded, Receiver, SendError, Sender, TryRecvError};

use crate::backend::{Backend, MetricTable};
use crate::buffer::{PendingBuffer, FLUSH_SIZE};
use crate::cache::MetricCache;
use crate::completion::CompletionTask;
use crate::copier::CopyRequest;
use crate::error::{BackendError, IngestError};
use crate::pool::BufferPool;
use crate::resolver::SeriesCache;
use crate::telemetry::{IngestEvent, IngestEventListener};
use crate::types::SampleBatch;

/// Capacity of each metric worker's input queue.
pub const WORKER_QUEUE_CAPACITY: usize = 1000;

/// The data of one metric from one `insert_data` call.
#[derive(Debug)]
pub(crate) struct InsertRequest {
    pub metric: String,
    pub data: Vec<SampleBatch>,
    pub completion: CompletionTask,
}

/// Everything a worker shares with the rest of the pipeline.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub backend: Arc<dyn Backend>,
    pub metric_tables: Arc<dyn MetricCache>,
    /// Wakes the maintenance thread when a table may need finalizing.
    pub finalize_signal: Sender<()>,
    pub copiers: Sender<CopyRequest>,
    pub pool: Arc<BufferPool>,
    pub events: Arc<dyn IngestEventListener>,
}

/// Spawns the worker for `metric` and returns its input queue.
pub(crate) fn spawn_metric_worker(
    metric: String,
    ctx: WorkerContext,
) -> Result<(Sender<InsertRequest>, JoinHandle<()>), IngestError> {
    let (tx, rx) = bounded(WORKER_QUEUE_CAPACITY);
    let handle = thread::Builder::new()
        .name(format!("tsingest-metric-{}", metric))
        .spawn(move || run_metric_worker(metric, rx, ctx))
        .map_err(|e| IngestError::BackgroundTask(format!("failed to spawn metric worker: {}", e)))?;
    Ok((tx, handle))
}

fn run_metric_worker(metric: String, input: Receiver<InsertRequest>, ctx: WorkerContext) {
    // Until a table name is known, every request is answered individually.
    let (table, first) = loop {
        let req = match input.recv() {
            Ok(req) => req,
            Err(_) => return,
        };
        match initialize_table(&metric, &ctx) {
            Ok(table) => break (table, req),
            Err(err) => {
                ctx.events.on_event(IngestEvent::MetricWorkerInitFailed {
                    metric: metric.clone(),
                    error: err.to_string(),
                });
                req.completion.report_result(Some(IngestError::WorkerInit {
                    metric: metric.clone(),
                    source: Box::new(err),
                }));
            }
        }
    };

    ctx.events.on_event(IngestEvent::MetricWorkerStarted {
        metric: metric.clone(),
    });
    let mut worker = MetricWorker {
        pending: ctx.pool.get(),
        metric,
        table,
        series: SeriesCache::new(),
        ctx,
    };
    worker.handle_request(first);
    worker.run(input);
}

/// Resolves the destination table of `metric`, consulting the shared cache first.
fn initialize_table(metric: &str, ctx: &WorkerContext) -> Result<String, IngestError> {
    if let Some(table) = ctx.metric_tables.get(metric) {
        return Ok(table);
    }
    let MetricTable {
        table_name,
        possibly_new,
    } = ctx.backend.resolve_or_create_table(metric)?;
    if table_name.is_empty() {
        return Err(BackendError::MissingTableName(metric.to_string()).into());
    }
    // A failed cache write only costs another backend lookup later.
    let _ = ctx.metric_tables.set(metric, &table_name);
    if possibly_new {
        let _ = ctx.finalize_signal.try_send(());
    }
    Ok(table_name)
}

struct MetricWorker {
    metric: String,
    table: String,
    series: SeriesCache,
    pending: PendingBuffer,
    ctx: WorkerContext,
}

impl MetricWorker {
    fn run(mut self, input: Receiver<InsertRequest>) {
        loop {
            if !self.pending.has_pending() {
                match input.recv() {
                    Ok(req) => {
                        self.handle_request(req);
                        continue;
                    }
                    Err(_) => break,
                }
            }

            let mut disconnected = false;
            while self.pending.len() < FLUSH_SIZE {
                match input.try_recv() {
                    Ok(req) => self.handle_request(req),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        disconnected = true;
                        break;
                    }
                }
            }
            self.flush_pending();
            if disconnected {
                break;
            }
        }
        self.ctx.pool.put(mem::take(&mut self.pending));
    }

    fn handle_request(&mut self, req: InsertRequest) {
        let InsertRequest {
            metric,
            mut data,
            completion,
        } = req;
        debug_assert_eq!(metric, self.metric);
        self.series.fill_known_series_ids(&mut data);
        if self.pending.add_request(data, completion) {
            self.flush_pending();
        }
    }

    fn flush_pending(&mut self) {
        if !self.pending.has_pending() {
            return;
        }

        if let Err(err) = self.series.resolve_series_ids(
            self.ctx.backend.as_ref(),
            &self.metric,
            self.pending.batch_mut(),
        ) {
            self.ctx.events.on_event(IngestEvent::SeriesResolutionFailed {
                metric: self.metric.clone(),
                requests: self.pending.num_requests(),
                error: err.to_string(),
            });
            self.pending.report_results(Some(&err));
            return;
        }

        let data = mem::replace(&mut self.pending, self.ctx.pool.get());
        let request = CopyRequest {
            data,
            table: self.table.clone(),
        };
        if let Err(SendError(request)) = self.ctx.copiers.send(request) {
            let mut data = request.data;
            data.report_results(Some(&IngestError::Closed));
            self.ctx.pool.put(data);
        }
    }
}
