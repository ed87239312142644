//! Fan-in completion for one `insert_data` call.
//!
//! A [`CompletionGroup`] hands out one [`CompletionTask`] per routed sub-request. Each task
//! counts down a shared wait group and may deposit an error into a single-slot carrier.
//! Reporting never blocks: when the slot is already occupied the new error is dropped, so
//! only the first error of a call is ever surfaced.

use crossbeam::channel::{bounded, Receiver, Sender};
use crossbeam::sync::WaitGroup;

use crate::error::IngestError;

/// Waiting side of a set of completion tasks.
#[derive(Debug)]
pub struct CompletionGroup {
    done: WaitGroup,
    errors_tx: Sender<IngestError>,
    errors_rx: Receiver<IngestError>,
}

impl CompletionGroup {
    pub fn new() -> Self {
        let (errors_tx, errors_rx) = bounded(1);
        CompletionGroup {
            done: WaitGroup::new(),
            errors_tx,
            errors_rx,
        }
    }

    /// Registers one more outstanding task.
    pub fn task(&self) -> CompletionTask {
        CompletionTask {
            done: Some(self.done.clone()),
            errors: self.errors_tx.clone(),
        }
    }

    /// Blocks until every task handed out by this group has reported (or been dropped),
    /// then returns the retained error, if any.
    pub fn wait(self) -> Result<(), IngestError> {
        let CompletionGroup {
            done,
            errors_tx,
            errors_rx,
        } = self;
        drop(errors_tx);
        done.wait();
        match errors_rx.try_recv() {
            Ok(err) => Err(err),
            Err(_) => Ok(()),
        }
    }
}

impl Default for CompletionGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// Reporting side of one routed request.
///
/// Dropping a task without reporting counts as a failure, so a waiter can never hang on a
/// request whose worker went away.
#[derive(Debug)]
pub struct CompletionTask {
    done: Option<WaitGroup>,
    errors: Sender<IngestError>,
}

impl CompletionTask {
    /// Reports the outcome of the request. Must never block: this sits on a path that
    /// other threads are waiting on.
    pub fn report_result(mut self, err: Option<IngestError>) {
        if let Some(done) = self.done.take() {
            if let Some(err) = err {
                self.offer(err);
            }
            drop(done);
        }
    }

    fn offer(&self, err: IngestError) {
        // Slot full or waiter gone: the error is dropped.
        let _ = self.errors.try_send(err);
    }
}

impl Drop for CompletionTask {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            self.offer(IngestError::BackgroundTask(
                "insert request dropped before completion".to_string(),
            ));
            drop(done);
        }
    }
}
