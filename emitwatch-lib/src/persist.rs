//! Fire-and-forget persistence in front of the durable store.
//!
//! The pipeline hands each flushed batch to a [`PersistWorker`] without
//! waiting. The worker runs jobs strictly in submission order on its own task:
//! append the batch, then prune entries past the retention cutoff. Failures
//! are logged and the batch is lost from durable storage; later jobs are
//! unaffected. Store clears travel through the same queue so they are ordered
//! with in-flight appends.

use crate::models::EventRecord;
use crate::store::{LogStore, StoreError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Maximum queued persistence jobs.
pub const PERSIST_CHANNEL_CAPACITY: usize = 64;

/// Persistence queue errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PersistError {
    #[error("Persistence queue is full (capacity: {capacity})")]
    QueueFull { capacity: usize },

    #[error("Persistence worker has stopped")]
    WorkerStopped,

    #[error("Store operation failed: {0}")]
    Store(#[from] StoreError),
}

/// Responder for a clear request.
pub type ClearResponder = oneshot::Sender<Result<(), PersistError>>;

/// One unit of work for the worker.
#[derive(Debug)]
enum PersistJob {
    Batch {
        records: Vec<EventRecord>,
        prune_cutoff_ms: i64,
    },
    Clear {
        respond_to: ClearResponder,
    },
}

/// Handle to the background persistence task.
#[derive(Debug)]
pub struct PersistWorker {
    sender: mpsc::Sender<PersistJob>,
    task: JoinHandle<()>,
}

impl PersistWorker {
    /// Start the worker on the current runtime.
    pub fn spawn(store: Arc<dyn LogStore>) -> Self {
        let (sender, receiver) = mpsc::channel(PERSIST_CHANNEL_CAPACITY);
        let task = tokio::spawn(run(store, receiver).instrument(info_span!("persist_worker")));
        Self { sender, task }
    }

    /// Queue a batch for append-then-prune. Returns `false` if it was dropped.
    pub fn submit(&self, records: Vec<EventRecord>, prune_cutoff_ms: i64) -> bool {
        let count = records.len();
        match self.sender.try_send(PersistJob::Batch {
            records,
            prune_cutoff_ms,
        }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    count = count,
                    capacity = PERSIST_CHANNEL_CAPACITY,
                    "Persistence queue full, batch not persisted"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(count = count, "Persistence worker stopped, batch not persisted");
                false
            }
        }
    }

    /// Queue a store clear. `respond_to` receives the outcome.
    pub fn clear(&self, respond_to: ClearResponder) {
        if let Err(e) = self.sender.try_send(PersistJob::Clear { respond_to }) {
            let (job, err) = match e {
                mpsc::error::TrySendError::Full(job) => (
                    job,
                    PersistError::QueueFull {
                        capacity: PERSIST_CHANNEL_CAPACITY,
                    },
                ),
                mpsc::error::TrySendError::Closed(job) => (job, PersistError::WorkerStopped),
            };
            if let PersistJob::Clear { respond_to } = job {
                drop(respond_to.send(Err(err)));
            }
        }
    }

    /// Stop accepting jobs and wait up to `timeout` for queued ones to finish.
    pub async fn shutdown(self, timeout: Duration) {
        let Self { sender, task } = self;
        drop(sender);
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(())) => debug!("Persistence worker drained"),
            Ok(Err(e)) => error!(error = %e, "Persistence worker panicked"),
            Err(_) => warn!(
                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                "Persistence worker did not drain before timeout"
            ),
        }
    }
}

async fn run(store: Arc<dyn LogStore>, mut receiver: mpsc::Receiver<PersistJob>) {
    while let Some(job) = receiver.recv().await {
        match job {
            PersistJob::Batch {
                records,
                prune_cutoff_ms,
            } => persist_batch(store.as_ref(), &records, prune_cutoff_ms).await,
            PersistJob::Clear { respond_to } => {
                let result = store.clear_all().await.map_err(PersistError::from);
                match result {
                    Ok(()) => info!("Durable log cleared"),
                    Err(ref e) => error!(error = %e, "Failed to clear durable log"),
                }
                // Ignore send result - requester may have given up
                drop(respond_to.send(result));
            }
        }
    }
}

async fn persist_batch(store: &dyn LogStore, records: &[EventRecord], prune_cutoff_ms: i64) {
    if let Err(e) = store.append(records).await {
        error!(
            error = %e,
            count = records.len(),
            "Failed to persist batch"
        );
        return;
    }
    match store.prune_older_than(prune_cutoff_ms).await {
        Ok(0) => {}
        Ok(removed) => debug!(removed = removed, cutoff_ms = prune_cutoff_ms, "Pruned durable log"),
        Err(e) => error!(error = %e, cutoff_ms = prune_cutoff_ms, "Failed to prune durable log"),
    }
}
