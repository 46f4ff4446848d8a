//! Background acknowledgments.
//!
//! The pipeline submits jobs and moves on. The worker calls the backend,
//! logs and counts failures and publishes them on a broadcast channel; it
//! never retries, since both ack endpoints are idempotent and off the
//! critical path.

use crate::backend::BackendApi;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AckJob {
    /// `POST /ack/{eventId}`
    Event(String),
    /// `POST /messages/{id}/ack-delivered`
    Delivered(String),
}

#[derive(Clone, Debug)]
pub struct AckFailure {
    pub job: AckJob,
    pub error: String,
}

#[derive(Default)]
struct AckCounters {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

/// Submission side. Cheap to clone.
#[derive(Clone)]
pub struct AckQueue {
    tx: mpsc::UnboundedSender<AckJob>,
    failures: broadcast::Sender<AckFailure>,
    counters: Arc<AckCounters>,
}

impl AckQueue {
    /// Queues a job without waiting. Returns false if the worker is gone.
    pub fn submit(&self, job: AckJob) -> bool {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        match self.tx.send(job) {
            Ok(()) => true,
            Err(mpsc::error::SendError(job)) => {
                warn!("ack: worker stopped, dropping {job:?}");
                false
            }
        }
    }

    pub fn subscribe_failures(&self) -> broadcast::Receiver<AckFailure> {
        self.failures.subscribe()
    }

    pub fn submitted(&self) -> u64 {
        self.counters.submitted.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.counters.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.counters.failed.load(Ordering::Relaxed)
    }
}

/// Drains the queue until every [`AckQueue`] is dropped.
pub struct AckWorker {
    rx: mpsc::UnboundedReceiver<AckJob>,
    backend: Arc<dyn BackendApi>,
    failures: broadcast::Sender<AckFailure>,
    counters: Arc<AckCounters>,
}

pub fn create_ack_worker(backend: Arc<dyn BackendApi>) -> (AckQueue, AckWorker) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (failures, _) = broadcast::channel(64);
    let counters = Arc::new(AckCounters::default());

    let queue = AckQueue {
        tx,
        failures: failures.clone(),
        counters: counters.clone(),
    };
    let worker = AckWorker {
        rx,
        backend,
        failures,
        counters,
    };
    (queue, worker)
}

impl AckWorker {
    pub async fn run(mut self) {
        while let Some(job) = self.rx.recv().await {
            let result = match &job {
                AckJob::Event(id) => self.backend.ack_event(id).await,
                AckJob::Delivered(id) => self.backend.ack_delivered(id).await,
            };
            match result {
                Ok(()) => {
                    self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                    debug!("ack: {job:?} done");
                }
                Err(e) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!("ack: {job:?} failed: {e}");
                    let _ = self.failures.send(AckFailure {
                        job,
                        error: e.to_string(),
                    });
                }
            }
        }
        debug!("ack: worker stopped");
    }
}
