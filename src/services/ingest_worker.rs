//! Ingest workers - run fixes through the tracker off the listener path
//!
//! Fixes are sharded by device id, so one device's fixes are always handled
//! by the same worker in arrival order. Different devices proceed in
//! parallel; the tracker's per-device lock covers fixes that reach it from
//! elsewhere (HTTP).

use crate::domain::types::{DeviceId, Fix};
use crate::infra::metrics::Metrics;
use crate::services::tracker::Tracker;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Queue delay above which a warning is logged (microseconds)
const QUEUE_DELAY_WARN_US: u64 = 50_000;

/// A fix waiting for a worker
#[derive(Debug)]
pub struct QueuedFix {
    pub fix: Fix,
    /// When the fix was enqueued (for queue delay measurement)
    pub enqueued_at: Instant,
}

/// Why a fix could not be queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    /// The worker's queue is full
    Full,
    /// The worker has stopped
    Closed,
}

/// Routes fixes to the worker that owns their device
#[derive(Clone)]
pub struct FixDispatcher {
    shards: Vec<mpsc::Sender<QueuedFix>>,
    metrics: Arc<Metrics>,
}

impl FixDispatcher {
    #[inline]
    fn shard_for(&self, device_id: DeviceId) -> usize {
        device_id.0.rem_euclid(self.shards.len() as i64) as usize
    }

    /// Queue a fix without waiting; a full queue drops it
    pub fn try_dispatch(&self, fix: Fix) -> Result<(), DispatchError> {
        let shard = self.shard_for(fix.device_id);
        let queued = QueuedFix { fix, enqueued_at: Instant::now() };
        match self.shards[shard].try_send(queued) {
            Ok(()) => {
                self.metrics.set_fix_queue_depth(self.queue_depth() as u64);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.record_fix_dropped();
                Err(DispatchError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DispatchError::Closed),
        }
    }

    /// Fixes currently queued across all workers
    pub fn queue_depth(&self) -> usize {
        self.shards.iter().map(|tx| tx.max_capacity() - tx.capacity()).sum()
    }

    pub fn worker_count(&self) -> usize {
        self.shards.len()
    }
}

/// Worker that ingests one shard of devices
pub struct IngestWorker {
    id: usize,
    tracker: Arc<Tracker>,
    rx: mpsc::Receiver<QueuedFix>,
}

impl IngestWorker {
    /// Run the worker, processing fixes until every dispatcher is dropped
    pub async fn run(mut self) {
        info!(worker = %self.id, "ingest_worker_started");

        while let Some(queued) = self.rx.recv().await {
            let queue_delay_us = queued.enqueued_at.elapsed().as_micros() as u64;
            if queue_delay_us > QUEUE_DELAY_WARN_US {
                warn!(
                    worker = %self.id,
                    device_id = %queued.fix.device_id,
                    queue_delay_us = %queue_delay_us,
                    "ingest_queue_delay_high"
                );
            }

            // Rejections are logged and counted by the tracker
            if let Ok(outcome) = self.tracker.ingest(queued.fix, Utc::now()) {
                debug!(
                    worker = %self.id,
                    device_id = %outcome.fix.device_id,
                    queue_delay_us = %queue_delay_us,
                    "fix_processed"
                );
            }
        }

        info!(worker = %self.id, "ingest_worker_stopped");
    }
}

/// Create the dispatcher and `workers` workers (to be spawned)
///
/// `queue_size` is per worker.
pub fn create_ingest_workers(
    tracker: Arc<Tracker>,
    metrics: Arc<Metrics>,
    workers: usize,
    queue_size: usize,
) -> (FixDispatcher, Vec<IngestWorker>) {
    let workers = workers.max(1);
    let mut shards = Vec::with_capacity(workers);
    let mut handles = Vec::with_capacity(workers);

    for id in 0..workers {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        shards.push(tx);
        handles.push(IngestWorker { id, tracker: tracker.clone(), rx });
    }

    (FixDispatcher { shards, metrics }, handles)
}
