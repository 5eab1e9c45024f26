//! Fan-out of finished results to pullers, callbacks and the synchronizer

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use flume::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use tracing::{trace, warn};

use crate::capture::CameraId;
use crate::pipeline::metrics::MetricsTracker;
use crate::pipeline::result::ExtractionResult;
use crate::pipeline::sync::SynchronizationStage;
use crate::utils::deadline_after;

/// Registration token returned by [`ResultDistributor::register_callback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

pub type ResultCallback = Arc<dyn Fn(&ExtractionResult) + Send + Sync>;

#[derive(Debug, Clone)]
pub enum PullOutcome {
    Ready(ExtractionResult),
    /// A zero-timeout probe found nothing queued.
    Empty,
    TimedOut,
    /// The pipeline stopped and the queue is drained.
    Stopped,
}

impl PullOutcome {
    pub fn ready(self) -> Option<ExtractionResult> {
        match self {
            PullOutcome::Ready(result) => Some(result),
            _ => None,
        }
    }
}

pub struct ResultDistributor {
    // Dropped on close so blocked pullers see a disconnect.
    senders: ArcSwapOption<Vec<Sender<ExtractionResult>>>,
    receivers: Vec<Receiver<ExtractionResult>>,
    callbacks: ArcSwap<Vec<(CallbackId, ResultCallback)>>,
    next_callback: AtomicU64,
    sync: Arc<SynchronizationStage>,
    metrics: Arc<MetricsTracker>,
}

impl ResultDistributor {
    pub fn new(
        camera_count: usize,
        depth: usize,
        sync: Arc<SynchronizationStage>,
        metrics: Arc<MetricsTracker>,
    ) -> Self {
        let (senders, receivers) = (0..camera_count)
            .map(|_| flume::bounded(depth.max(1)))
            .unzip::<_, _, Vec<_>, Vec<_>>();
        Self {
            senders: ArcSwapOption::from_pointee(senders),
            receivers,
            callbacks: ArcSwap::from_pointee(Vec::new()),
            next_callback: AtomicU64::new(1),
            sync,
            metrics,
        }
    }

    /// Hand a result to every consumer. Runs on the worker that produced it.
    pub fn deliver(&self, result: ExtractionResult) {
        let callbacks = self.callbacks.load();
        for (id, callback) in callbacks.iter() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(&result)));
            if outcome.is_err() {
                warn!(
                    callback = id.0,
                    camera = %result.camera,
                    frame_id = result.frame_id,
                    "Result callback panicked"
                );
            }
        }

        self.sync.insert(result.clone());

        let senders = self.senders.load_full();
        let Some(tx) = senders.as_ref().and_then(|s| s.get(result.camera.index())) else {
            return;
        };
        let rx = &self.receivers[result.camera.index()];

        let mut result = result;
        loop {
            match tx.try_send(result) {
                Ok(()) => break,
                Err(TrySendError::Full(r)) => {
                    result = r;
                    if let Ok(oldest) = rx.try_recv() {
                        trace!(camera = %oldest.camera, frame_id = oldest.frame_id, "Result queue overflow");
                        if let Some(m) = self.metrics.camera(oldest.camera) {
                            m.record_result_overflow();
                        }
                    }
                }
                Err(TrySendError::Disconnected(_)) => break,
            }
        }
    }

    /// Next queued result for `camera`, waiting up to `timeout`.
    pub fn pull_next(&self, camera: CameraId, timeout: Duration) -> Option<PullOutcome> {
        let rx = self.receivers.get(camera.index())?;

        let outcome = match rx.try_recv() {
            Ok(result) => PullOutcome::Ready(result),
            Err(TryRecvError::Disconnected) => PullOutcome::Stopped,
            Err(TryRecvError::Empty) if timeout.is_zero() => PullOutcome::Empty,
            Err(TryRecvError::Empty) => match deadline_after(timeout) {
                Some(deadline) => match rx.recv_deadline(deadline) {
                    Ok(result) => PullOutcome::Ready(result),
                    Err(RecvTimeoutError::Timeout) => PullOutcome::TimedOut,
                    Err(RecvTimeoutError::Disconnected) => PullOutcome::Stopped,
                },
                // Past anything `Instant` can hold: wait until a result or close.
                None => rx.recv().map_or(PullOutcome::Stopped, PullOutcome::Ready),
            },
        };
        Some(outcome)
    }

    /// Async flavour of [`pull_next`](Self::pull_next) for tokio consumers.
    pub async fn next_result_async(
        &self,
        camera: CameraId,
        timeout: Duration,
    ) -> Option<PullOutcome> {
        let rx = self.receivers.get(camera.index())?;
        let outcome = match tokio::time::timeout(timeout, rx.recv_async()).await {
            Ok(Ok(result)) => PullOutcome::Ready(result),
            Ok(Err(_)) => PullOutcome::Stopped,
            Err(_) if timeout.is_zero() => PullOutcome::Empty,
            Err(_) => PullOutcome::TimedOut,
        };
        Some(outcome)
    }

    pub fn register_callback(&self, callback: ResultCallback) -> CallbackId {
        let id = CallbackId(self.next_callback.fetch_add(1, Ordering::Relaxed));
        self.callbacks.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push((id, callback.clone()));
            next
        });
        id
    }

    /// Returns false if `id` was not registered.
    pub fn unregister_callback(&self, id: CallbackId) -> bool {
        let previous = self.callbacks.rcu(|current| {
            current
                .iter()
                .filter(|(cid, _)| *cid != id)
                .cloned()
                .collect::<Vec<_>>()
        });
        previous.iter().any(|(cid, _)| *cid == id)
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.load().len()
    }

    pub fn queued(&self, camera: CameraId) -> usize {
        self.receivers.get(camera.index()).map_or(0, Receiver::len)
    }

    /// Stop accepting results. Queued results can still be pulled.
    /// A frame left the pipeline without producing a result.
    pub fn abandon(&self, camera: CameraId, frame_id: u64) {
        self.sync.abandon(camera, frame_id);
    }

    pub fn close(&self) {
        self.senders.store(None);
        self.sync.close();
    }
}
