//! Per-camera acquisition loop

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use crate::capture::{CameraId, CapturedBuffer, FrameHandle, FrameSource};
use crate::error::{PoolError, SourceError};
use crate::pipeline::ingress::{IngressQueue, PushOutcome};
use crate::pipeline::metrics::{CameraMetrics, DropReason, MetricsTracker};
use crate::pipeline::pool::{FrameBufferPool, SlotGrant};
use crate::pipeline::sync::SynchronizationStage;
use crate::utils::spawn_thread;
use crate::{PipelineConfig, PoolPolicy};

/// Pause after a failed read before asking the source again.
const RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// Drives one camera: waits on its source, parks each capture in a pool
/// slot and queues the handle for the workers.
pub struct AcquisitionStage {
    camera: CameraId,
    config: Arc<PipelineConfig>,
    pool: Arc<FrameBufferPool>,
    ingress: Arc<IngressQueue>,
    metrics: Arc<MetricsTracker>,
    sync: Arc<SynchronizationStage>,
    shutdown: Arc<AtomicBool>,
    next_frame_id: u64,
}

impl AcquisitionStage {
    pub fn new(
        camera: CameraId,
        config: Arc<PipelineConfig>,
        pool: Arc<FrameBufferPool>,
        ingress: Arc<IngressQueue>,
        metrics: Arc<MetricsTracker>,
        sync: Arc<SynchronizationStage>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            camera,
            config,
            pool,
            ingress,
            metrics,
            sync,
            shutdown,
            next_frame_id: 0,
        }
    }

    /// Run the loop on its own named thread.
    pub fn spawn(self, source: Box<dyn FrameSource>) -> io::Result<JoinHandle<()>> {
        spawn_thread(format!("argus-acq-{}", self.camera), move || self.run(source))
    }

    fn camera_metrics(&self) -> Option<&CameraMetrics> {
        self.metrics.camera(self.camera)
    }

    pub fn run(mut self, mut source: Box<dyn FrameSource>) {
        info!(camera = %self.camera, "Acquisition started");
        let timeout = self.config.capture_timeout();

        while !self.shutdown.load(Ordering::Acquire) {
            let captured = match source.wait_for_frame(timeout) {
                Ok(Some(captured)) => captured,
                Ok(None) => continue,
                Err(SourceError::Closed) => {
                    info!(camera = %self.camera, "Frame source closed");
                    break;
                }
                Err(e) => {
                    warn!(camera = %self.camera, "Capture error: {}", e);
                    if let Some(m) = self.camera_metrics() {
                        m.record_error(format!("capture: {e}"));
                    }
                    thread::sleep(RETRY_BACKOFF);
                    continue;
                }
            };
            self.dispatch(captured);
        }

        source.close();
        info!(
            camera = %self.camera,
            frames = self.next_frame_id,
            "Acquisition stopped"
        );
    }

    fn dispatch(&mut self, captured: CapturedBuffer) {
        let frame_id = self.next_frame_id;
        self.next_frame_id += 1;
        if let Some(m) = self.camera_metrics() {
            m.record_capture();
        }

        // Dropping `captured` on any early return hands it back to the driver.
        let Some(grant) = self.claim_slot(frame_id) else {
            return;
        };
        let handle = match self.pool.fill(grant, frame_id, captured) {
            Ok(handle) => handle,
            Err(e) => {
                error!(camera = %self.camera, frame_id, "Failed to fill slot: {}", e);
                return;
            }
        };
        self.sync.expect(self.camera, frame_id, handle.timestamp);

        let outcome = self.ingress.push(
            handle,
            self.config.ingress_policy,
            self.config.ingress_block(),
            &self.shutdown,
            |evicted| self.drop_frame(evicted, DropReason::IngressFull),
        );
        match outcome {
            PushOutcome::Queued => trace!(camera = %self.camera, frame_id, "Frame queued"),
            PushOutcome::Dropped(handle) => self.drop_frame(handle, DropReason::IngressFull),
        }
    }

    /// Find a slot for the next capture according to the pool policy.
    /// `None` means the new frame is dropped.
    fn claim_slot(&self, frame_id: u64) -> Option<SlotGrant> {
        loop {
            match self.pool.acquire_free_slot(self.camera) {
                Ok(grant) => return Some(grant),
                Err(PoolError::Exhausted { .. }) => {}
                Err(e) => {
                    error!(camera = %self.camera, frame_id, "Slot acquisition failed: {}", e);
                    return None;
                }
            }

            match self.config.pool_policy {
                PoolPolicy::DropOldestUnconsumed => {
                    self.record_drop(DropReason::PoolExhausted);
                    match self.pool.reclaim_oldest_unconsumed(self.camera) {
                        Some(reclaimed) => {
                            self.sync.abandon(self.camera, reclaimed);
                            debug!(camera = %self.camera, reclaimed, frame_id, "Pool exhausted, reclaimed oldest frame");
                        }
                        None => {
                            debug!(camera = %self.camera, frame_id, "Every slot leased, dropping new frame");
                            return None;
                        }
                    }
                }
                PoolPolicy::Block => {
                    if self.shutdown.load(Ordering::Acquire) {
                        self.record_drop(DropReason::PoolExhausted);
                        return None;
                    }
                    self.pool
                        .wait_for_free(self.camera, self.config.capture_timeout());
                }
            }
        }
    }

    /// Return the slot of a frame that will never reach a worker. The
    /// ingress queue is shared, so the frame may belong to another camera.
    fn drop_frame(&self, handle: FrameHandle, reason: DropReason) {
        match self.pool.discard(&handle) {
            Ok(()) => {
                debug!(
                    camera = %handle.camera,
                    frame_id = handle.frame_id,
                    ?reason,
                    "Frame dropped"
                );
                if let Some(m) = self.metrics.camera(handle.camera) {
                    m.record_drop(reason);
                }
                self.sync.abandon(handle.camera, handle.frame_id);
            }
            // Already reclaimed and counted by the pool policy.
            Err(PoolError::StaleHandle { .. }) => {}
            Err(e) => error!(
                camera = %handle.camera,
                frame_id = handle.frame_id,
                "Failed to return dropped frame: {}",
                e
            ),
        }
    }

    fn record_drop(&self, reason: DropReason) {
        if let Some(m) = self.camera_metrics() {
            m.record_drop(reason);
        }
    }
}
