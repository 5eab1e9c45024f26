//! Fixed pool of extraction workers

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, debug_span, error, info, trace, warn};

use crate::capture::FrameHandle;
use crate::error::{InferenceError, PipelineError, PoolError, PANIC_CODE};
use crate::inference::{Extraction, ExtractionConfig, InferenceEngine, Keypoint, ViewKind};
use crate::pipeline::distributor::ResultDistributor;
use crate::pipeline::ingress::IngressQueue;
use crate::pipeline::metrics::{CameraMetrics, DropReason, MetricsTracker};
use crate::pipeline::pool::FrameBufferPool;
use crate::pipeline::result::{ExtractionResult, ExtractionStatus};
use crate::utils::{pin_current_thread, spawn_thread};

/// Longest a worker waits on the ingress queue before rechecking shutdown.
const POP_SLICE: Duration = Duration::from_millis(20);

/// Everything a worker touches, shared by the whole pool.
pub struct WorkerContext {
    pub pool: Arc<FrameBufferPool>,
    pub ingress: Arc<IngressQueue>,
    pub metrics: Arc<MetricsTracker>,
    pub distributor: Arc<ResultDistributor>,
    pub engine: Arc<dyn InferenceEngine>,
    pub extraction: ExtractionConfig,
    /// Runtime zero-copy switch
    pub zero_copy: Arc<AtomicBool>,
    /// Per camera: source exports DMA, engine accepts it, config allows it
    pub dma_capable: Vec<bool>,
    pub shutdown: Arc<AtomicBool>,
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "engine panicked".to_string()
    }
}

impl WorkerContext {
    /// Lease, extract, release, deliver. Every lease taken here is
    /// released before returning.
    pub fn process(&self, handle: FrameHandle) {
        let Some(metrics) = self.metrics.camera(handle.camera) else {
            error!(camera = %handle.camera, "Frame from unknown camera");
            return;
        };
        let _span = debug_span!("extract", camera = %handle.camera, frame_id = handle.frame_id).entered();

        match self.pool.lease(&handle) {
            Ok(()) => {}
            Err(PoolError::StaleHandle { .. }) => {
                // Reclaimed by the pool policy while queued.
                trace!("Skipping reclaimed frame");
                metrics.record_stale();
                return;
            }
            Err(e) => {
                error!("Lease failed: {}", e);
                metrics.record_error(format!("frame {}: {e}", handle.frame_id));
                self.distributor.abandon(handle.camera, handle.frame_id);
                return;
            }
        }

        let allow_dma = self.zero_copy.load(Ordering::Relaxed)
            && self.dma_capable.get(handle.camera.index()).copied().unwrap_or(false);

        let started = Instant::now();
        let extracted = self
            .pool
            .map_for_zero_copy(&handle, allow_dma)
            .map(|input| {
                let path = input.view.kind();
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    self.engine.extract(&input, &self.extraction)
                }))
                .unwrap_or_else(|payload| {
                    Err(InferenceError::Failed {
                        code: PANIC_CODE,
                        message: panic_message(payload),
                    })
                });
                (path, outcome)
            });
        let processing = started.elapsed();

        self.release(&handle, metrics);

        let (path, outcome) = match extracted {
            Ok(extracted) => extracted,
            Err(e) => {
                error!("Failed to map leased buffer: {}", e);
                metrics.record_error(format!("frame {}: {e}", handle.frame_id));
                self.distributor.abandon(handle.camera, handle.frame_id);
                return;
            }
        };

        if self.shutdown.load(Ordering::Acquire) {
            debug!("Pipeline stopping, discarding result");
            metrics.record_drop(DropReason::Shutdown);
            self.distributor.abandon(handle.camera, handle.frame_id);
            return;
        }

        let result = self.build_result(&handle, processing, path, outcome);
        metrics.record_extraction(&result);
        self.distributor.deliver(result);
    }

    fn release(&self, handle: &FrameHandle, metrics: &CameraMetrics) {
        if let Err(e) = self.pool.release(handle) {
            error!("Release failed: {}", e);
            metrics.record_error(format!("frame {}: {e}", handle.frame_id));
        }
    }

    fn build_result(
        &self,
        handle: &FrameHandle,
        processing: Duration,
        path: ViewKind,
        outcome: Result<Extraction, InferenceError>,
    ) -> ExtractionResult {
        let (keypoints, descriptors, status): (Arc<[Keypoint]>, Bytes, ExtractionStatus) = match outcome {
            Ok(extraction) => (
                extraction.keypoints.into(),
                extraction.descriptors,
                ExtractionStatus::Ok,
            ),
            Err(e) => {
                warn!(?path, "Extraction failed: {}", e);
                let message = match e {
                    InferenceError::Failed { ref message, .. } => message.clone(),
                    ref other => other.to_string(),
                };
                (
                    Arc::from(Vec::new()),
                    Bytes::new(),
                    ExtractionStatus::Failed {
                        code: e.code(),
                        message: message.into(),
                    },
                )
            }
        };

        ExtractionResult {
            camera: handle.camera,
            frame_id: handle.frame_id,
            timestamp: handle.timestamp,
            keypoints,
            descriptors,
            descriptor_len: self.extraction.descriptor_len,
            processing,
            path,
            status,
        }
    }

    fn run(&self, index: usize) {
        debug!(worker = index, "Extraction worker started");
        while !self.shutdown.load(Ordering::Acquire) {
            if let Some(handle) = self.ingress.pop(POP_SLICE) {
                self.process(handle);
            }
        }
        debug!(worker = index, "Extraction worker stopped");
    }
}

pub struct ExtractionWorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl ExtractionWorkerPool {
    /// Start `count` workers. If any thread fails to spawn, the ones
    /// already running are stopped before the error is returned.
    pub fn spawn(
        count: usize,
        pin: bool,
        context: Arc<WorkerContext>,
    ) -> Result<Self, PipelineError> {
        let mut handles = Vec::with_capacity(count);
        for index in 0..count {
            let ctx = context.clone();
            let name = format!("argus-worker-{index}");
            let spawned = spawn_thread(name.clone(), move || {
                if pin {
                    pin_current_thread(index);
                }
                ctx.run(index)
            });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(source) => {
                    context.shutdown.store(true, Ordering::Release);
                    Self { handles }.join();
                    return Err(PipelineError::Spawn { name, source });
                }
            }
        }
        info!(workers = count, pinned = pin, "Extraction workers started");
        Ok(Self { handles })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker. Callers set the shutdown flag first.
    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                warn!("Extraction worker panicked");
            }
        }
    }
}
