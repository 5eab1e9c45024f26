//! Pipeline assembly and lifecycle.
//!
//! ```text
//! FrameSource -> FrameBufferPool -> acquisition loop -> ingress queue
//!     -> extraction workers -> per-camera result queues
//!     -> synchronizer / callbacks -> consumer
//! ```

pub mod acquisition;
pub mod distributor;
pub mod ingress;
pub mod metrics;
pub mod pool;
pub mod result;
pub mod sync;
pub mod workers;

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tracing::{error, info, instrument, warn};

use crate::capture::{CameraId, FrameSource};
use crate::error::{PipelineError, PoolError};
use crate::inference::InferenceEngine;
use crate::Config;

use acquisition::AcquisitionStage;
use workers::{ExtractionWorkerPool, WorkerContext};

pub use distributor::{CallbackId, PullOutcome, ResultCallback, ResultDistributor};
pub use ingress::{IngressQueue, IngressStats, PushOutcome};
pub use metrics::{CameraStats, DropReason, MetricsTracker};
pub use pool::{FrameBufferPool, SlotSnapshot, SlotState};
pub use result::{ExtractionResult, ExtractionStatus};
pub use sync::{PartialSet, SyncOutcome, SyncedSet, SynchronizationStage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineState {
    Created,
    Initialized,
    Running,
    Stopping,
    Stopped,
}

impl PipelineState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Created,
            1 => Self::Initialized,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// Components allocated by `initialize` and shared with every thread.
struct Shared {
    pool: Arc<FrameBufferPool>,
    ingress: Arc<IngressQueue>,
    metrics: Arc<MetricsTracker>,
    sync: Arc<SynchronizationStage>,
    distributor: Arc<ResultDistributor>,
    dma_capable: Vec<bool>,
}

/// Close sources that never reached an acquisition loop.
fn close_sources(sources: impl IntoIterator<Item = Box<dyn FrameSource>>) {
    for mut source in sources {
        source.close();
    }
}

#[derive(Default)]
struct Lifecycle {
    sources: Vec<Box<dyn FrameSource>>,
    acquisition: Vec<JoinHandle<()>>,
    workers: Option<ExtractionWorkerPool>,
}

/// A multi-camera capture and feature-extraction pipeline.
///
/// Every method takes `&self`; queries never wait on lifecycle changes.
pub struct Pipeline {
    config: Arc<Config>,
    engine: Arc<dyn InferenceEngine>,
    /// Written only under `lifecycle`; read lock-free.
    state: AtomicU8,
    lifecycle: Mutex<Lifecycle>,
    shared: ArcSwapOption<Shared>,
    zero_copy: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(config: Config, engine: Arc<dyn InferenceEngine>) -> Self {
        Self {
            config: Arc::new(config),
            engine,
            state: AtomicU8::new(PipelineState::Created as u8),
            lifecycle: Mutex::new(Lifecycle::default()),
            shared: ArcSwapOption::empty(),
            zero_copy: Arc::new(AtomicBool::new(true)),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: PipelineState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn require(&self, required: PipelineState) -> Result<(), PipelineError> {
        let current = self.state();
        if current != required {
            return Err(PipelineError::InvalidState { current, required });
        }
        Ok(())
    }

    fn shared(&self) -> Result<Arc<Shared>, PipelineError> {
        self.shared
            .load_full()
            .ok_or(PipelineError::InvalidState {
                current: self.state(),
                required: PipelineState::Initialized,
            })
    }

    /// Validate the configuration, open one source per camera and
    /// allocate pools and queues. Sources are bound in camera order.
    #[instrument(skip_all, fields(cameras = sources.len()))]
    pub fn initialize(&self, mut sources: Vec<Box<dyn FrameSource>>) -> Result<(), PipelineError> {
        let mut lifecycle = self.lock();
        self.require(PipelineState::Created)?;
        self.config.validate()?;

        let cameras = &self.config.cameras;
        if sources.len() != cameras.len() {
            return Err(PipelineError::ConfigInvalid(format!(
                "{} cameras configured but {} frame sources supplied",
                cameras.len(),
                sources.len()
            )));
        }

        for index in 0..sources.len() {
            if let Err(source) = sources[index].open(&cameras[index]) {
                for opened in &mut sources[..index] {
                    opened.close();
                }
                let camera = CameraId(index as u16);
                error!(%camera, device = %cameras[index].device, "Failed to open frame source: {}", source);
                return Err(PipelineError::SourceUnavailable { camera, source });
            }
        }

        let dma_capable: Vec<bool> = cameras
            .iter()
            .zip(&sources)
            .map(|(camera, source)| {
                camera.zero_copy && source.supports_dma_export() && self.engine.supports_dma()
            })
            .collect();

        let pipeline = &self.config.pipeline;
        let metrics = Arc::new(MetricsTracker::new(cameras.len(), pipeline.fps_window));
        let sync = Arc::new(SynchronizationStage::new(
            cameras.len(),
            pipeline.sync_buffer_depth,
        ));
        let shared = Shared {
            pool: Arc::new(FrameBufferPool::new(cameras)),
            ingress: Arc::new(IngressQueue::new(pipeline.ingress_capacity)),
            distributor: Arc::new(ResultDistributor::new(
                cameras.len(),
                pipeline.result_queue_depth,
                sync.clone(),
                metrics.clone(),
            )),
            metrics,
            sync,
            dma_capable,
        };

        for (index, capable) in shared.dma_capable.iter().enumerate() {
            info!(camera = %CameraId(index as u16), zero_copy = capable, "Camera bound");
        }

        self.shared.store(Some(Arc::new(shared)));
        lifecycle.sources = sources;
        self.set_state(PipelineState::Initialized);
        info!("Pipeline initialized");
        Ok(())
    }

    /// Spawn the workers and one acquisition loop per camera.
    #[instrument(skip_all)]
    pub fn start(&self) -> Result<(), PipelineError> {
        let mut lifecycle = self.lock();
        self.require(PipelineState::Initialized)?;
        let shared = self.shared()?;
        let pipeline = Arc::new(self.config.pipeline.clone());

        self.shutdown.store(false, Ordering::Release);
        let context = Arc::new(WorkerContext {
            pool: shared.pool.clone(),
            ingress: shared.ingress.clone(),
            metrics: shared.metrics.clone(),
            distributor: shared.distributor.clone(),
            engine: self.engine.clone(),
            extraction: self.config.extraction.clone(),
            zero_copy: self.zero_copy.clone(),
            dma_capable: shared.dma_capable.clone(),
            shutdown: self.shutdown.clone(),
        });
        lifecycle.workers = Some(ExtractionWorkerPool::spawn(
            pipeline.worker_count,
            pipeline.pin_workers,
            context,
        )?);

        let mut sources = std::mem::take(&mut lifecycle.sources).into_iter().enumerate();
        while let Some((index, source)) = sources.next() {
            let stage = AcquisitionStage::new(
                CameraId(index as u16),
                pipeline.clone(),
                shared.pool.clone(),
                shared.ingress.clone(),
                shared.metrics.clone(),
                shared.sync.clone(),
                self.shutdown.clone(),
            );
            match stage.spawn(source) {
                Ok(handle) => lifecycle.acquisition.push(handle),
                Err(source) => {
                    close_sources(sources.map(|(_, pending)| pending));
                    drop(lifecycle);
                    self.stop();
                    return Err(PipelineError::Spawn {
                        name: format!("argus-acq-{}", CameraId(index as u16)),
                        source,
                    });
                }
            }
        }

        self.set_state(PipelineState::Running);
        info!(
            cameras = self.config.cameras.len(),
            workers = pipeline.worker_count,
            "Pipeline running"
        );
        Ok(())
    }

    /// Stop capture, join every thread and return all slots. Safe to call
    /// repeatedly and from any state.
    #[instrument(skip_all)]
    pub fn stop(&self) {
        let mut lifecycle = self.lock();
        if self.state() == PipelineState::Stopped {
            return;
        }
        self.set_state(PipelineState::Stopping);
        self.shutdown.store(true, Ordering::Release);

        for handle in lifecycle.acquisition.drain(..) {
            if handle.join().is_err() {
                warn!("Acquisition thread panicked");
            }
        }
        if let Some(workers) = lifecycle.workers.take() {
            workers.join();
        }
        close_sources(lifecycle.sources.drain(..));

        if let Some(shared) = self.shared.load_full() {
            let queued = shared.ingress.drain();
            let drained = queued.len();
            for handle in queued {
                match shared.pool.discard(&handle) {
                    Ok(()) => {
                        if let Some(m) = shared.metrics.camera(handle.camera) {
                            m.record_drop(DropReason::Shutdown);
                        }
                    }
                    Err(PoolError::StaleHandle { .. }) => {}
                    Err(e) => error!(camera = %handle.camera, frame_id = handle.frame_id, "Failed to return queued frame: {}", e),
                }
            }
            shared.distributor.close();

            let outstanding = shared.pool.outstanding();
            if outstanding > 0 {
                warn!(outstanding, "Buffer slots still held after stop");
            }
            info!(drained, "Pipeline stopped");
        }

        self.set_state(PipelineState::Stopped);
    }

    fn camera_index(&self, camera: CameraId) -> Result<usize, PipelineError> {
        let index = camera.index();
        if index >= self.config.cameras.len() {
            return Err(PipelineError::UnknownCamera(camera));
        }
        Ok(index)
    }

    /// Whether frames from `camera` can reach the engine as DMA buffers.
    /// Known once the pipeline is initialized.
    pub fn is_zero_copy_supported(&self, camera: CameraId) -> bool {
        self.shared
            .load_full()
            .as_ref()
            .and_then(|shared| shared.dma_capable.get(camera.index()).copied())
            .unwrap_or(false)
    }

    /// Toggle the DMA fast path at runtime. Cameras without support keep
    /// using CPU views either way.
    pub fn enable_zero_copy(&self, enabled: bool) {
        self.zero_copy.store(enabled, Ordering::Relaxed);
        info!(enabled, "Zero-copy path toggled");
    }

    pub fn zero_copy_enabled(&self) -> bool {
        self.zero_copy.load(Ordering::Relaxed)
    }

    /// Next result for `camera`, waiting up to `timeout`. A zero timeout
    /// probes without blocking.
    pub fn pull_next_result(
        &self,
        camera: CameraId,
        timeout: Duration,
    ) -> Result<PullOutcome, PipelineError> {
        self.camera_index(camera)?;
        self.shared()?
            .distributor
            .pull_next(camera, timeout)
            .ok_or(PipelineError::UnknownCamera(camera))
    }

    pub async fn next_result_async(
        &self,
        camera: CameraId,
        timeout: Duration,
    ) -> Result<PullOutcome, PipelineError> {
        self.camera_index(camera)?;
        self.shared()?
            .distributor
            .next_result_async(camera, timeout)
            .await
            .ok_or(PipelineError::UnknownCamera(camera))
    }

    /// Wait up to `timeout` for one result per camera within `tolerance`
    /// of each other.
    pub fn pull_synchronized(
        &self,
        tolerance: Duration,
        timeout: Duration,
    ) -> Result<SyncOutcome, PipelineError> {
        Ok(self.shared()?.sync.wait_synchronized(tolerance, timeout))
    }

    pub fn try_synchronized(&self, tolerance: Duration) -> Result<Option<SyncedSet>, PipelineError> {
        Ok(self.shared()?.sync.try_synchronize(tolerance))
    }

    /// Run `callback` on the worker thread for every finished result.
    pub fn register_callback(
        &self,
        callback: impl Fn(&ExtractionResult) + Send + Sync + 'static,
    ) -> Result<CallbackId, PipelineError> {
        Ok(self.shared()?.distributor.register_callback(Arc::new(callback)))
    }

    pub fn unregister_callback(&self, id: CallbackId) -> bool {
        self.shared
            .load_full()
            .as_ref()
            .is_some_and(|shared| shared.distributor.unregister_callback(id))
    }

    pub fn frame_rate(&self, camera: CameraId) -> Option<f64> {
        let shared = self.shared.load_full()?;
        let rate = shared.metrics.camera(camera)?.frame_rate();
        Some(rate)
    }

    pub fn last_error(&self, camera: CameraId) -> Option<String> {
        self.shared.load_full()?.metrics.camera(camera)?.last_error()
    }

    pub fn stats(&self, camera: CameraId) -> Option<CameraStats> {
        let shared = self.shared.load_full()?;
        let stats = shared.metrics.camera(camera)?.snapshot();
        Some(stats)
    }

    pub fn ingress_stats(&self) -> Option<IngressStats> {
        self.shared.load_full().map(|shared| shared.ingress.stats())
    }

    /// Frames queued for or held by workers.
    pub fn in_flight(&self) -> usize {
        self.shared.load_full().map_or(0, |shared| {
            let leased: usize = (0..self.config.cameras.len())
                .map(|index| shared.pool.leased_count(CameraId(index as u16)))
                .sum();
            shared.ingress.len() + leased
        })
    }

    /// Slots not yet returned to Free, across all cameras.
    pub fn outstanding_slots(&self) -> usize {
        self.shared
            .load_full()
            .as_ref()
            .map_or(0, |shared| shared.pool.outstanding())
    }

    pub fn pool_snapshot(&self, camera: CameraId) -> Result<Vec<SlotSnapshot>, PipelineError> {
        self.camera_index(camera)?;
        Ok(self.shared()?.pool.snapshot(camera)?)
    }

    /// References the synchronizer gave up on plus results it evicted.
    pub fn sync_discards(&self) -> u64 {
        self.shared
            .load_full()
            .as_ref()
            .map_or(0, |shared| shared.sync.unmatched() + shared.sync.evicted())
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::capture::CapturedBuffer;
    use crate::error::SourceError;
    use crate::sim::ScriptedEngine;
    use crate::CameraConfig;

    struct Counted(Arc<AtomicUsize>);

    impl FrameSource for Counted {
        fn open(&mut self, _: &CameraConfig) -> Result<(), SourceError> {
            Ok(())
        }

        fn wait_for_frame(&mut self, _: Duration) -> Result<Option<CapturedBuffer>, SourceError> {
            Err(SourceError::Closed)
        }

        fn close(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counted(closed: &Arc<AtomicUsize>, count: usize) -> Vec<Box<dyn FrameSource>> {
        (0..count)
            .map(|_| Box::new(Counted(closed.clone())) as Box<dyn FrameSource>)
            .collect()
    }

    #[test]
    fn unstarted_sources_are_closed() {
        let closed = Arc::new(AtomicUsize::new(0));
        close_sources(counted(&closed, 3));
        assert_eq!(closed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn stop_before_start_closes_every_source() {
        let closed = Arc::new(AtomicUsize::new(0));
        let config = Config {
            cameras: (0..2)
                .map(|i| CameraConfig {
                    device: format!("sim{i}"),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pipeline = Pipeline::new(config, Arc::new(ScriptedEngine::new()));
        pipeline.initialize(counted(&closed, 2)).unwrap();

        pipeline.stop();
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert_eq!(closed.load(Ordering::SeqCst), 2);

        // Idempotent: nothing is closed twice.
        pipeline.stop();
        assert_eq!(closed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn state_round_trips_through_its_encoding() {
        for state in [
            PipelineState::Created,
            PipelineState::Initialized,
            PipelineState::Running,
            PipelineState::Stopping,
            PipelineState::Stopped,
        ] {
            assert_eq!(PipelineState::from_u8(state as u8), state);
        }
    }
}
