//! Deterministic stand-ins for a camera and an accelerator.
//!
//! `ScriptedSource` produces synthetic frames on a fixed timestamp
//! schedule and `ScriptedEngine` answers with keypoints derived from the
//! pixels. Together they drive the demo binary and the test suite on
//! machines without cameras or an NPU.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::debug;

use crate::capture::{CapturedBuffer, DmaDescriptor, FrameSource, PixelFormat};
use crate::error::{InferenceError, SourceError};
use crate::inference::{
    Extraction, ExtractionConfig, FrameInput, FrameView, InferenceEngine, Keypoint, ViewKind,
};
use crate::CameraConfig;

/// Fake DMA-BUF descriptors start here so they never look like stdio.
const FAKE_FD_BASE: i32 = 1000;

enum Schedule {
    Periodic { start: Duration, period: Duration },
    Listed(VecDeque<Duration>),
}

/// Releases gated frames of a [`ScriptedSource`], one per token.
#[derive(Clone)]
pub struct FrameGate(Sender<()>);

impl FrameGate {
    pub fn release(&self, frames: usize) {
        for _ in 0..frames {
            let _ = self.0.send(());
        }
    }
}

pub struct ScriptedSource {
    schedule: Schedule,
    emitted: u64,
    limit: Option<u64>,
    pacing: Option<Duration>,
    gate: Option<Receiver<()>>,
    row_padding: u32,
    dma: bool,
    read_errors: u32,
    fail_open: bool,
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl ScriptedSource {
    fn with_schedule(schedule: Schedule) -> Self {
        Self {
            schedule,
            emitted: 0,
            limit: None,
            pacing: None,
            gate: None,
            row_padding: 0,
            dma: false,
            read_errors: 0,
            fail_open: false,
            width: 8,
            height: 4,
            format: PixelFormat::Gray8,
        }
    }

    /// Frames stamped `0, period, 2 * period, ...` forever.
    pub fn periodic(period: Duration) -> Self {
        Self::with_schedule(Schedule::Periodic {
            start: Duration::ZERO,
            period,
        })
    }

    /// Exactly these timestamps, then the source reports closed.
    pub fn from_timestamps(stamps: impl IntoIterator<Item = Duration>) -> Self {
        Self::with_schedule(Schedule::Listed(stamps.into_iter().collect()))
    }

    pub fn starting_at(mut self, offset: Duration) -> Self {
        if let Schedule::Periodic { start, .. } = &mut self.schedule {
            *start = offset;
        }
        self
    }

    /// Close after `frames` frames.
    pub fn with_limit(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }

    /// Sleep this long before handing out each frame.
    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = Some(pacing);
        self
    }

    /// Hold every frame until the returned gate releases it.
    pub fn gated(mut self) -> (Self, FrameGate) {
        let (tx, rx) = flume::unbounded();
        self.gate = Some(rx);
        (self, FrameGate(tx))
    }

    /// Pad every row with `bytes` extra bytes, like drivers aligning
    /// stride.
    pub fn with_row_padding(mut self, bytes: u32) -> Self {
        self.row_padding = bytes;
        self
    }

    /// Attach a fake DMA descriptor to every frame.
    pub fn with_dma_export(mut self) -> Self {
        self.dma = true;
        self
    }

    /// Fail the first `count` reads before producing frames.
    pub fn with_read_errors(mut self, count: u32) -> Self {
        self.read_errors = count;
        self
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    fn next_timestamp(&mut self) -> Option<Duration> {
        if self.limit.is_some_and(|limit| self.emitted >= limit) {
            return None;
        }
        match &mut self.schedule {
            Schedule::Periodic { start, period } => {
                Some(*start + period.saturating_mul(self.emitted as u32))
            }
            Schedule::Listed(stamps) => stamps.pop_front(),
        }
    }

    fn render(&self, frame: u64) -> (Bytes, u32) {
        let Some(row) = self.format.packed_row_bytes(self.width) else {
            // Compressed: an opaque blob with a recognisable header.
            let mut blob = BytesMut::with_capacity(64);
            blob.put_slice(&[0xFF, 0xD8]);
            blob.put_u64_le(frame);
            blob.put_bytes(0, 54);
            return (blob.freeze(), 0);
        };

        let stride = row + self.row_padding as usize;
        let rows = self.format.rows(self.height);
        let mut data = BytesMut::with_capacity(stride * rows);
        for r in 0..rows {
            for c in 0..row {
                data.put_u8((frame as usize + r * 3 + c) as u8);
            }
            data.put_bytes(0xAA, self.row_padding as usize);
        }
        (data.freeze(), stride as u32)
    }
}

impl FrameSource for ScriptedSource {
    fn open(&mut self, camera: &CameraConfig) -> Result<(), SourceError> {
        if self.fail_open {
            return Err(SourceError::Unavailable(format!(
                "{}: scripted open failure",
                camera.device
            )));
        }
        self.width = camera.width;
        self.height = camera.height;
        self.format = camera.format;
        debug!(device = %camera.device, "Scripted source opened");
        Ok(())
    }

    fn wait_for_frame(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<CapturedBuffer>, SourceError> {
        if self.read_errors > 0 {
            self.read_errors -= 1;
            return Err(SourceError::Read("scripted read failure".into()));
        }

        if let Some(gate) = &self.gate {
            match gate.recv_timeout(timeout) {
                Ok(()) => {}
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => return Err(SourceError::Closed),
            }
        }

        let Some(timestamp) = self.next_timestamp() else {
            return Err(SourceError::Closed);
        };
        if let Some(pacing) = self.pacing {
            thread::sleep(pacing);
        }

        let frame = self.emitted;
        self.emitted += 1;
        let (data, stride) = self.render(frame);
        let dma = self.dma.then(|| DmaDescriptor {
            fd: FAKE_FD_BASE + frame as i32,
            offset: 0,
            len: data.len(),
        });

        Ok(Some(CapturedBuffer {
            data,
            stride,
            dma,
            timestamp,
            keyframe: frame % 30 == 0,
        }))
    }

    fn supports_dma_export(&self) -> bool {
        self.dma
    }
}

type LatencyFn = dyn Fn(u64) -> Duration + Send + Sync;
type FailureFn = dyn Fn(u64) -> bool + Send + Sync;

/// Engine whose latency and failures are scripted per call.
///
/// Calls are numbered from zero in the order workers enter `extract`.
pub struct ScriptedEngine {
    latency: Arc<LatencyFn>,
    fails: Arc<FailureFn>,
    panics_on: Option<u64>,
    dma: bool,
    calls: AtomicU64,
    views: [AtomicU64; 3],
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self {
            latency: Arc::new(|_: u64| Duration::ZERO),
            fails: Arc::new(|_: u64| false),
            panics_on: None,
            dma: false,
            calls: AtomicU64::new(0),
            views: Default::default(),
        }
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.with_latency_fn(move |_| latency)
    }

    pub fn with_latency_fn(mut self, f: impl Fn(u64) -> Duration + Send + Sync + 'static) -> Self {
        self.latency = Arc::new(f);
        self
    }

    pub fn failing_when(mut self, f: impl Fn(u64) -> bool + Send + Sync + 'static) -> Self {
        self.fails = Arc::new(f);
        self
    }

    pub fn panicking_on(mut self, call: u64) -> Self {
        self.panics_on = Some(call);
        self
    }

    pub fn with_dma_support(mut self) -> Self {
        self.dma = true;
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Calls that received a view of this kind.
    pub fn views(&self, kind: ViewKind) -> u64 {
        self.views[kind as usize].load(Ordering::Relaxed)
    }

    fn keypoints(input: &FrameInput, config: &ExtractionConfig) -> Vec<Keypoint> {
        let seed = match &input.view {
            FrameView::Dma(descriptor) => descriptor.len as u64,
            FrameView::Mapped(bytes) | FrameView::Copied(bytes) => {
                bytes.iter().take(64).map(|&b| b as u64).sum()
            }
        };
        let count = (4 + seed % 8) as usize;
        let (w, h) = (input.width.max(1), input.height.max(1));

        (0..count.min(config.max_keypoints))
            .map(|i| Keypoint {
                x: ((seed as u32).wrapping_add(i as u32 * 7) % w) as f32,
                y: ((seed as u32).wrapping_add(i as u32 * 13) % h) as f32,
                score: 1.0 - i as f32 / count as f32,
            })
            .filter(|kp| kp.score >= config.score_threshold)
            .collect()
    }
}

impl InferenceEngine for ScriptedEngine {
    fn supports_dma(&self) -> bool {
        self.dma
    }

    fn extract(
        &self,
        input: &FrameInput,
        config: &ExtractionConfig,
    ) -> Result<Extraction, InferenceError> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        self.views[input.view.kind() as usize].fetch_add(1, Ordering::Relaxed);

        let latency = (self.latency)(call);
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        if self.panics_on == Some(call) {
            panic!("scripted engine panic on call {call}");
        }
        if (self.fails)(call) {
            return Err(InferenceError::Failed {
                code: 3,
                message: "npu timeout".into(),
            });
        }
        if matches!(input.view, FrameView::Dma(_)) && !self.dma {
            return Err(InferenceError::Unsupported("dma view".into()));
        }

        let keypoints = Self::keypoints(input, config);
        let mut descriptors = BytesMut::with_capacity(keypoints.len() * config.descriptor_len);
        for (i, kp) in keypoints.iter().enumerate() {
            descriptors.put_bytes((i as u8) ^ (kp.x as u8), config.descriptor_len);
        }

        Ok(Extraction {
            keypoints,
            descriptors: descriptors.freeze(),
        })
    }
}
