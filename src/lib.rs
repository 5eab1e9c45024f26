//! Argus: multi-camera capture-to-accelerator feature extraction.
//!
//! Frames flow from per-camera [`FrameSource`]s into a pool of leased
//! buffer slots, across a bounded ingress queue to a fixed pool of
//! extraction workers, and out through per-camera result queues, callbacks
//! and a timestamp-tolerant cross-camera synchronizer.

pub mod capture;
pub mod error;
pub mod inference;
pub mod pipeline;
pub mod sim;
pub mod utils;

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use capture::{CameraId, CapturedBuffer, FrameHandle, FrameSource, PixelFormat};
pub use error::{InferenceError, PipelineError, PoolError, SourceError};
pub use inference::{ExtractionConfig, FrameInput, FrameView, InferenceEngine, Keypoint};
pub use pipeline::{
    CallbackId, CameraStats, ExtractionResult, ExtractionStatus, Pipeline, PipelineState,
    PullOutcome, SyncOutcome, SyncedSet,
};

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cameras: Vec<CameraConfig>,
    pub pipeline: PipelineConfig,
    pub extraction: ExtractionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
    pub zero_copy: bool, // DMA-BUF handoff to the accelerator
    pub calibration: Calibration,
}

/// Pinhole intrinsics in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Calibration {
    pub intrinsics: Intrinsics,
    pub distortion: Vec<f64>,
    /// Camera-to-rig transform, row major.
    pub extrinsics: [[f64; 4]; 4],
}

/// What the acquisition loop does when the ingress queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngressPolicy {
    /// Drop the frame just captured and release its slot immediately.
    DropNewest,
    /// Evict the oldest queued frame to make room.
    DropOldest,
    /// Wait up to `ingress_block_ms`, then drop the new frame.
    Block,
}

/// What the acquisition loop does when a camera has no free buffer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolPolicy {
    /// Reclaim the oldest captured frame no worker has picked up yet.
    DropOldestUnconsumed,
    /// Wait for a worker to release a slot.
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub ingress_capacity: usize,
    pub worker_count: usize,
    pub ingress_policy: IngressPolicy,
    pub ingress_block_ms: u64,
    pub pool_policy: PoolPolicy,
    pub capture_timeout_ms: u64,
    pub result_queue_depth: usize,
    pub sync_buffer_depth: usize,
    pub sync_tolerance_ms: u64,
    pub fps_window: usize,
    pub pin_workers: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cameras: vec![
                CameraConfig {
                    device: "/dev/video0".into(),
                    ..Default::default()
                },
                CameraConfig {
                    device: "/dev/video2".into(),
                    ..Default::default()
                },
            ],
            pipeline: PipelineConfig::default(),
            extraction: ExtractionConfig::default(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".into(),
            width: 640,
            height: 480,
            fps: 30,
            format: PixelFormat::Gray8,
            buffer_count: 4,
            zero_copy: false, // Requires a DMA-BUF exporting driver
            calibration: Calibration::default(),
        }
    }
}

impl Default for Intrinsics {
    fn default() -> Self {
        Self {
            fx: 500.0,
            fy: 500.0,
            cx: 320.0,
            cy: 240.0,
        }
    }
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            intrinsics: Intrinsics::default(),
            distortion: Vec::new(),
            extrinsics: [
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
                [0.0, 0.0, 0.0, 1.0],
            ],
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ingress_capacity: 8,
            worker_count: 2,
            ingress_policy: IngressPolicy::DropOldest,
            ingress_block_ms: 32, // one frame at 30fps
            pool_policy: PoolPolicy::DropOldestUnconsumed,
            capture_timeout_ms: 100,
            result_queue_depth: 16,
            sync_buffer_depth: 8,
            sync_tolerance_ms: 10,
            fps_window: 30,
            pin_workers: false,
        }
    }
}

impl PipelineConfig {
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    pub fn ingress_block(&self) -> Duration {
        Duration::from_millis(self.ingress_block_ms)
    }

    pub fn sync_tolerance(&self) -> Duration {
        Duration::from_millis(self.sync_tolerance_ms)
    }
}

impl Config {
    /// Load configuration from a file, with `ARGUS__SECTION__KEY`
    /// environment overrides layered on top.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("ARGUS")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |reason: String| Err(PipelineError::ConfigInvalid(reason));

        if self.cameras.is_empty() {
            return invalid("at least one camera is required".into());
        }
        if self.cameras.len() > usize::from(u16::MAX) {
            return invalid(format!("too many cameras: {}", self.cameras.len()));
        }

        let mut devices = HashSet::new();
        for (index, camera) in self.cameras.iter().enumerate() {
            if camera.device.is_empty() {
                return invalid(format!("camera {index}: empty device identifier"));
            }
            if !devices.insert(camera.device.as_str()) {
                return invalid(format!("camera {index}: duplicate device {}", camera.device));
            }
            if camera.width == 0 || camera.height == 0 {
                return invalid(format!(
                    "camera {index}: invalid resolution {}x{}",
                    camera.width, camera.height
                ));
            }
            if camera.fps == 0 {
                return invalid(format!("camera {index}: frame rate must be non-zero"));
            }
            if camera.buffer_count == 0 {
                return invalid(format!("camera {index}: buffer_count must be non-zero"));
            }
        }

        let p = &self.pipeline;
        if p.ingress_capacity == 0 {
            return invalid("ingress_capacity must be non-zero".into());
        }
        if p.worker_count == 0 {
            return invalid("worker_count must be non-zero".into());
        }
        if p.result_queue_depth == 0 || p.sync_buffer_depth == 0 {
            return invalid("result and sync buffer depths must be non-zero".into());
        }
        if p.fps_window < 2 {
            return invalid("fps_window must hold at least two samples".into());
        }
        if p.capture_timeout_ms == 0 {
            return invalid("capture_timeout_ms must be non-zero".into());
        }
        if self.extraction.descriptor_len == 0 {
            return invalid("descriptor_len must be non-zero".into());
        }

        Ok(())
    }
}
