//! Error types shared across the pipeline stages.

use std::io;

use thiserror::Error;

use crate::capture::CameraId;
use crate::pipeline::PipelineState;

/// Structural failures: these fail `initialize`/`start` outright.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("frame source for camera {camera} unavailable: {source}")]
    SourceUnavailable {
        camera: CameraId,
        #[source]
        source: SourceError,
    },

    #[error("pipeline is {current:?}, operation requires {required:?}")]
    InvalidState {
        current: PipelineState,
        required: PipelineState,
    },

    #[error("unknown camera {0}")]
    UnknownCamera(CameraId),

    #[error("failed to spawn thread {name}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("failed to load configuration")]
    Config(#[from] config::ConfigError),
}

/// Buffer pool contract violations and backpressure signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("no free buffer slot for camera {camera}")]
    Exhausted { camera: CameraId },

    #[error("stale handle for slot {slot}: handle generation {handle}, slot generation {current}")]
    StaleHandle { slot: u32, handle: u64, current: u64 },

    #[error("slot {slot} released while already free")]
    DoubleRelease { slot: u32 },

    #[error("slot {slot} released without a lease")]
    NotLeased { slot: u32 },

    #[error("slot {slot} is already leased")]
    AlreadyLeased { slot: u32 },

    #[error("unknown camera {0}")]
    UnknownCamera(CameraId),

    #[error("camera {camera} has no slot {slot}")]
    UnknownSlot { camera: CameraId, slot: u32 },
}

/// Failures reported by a [`FrameSource`](crate::capture::FrameSource).
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("device unavailable: {0}")]
    Unavailable(String),

    #[error("read failed: {0}")]
    Read(String),

    #[error("source closed")]
    Closed,
}

/// Per-frame failures reported by an [`InferenceEngine`](crate::inference::InferenceEngine).
#[derive(Debug, Clone, Error)]
pub enum InferenceError {
    #[error("extraction failed ({code}): {message}")]
    Failed { code: u32, message: String },

    #[error("unsupported input: {0}")]
    Unsupported(String),
}

impl InferenceError {
    /// Numeric code recorded on failed results.
    pub fn code(&self) -> u32 {
        match self {
            InferenceError::Failed { code, .. } => *code,
            InferenceError::Unsupported(_) => UNSUPPORTED_CODE,
        }
    }
}

/// Code recorded when the engine rejects the input format.
pub const UNSUPPORTED_CODE: u32 = 0xFFFF_0001;

/// Code recorded when the engine panicked while extracting.
pub const PANIC_CODE: u32 = 0xFFFF_0002;
