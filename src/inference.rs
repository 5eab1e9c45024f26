//! Inference engine seam.
//!
//! The accelerator SDK lives behind [`InferenceEngine`]. The pipeline hands
//! it a [`FrameInput`] whose [`FrameView`] is either an exported DMA buffer
//! or CPU-visible memory, and gets keypoints plus a descriptor block back.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::capture::{DmaDescriptor, PixelFormat};
use crate::error::InferenceError;

/// Extraction parameters passed through to the engine on every call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub max_keypoints: usize,
    pub score_threshold: f32,
    /// Descriptor bytes per keypoint
    pub descriptor_len: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_keypoints: 500,
            score_threshold: 0.0,
            descriptor_len: 32, // 256-bit binary descriptors
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub score: f32,
}

/// How the engine got at the pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViewKind {
    /// Exported DMA buffer, no CPU involvement
    Dma,
    /// CPU view of the capture memory, no copy
    Mapped,
    /// Rows repacked into a fresh buffer
    Copied,
}

/// Engine-visible view of a leased buffer.
#[derive(Debug, Clone)]
pub enum FrameView {
    Dma(DmaDescriptor),
    /// Shares the capture memory.
    Mapped(Bytes),
    /// Tightly packed copy of a padded capture.
    Copied(Bytes),
}

impl FrameView {
    pub fn kind(&self) -> ViewKind {
        match self {
            FrameView::Dma(_) => ViewKind::Dma,
            FrameView::Mapped(_) => ViewKind::Mapped,
            FrameView::Copied(_) => ViewKind::Copied,
        }
    }

    /// CPU-visible pixels, if this view has any.
    pub fn bytes(&self) -> Option<&Bytes> {
        match self {
            FrameView::Dma(_) => None,
            FrameView::Mapped(bytes) | FrameView::Copied(bytes) => Some(bytes),
        }
    }
}

/// Everything the engine needs to interpret a view.
#[derive(Debug, Clone)]
pub struct FrameInput {
    pub view: FrameView,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Bytes per row of the CPU view
    pub stride: u32,
}

/// Output of one successful extraction.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub keypoints: Vec<Keypoint>,
    /// `descriptor_len` bytes per keypoint, in keypoint order
    pub descriptors: Bytes,
}

/// A feature extractor running on some accelerator.
///
/// Workers call `extract` concurrently, each on its own buffer.
pub trait InferenceEngine: Send + Sync {
    /// Whether `extract` accepts [`FrameView::Dma`].
    fn supports_dma(&self) -> bool {
        false
    }

    fn extract(
        &self,
        input: &FrameInput,
        config: &ExtractionConfig,
    ) -> Result<Extraction, InferenceError>;
}
