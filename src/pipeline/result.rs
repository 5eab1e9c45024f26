use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::capture::CameraId;
use crate::inference::{Keypoint, ViewKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionStatus {
    Ok,
    Failed { code: u32, message: Arc<str> },
}

/// Features extracted from exactly one captured frame.
///
/// Cheap to clone: keypoints and descriptors are shared, so the same
/// result can feed the pull queue, the synchronizer and callbacks.
#[derive(Debug, Clone)]
pub struct ExtractionResult {
    pub camera: CameraId,
    pub frame_id: u64,
    /// Capture timestamp of the source frame
    pub timestamp: Duration,
    pub keypoints: Arc<[Keypoint]>,
    /// `descriptor_len` bytes per keypoint, parallel to `keypoints`
    pub descriptors: Bytes,
    pub descriptor_len: usize,
    pub processing: Duration,
    pub path: ViewKind,
    pub status: ExtractionStatus,
}

impl ExtractionResult {
    pub fn is_success(&self) -> bool {
        self.status == ExtractionStatus::Ok
    }

    pub fn error_code(&self) -> Option<u32> {
        match &self.status {
            ExtractionStatus::Ok => None,
            ExtractionStatus::Failed { code, .. } => Some(*code),
        }
    }

    pub fn error_message(&self) -> Option<String> {
        match &self.status {
            ExtractionStatus::Ok => None,
            ExtractionStatus::Failed { code, message } => Some(format!("{message} (code {code})")),
        }
    }

    /// Descriptor bytes belonging to keypoint `index`.
    pub fn descriptor(&self, index: usize) -> Option<&[u8]> {
        let start = index.checked_mul(self.descriptor_len)?;
        self.descriptors.get(start..start + self.descriptor_len)
    }
}
