use std::fmt;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Index of a camera in the rig configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CameraId(pub u16);

impl CameraId {
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cam{}", self.0)
    }
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuyv4,
    Mjpeg,
    Nv12,
    Gray8,
}

impl PixelFormat {
    /// Bytes in one tightly packed row of the first plane. `None` for
    /// compressed formats, which have no row layout.
    pub fn packed_row_bytes(self, width: u32) -> Option<usize> {
        let width = width as usize;
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(width * 3),
            PixelFormat::Yuyv4 => Some(width * 2),
            PixelFormat::Nv12 | PixelFormat::Gray8 => Some(width),
            PixelFormat::Mjpeg => None,
        }
    }

    /// Number of rows (across all planes) at the given height.
    pub fn rows(self, height: u32) -> usize {
        let height = height as usize;
        match self {
            PixelFormat::Nv12 => height + height / 2,
            _ => height,
        }
    }
}

/// Opaque reference to a pool slot. Only meaningful to the pool that
/// minted it, and only while `generation` matches the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferRef {
    pub slot: u32,
    pub generation: u64,
}

/// A captured frame as it travels through the pipeline. Copying a handle
/// copies no pixels and grants no lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHandle {
    pub frame_id: u64,
    pub camera: CameraId,
    /// Device timestamp on the rig's shared clock
    pub timestamp: Duration,
    /// Host time the capture completed, for latency tracking
    pub captured_at: Instant,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub buffer: BufferRef,
    pub keyframe: bool,
}

/// Exported DMA-BUF for hardware that can read the capture memory directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaDescriptor {
    pub fd: i32,
    pub offset: u64,
    pub len: usize,
}

/// A filled buffer handed over by a frame source. Dropping the last
/// reference to `data` hands the memory back to the driver.
#[derive(Debug, Clone)]
pub struct CapturedBuffer {
    /// CPU-visible mapping of the capture memory
    pub data: Bytes,
    /// Bytes per row as laid out by the driver
    pub stride: u32,
    pub dma: Option<DmaDescriptor>,
    pub timestamp: Duration,
    pub keyframe: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_rows() {
        assert_eq!(PixelFormat::Rgb24.packed_row_bytes(10), Some(30));
        assert_eq!(PixelFormat::Yuyv4.packed_row_bytes(10), Some(20));
        assert_eq!(PixelFormat::Gray8.packed_row_bytes(10), Some(10));
        assert_eq!(PixelFormat::Mjpeg.packed_row_bytes(10), None);
        assert_eq!(PixelFormat::Nv12.rows(480), 720);
        assert_eq!(PixelFormat::Gray8.rows(480), 480);
    }

    #[test]
    fn camera_id_display() {
        assert_eq!(CameraId(3).to_string(), "cam3");
        assert_eq!(CameraId(3).index(), 3);
    }
}
