pub mod frame;
pub mod source;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use frame::{BufferRef, CameraId, CapturedBuffer, DmaDescriptor, FrameHandle, PixelFormat};
pub use source::FrameSource;
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Source;
