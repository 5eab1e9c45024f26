//! Camera/driver abstraction.

use std::time::Duration;

use crate::capture::frame::CapturedBuffer;
use crate::error::SourceError;
use crate::CameraConfig;

/// A camera that fills hardware buffers.
///
/// One source is bound per camera and driven by that camera's
/// acquisition loop, so implementations only need to be `Send`.
pub trait FrameSource: Send {
    /// Open the device and configure it for `camera`.
    fn open(&mut self, camera: &CameraConfig) -> Result<(), SourceError>;

    /// Wait up to `timeout` for the next completed buffer. `Ok(None)`
    /// means the wait timed out without a frame.
    ///
    /// The returned buffer stays valid until every clone of its data is
    /// dropped.
    fn wait_for_frame(&mut self, timeout: Duration)
        -> Result<Option<CapturedBuffer>, SourceError>;

    /// Whether captured buffers carry an exportable DMA descriptor.
    fn supports_dma_export(&self) -> bool {
        false
    }

    /// Stop streaming. Called once when the acquisition loop exits.
    fn close(&mut self) {}
}
