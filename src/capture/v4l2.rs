//! V4L2 mmap capture source

use std::io;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, instrument};
use v4l::buffer::{Flags as BufFlags, Type};
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::frame::{CapturedBuffer, PixelFormat};
use crate::capture::source::FrameSource;
use crate::error::SourceError;
use crate::CameraConfig;

/// V4L2 capture through driver-allocated mmap buffers.
///
/// The driver recycles its mmap buffers as soon as the next dequeue
/// happens, so each frame is copied out once into refcounted memory. Such
/// buffers never carry a DMA descriptor.
pub struct V4l2Source {
    device: Option<Device>,
    stream: Option<MmapStream<'static>>,
    stride: u32,
}

impl V4l2Source {
    pub fn new() -> Self {
        Self {
            device: None,
            stream: None,
            stride: 0,
        }
    }

    fn fourcc(format: PixelFormat) -> FourCC {
        match format {
            PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
            PixelFormat::Yuyv4 => FourCC::new(b"YUYV"),
            PixelFormat::Rgb24 => FourCC::new(b"RGB3"),
            PixelFormat::Bgr24 => FourCC::new(b"BGR3"),
            PixelFormat::Nv12 => FourCC::new(b"NV12"),
            PixelFormat::Gray8 => FourCC::new(b"GREY"),
        }
    }
}

impl Default for V4l2Source {
    fn default() -> Self {
        Self::new()
    }
}

fn unavailable(err: io::Error) -> SourceError {
    SourceError::Unavailable(err.to_string())
}

impl FrameSource for V4l2Source {
    #[instrument(skip_all, fields(device = %camera.device))]
    fn open(&mut self, camera: &CameraConfig) -> Result<(), SourceError> {
        let device = Device::with_path(&camera.device).map_err(unavailable)?;

        let caps = device.query_caps().map_err(unavailable)?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(SourceError::Unavailable(
                "device doesn't support video capture".into(),
            ));
        }

        let mut fmt = device.format().map_err(unavailable)?;
        fmt.width = camera.width;
        fmt.height = camera.height;
        fmt.fourcc = Self::fourcc(camera.format);
        let fmt = device.set_format(&fmt).map_err(unavailable)?;

        if fmt.width != camera.width || fmt.height != camera.height {
            return Err(SourceError::Unavailable(format!(
                "driver negotiated {}x{}, expected {}x{}",
                fmt.width, fmt.height, camera.width, camera.height
            )));
        }

        let stream = MmapStream::with_buffers(&device, Type::VideoCapture, camera.buffer_count)
            .map_err(unavailable)?;

        info!(
            stride = fmt.stride,
            buffers = camera.buffer_count,
            "Capture stream started"
        );

        self.stride = fmt.stride;
        self.stream = Some(stream);
        self.device = Some(device);
        Ok(())
    }

    fn wait_for_frame(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<CapturedBuffer>, SourceError> {
        let stream = self.stream.as_mut().ok_or(SourceError::Closed)?;
        stream.set_timeout(timeout);

        let (buf, meta) = match stream.next() {
            Ok(frame) => frame,
            Err(err) if err.kind() == io::ErrorKind::TimedOut => return Ok(None),
            Err(err) => return Err(SourceError::Read(err.to_string())),
        };

        let timestamp = Duration::from_secs(meta.timestamp.sec as u64)
            + Duration::from_micros(meta.timestamp.usec as u64);
        let used = (meta.bytesused as usize).min(buf.len());

        Ok(Some(CapturedBuffer {
            data: Bytes::copy_from_slice(&buf[..used]),
            stride: self.stride,
            dma: None,
            timestamp,
            keyframe: meta.flags.contains(BufFlags::KEYFRAME),
        }))
    }

    fn close(&mut self) {
        debug!("Closing V4L2 stream");
        self.stream = None;
        self.device = None;
    }
}
