use std::io;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Spawn a named thread that inherits the current tracing dispatcher.
pub fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

/// `timeout` from now, or `None` when that lies past what `Instant` can
/// represent.
pub fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

/// Time left before `deadline`; unbounded when there is none.
pub fn remaining_until(deadline: Option<Instant>) -> Duration {
    deadline.map_or(Duration::MAX, |d| d.saturating_duration_since(Instant::now()))
}

/// Pin the calling thread to the `index`-th core, wrapping around.
pub fn pin_current_thread(index: usize) -> bool {
    let Some(cores) = core_affinity::get_core_ids().filter(|cores| !cores.is_empty()) else {
        warn!("CPU core list unavailable, worker left unpinned");
        return false;
    };
    let core = cores[index % cores.len()];
    let pinned = core_affinity::set_for_current(core);
    if pinned {
        debug!(core = core.id, "Pinned thread");
    }
    pinned
}

#[cfg(feature = "v4l2")]
pub use detect::{auto_detect_device, FoundDevice};

#[cfg(feature = "v4l2")]
mod detect {
    use std::path::Path;

    use serde::{Deserialize, Serialize};
    use tracing::info;
    use v4l::{capability::Flags, video::Capture, Device, FourCC};

    use crate::capture::PixelFormat;
    use crate::error::SourceError;

    // Detected capture device info
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct FoundDevice {
        pub path: String,
        pub format: PixelFormat,
    }

    /// Find the first capture device, preferring formats the pipeline can
    /// hand over without conversion. Devices in `skip` are ignored so a
    /// rig can be detected one camera at a time.
    pub fn auto_detect_device(skip: &[String]) -> Result<FoundDevice, SourceError> {
        info!("Auto-detecting capture devices...");

        for i in 0..16 {
            let path = format!("/dev/video{}", i);
            if !Path::new(&path).exists() || skip.contains(&path) {
                continue;
            }

            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
                continue;
            }

            let Ok(formats) = dev.enum_formats() else {
                continue;
            };
            for fmt in formats {
                let format = if fmt.fourcc == FourCC::new(b"GREY") {
                    PixelFormat::Gray8
                } else if fmt.fourcc == FourCC::new(b"YUYV") {
                    PixelFormat::Yuyv4
                } else if fmt.fourcc == FourCC::new(b"MJPG") {
                    PixelFormat::Mjpeg
                } else {
                    continue;
                };
                info!("Found {:?} device: {} - {}", format, path, caps.card);
                return Ok(FoundDevice { path, format });
            }
        }

        Err(SourceError::Unavailable(
            "no suitable capture device found".into(),
        ))
    }
}
