//! Per-camera throughput and error tracking
//!
//! Counters are plain atomics mirrored into the `metrics` facade with a
//! `camera` label, so they cost nothing extra when no recorder is
//! installed. Reads never block writers for longer than one small lock
//! around the frame-rate window.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use serde::Serialize;

use crate::capture::CameraId;
use crate::inference::ViewKind;
use crate::pipeline::result::ExtractionResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Ingress queue full
    IngressFull,
    /// No free buffer slot
    PoolExhausted,
    /// Queued or in flight when the pipeline stopped
    Shutdown,
}

/// Counters for one camera at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CameraStats {
    pub captured: u64,
    pub extracted: u64,
    pub failed: u64,
    pub dropped_ingress: u64,
    pub dropped_pool: u64,
    pub dropped_shutdown: u64,
    pub stale_handles: u64,
    pub zero_copy_frames: u64,
    pub mapped_frames: u64,
    pub fallback_copies: u64,
    pub result_overflow: u64,
    pub frame_rate: f64,
}

impl CameraStats {
    pub fn dropped(&self) -> u64 {
        self.dropped_ingress + self.dropped_pool + self.dropped_shutdown
    }
}

#[derive(Default)]
struct Counters {
    captured: AtomicU64,
    extracted: AtomicU64,
    failed: AtomicU64,
    dropped_ingress: AtomicU64,
    dropped_pool: AtomicU64,
    dropped_shutdown: AtomicU64,
    stale: AtomicU64,
    zero_copy: AtomicU64,
    mapped: AtomicU64,
    copied: AtomicU64,
    result_overflow: AtomicU64,
}

/// Facade handles, resolved once per camera.
struct Recorders {
    captured: metrics::Counter,
    extracted: metrics::Counter,
    failed: metrics::Counter,
    dropped: metrics::Counter,
    copied: metrics::Counter,
    extraction_time: metrics::Histogram,
}

pub struct CameraMetrics {
    camera: CameraId,
    counters: CachePadded<Counters>,
    recorders: Recorders,
    window: Mutex<HeapRb<Instant>>,
    last_error: ArcSwapOption<String>,
}

impl CameraMetrics {
    fn new(camera: CameraId, fps_window: usize) -> Self {
        let label = camera.to_string();
        Self {
            camera,
            counters: CachePadded::new(Counters::default()),
            recorders: Recorders {
                captured: metrics::counter!("argus_frames_captured_total", "camera" => label.clone()),
                extracted: metrics::counter!("argus_frames_extracted_total", "camera" => label.clone()),
                failed: metrics::counter!("argus_extraction_failures_total", "camera" => label.clone()),
                dropped: metrics::counter!("argus_frames_dropped_total", "camera" => label.clone()),
                copied: metrics::counter!("argus_fallback_copies_total", "camera" => label.clone()),
                extraction_time: metrics::histogram!("argus_extraction_time_us", "camera" => label),
            },
            window: Mutex::new(HeapRb::new(fps_window.max(2))),
            last_error: ArcSwapOption::empty(),
        }
    }

    pub fn camera(&self) -> CameraId {
        self.camera
    }

    pub fn record_capture(&self) {
        self.counters.captured.fetch_add(1, Ordering::Relaxed);
        self.recorders.captured.increment(1);
    }

    pub fn record_drop(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::IngressFull => &self.counters.dropped_ingress,
            DropReason::PoolExhausted => &self.counters.dropped_pool,
            DropReason::Shutdown => &self.counters.dropped_shutdown,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.recorders.dropped.increment(1);
    }

    pub fn record_stale(&self) {
        self.counters.stale.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_result_overflow(&self) {
        self.counters.result_overflow.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, message: impl Into<String>) {
        self.last_error.store(Some(Arc::new(message.into())));
    }

    /// Account for one finished extraction, successful or not.
    pub fn record_extraction(&self, result: &ExtractionResult) {
        match result.path {
            ViewKind::Dma => self.counters.zero_copy.fetch_add(1, Ordering::Relaxed),
            ViewKind::Mapped => self.counters.mapped.fetch_add(1, Ordering::Relaxed),
            ViewKind::Copied => {
                self.recorders.copied.increment(1);
                self.counters.copied.fetch_add(1, Ordering::Relaxed)
            }
        };
        self.recorders
            .extraction_time
            .record(result.processing.as_micros() as f64);

        if let Some(message) = result.error_message() {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            self.recorders.failed.increment(1);
            self.record_error(format!("frame {}: {message}", result.frame_id));
            return;
        }

        self.counters.extracted.fetch_add(1, Ordering::Relaxed);
        self.recorders.extracted.increment(1);
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_overwrite(Instant::now());
    }

    /// Successful extractions per second over the rolling window. Decays
    /// toward zero once results stop arriving.
    pub fn frame_rate(&self) -> f64 {
        let window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        let samples = window.occupied_len();
        if samples < 2 {
            return 0.0;
        }

        let mut iter = window.iter();
        let (Some(first), Some(last)) = (iter.next().copied(), iter.last().copied()) else {
            return 0.0;
        };
        drop(window);

        let intervals = (samples - 1) as f64;
        let span = last.duration_since(first).as_secs_f64();
        if span <= 0.0 {
            return 0.0;
        }

        // Stalled: stretch the window up to now.
        let idle = last.elapsed().as_secs_f64();
        if idle > 2.0 * span / intervals {
            return intervals / (span + idle);
        }
        intervals / span
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.load_full().map(|message| (*message).clone())
    }

    pub fn snapshot(&self) -> CameraStats {
        let c = &self.counters;
        CameraStats {
            captured: c.captured.load(Ordering::Relaxed),
            extracted: c.extracted.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            dropped_ingress: c.dropped_ingress.load(Ordering::Relaxed),
            dropped_pool: c.dropped_pool.load(Ordering::Relaxed),
            dropped_shutdown: c.dropped_shutdown.load(Ordering::Relaxed),
            stale_handles: c.stale.load(Ordering::Relaxed),
            zero_copy_frames: c.zero_copy.load(Ordering::Relaxed),
            mapped_frames: c.mapped.load(Ordering::Relaxed),
            fallback_copies: c.copied.load(Ordering::Relaxed),
            result_overflow: c.result_overflow.load(Ordering::Relaxed),
            frame_rate: self.frame_rate(),
        }
    }
}

/// Metrics for every camera in the rig.
pub struct MetricsTracker {
    cameras: Vec<CameraMetrics>,
}

impl MetricsTracker {
    pub fn new(camera_count: usize, fps_window: usize) -> Self {
        Self {
            cameras: (0..camera_count)
                .map(|index| CameraMetrics::new(CameraId(index as u16), fps_window))
                .collect(),
        }
    }

    pub fn camera(&self, camera: CameraId) -> Option<&CameraMetrics> {
        self.cameras.get(camera.index())
    }

    pub fn cameras(&self) -> &[CameraMetrics] {
        &self.cameras
    }
}
