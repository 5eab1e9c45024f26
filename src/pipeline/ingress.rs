//! Bounded MPMC ingress queue between acquisition loops and workers

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crossbeam::utils::CachePadded;
use flume::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};

use crate::capture::FrameHandle;
use crate::utils::{deadline_after, remaining_until};
use crate::IngressPolicy;

/// Longest single wait inside a blocking push, so shutdown is noticed.
const BLOCK_SLICE: Duration = Duration::from_millis(10);

/// Ingress queue for frame handles (not the pixel data itself)
pub struct IngressQueue {
    tx: Sender<FrameHandle>,
    // Kept so DropOldest can evict from the producer side.
    rx: Receiver<FrameHandle>,
    capacity: usize,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    pushed: AtomicU64,
    popped: AtomicU64,
    evicted: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngressStats {
    pub pushed: u64,
    pub popped: u64,
    /// Queued frames pushed out by DropOldest
    pub evicted: u64,
    /// New frames refused by DropNewest or an expired Block deadline
    pub rejected: u64,
}

#[derive(Debug)]
pub enum PushOutcome {
    Queued,
    /// The queue had no room; the caller still owns the handle.
    Dropped(FrameHandle),
}

impl IngressQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = flume::bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: push a handle according to `policy`.
    ///
    /// Frames evicted to make room are passed to `on_evict` so the caller
    /// can return their slots. `Block` waits at most `block` and gives up
    /// early once `shutdown` is set.
    pub fn push(
        &self,
        handle: FrameHandle,
        policy: IngressPolicy,
        block: Duration,
        shutdown: &AtomicBool,
        mut on_evict: impl FnMut(FrameHandle),
    ) -> PushOutcome {
        let outcome = match policy {
            IngressPolicy::DropNewest => match self.tx.try_send(handle) {
                Ok(()) => PushOutcome::Queued,
                Err(TrySendError::Full(h)) | Err(TrySendError::Disconnected(h)) => {
                    PushOutcome::Dropped(h)
                }
            },
            IngressPolicy::DropOldest => {
                let mut handle = handle;
                loop {
                    match self.tx.try_send(handle) {
                        Ok(()) => break PushOutcome::Queued,
                        Err(TrySendError::Full(h)) => {
                            handle = h;
                            // Drop oldest frame
                            if let Ok(oldest) = self.rx.try_recv() {
                                self.stats.evicted.fetch_add(1, Ordering::Relaxed);
                                on_evict(oldest);
                            }
                        }
                        Err(TrySendError::Disconnected(h)) => break PushOutcome::Dropped(h),
                    }
                }
            }
            IngressPolicy::Block => match self.tx.try_send(handle) {
                Ok(()) => PushOutcome::Queued,
                Err(TrySendError::Disconnected(h)) => PushOutcome::Dropped(h),
                Err(TrySendError::Full(h)) => self.push_blocking(h, block, shutdown),
            },
        };

        match outcome {
            PushOutcome::Queued => self.stats.pushed.fetch_add(1, Ordering::Relaxed),
            PushOutcome::Dropped(_) => self.stats.rejected.fetch_add(1, Ordering::Relaxed),
        };
        outcome
    }

    /// Full queue under `Block`: retry in short slices until a worker
    /// makes room, `block` runs out or shutdown begins.
    fn push_blocking(&self, mut handle: FrameHandle, block: Duration, shutdown: &AtomicBool) -> PushOutcome {
        let deadline = deadline_after(block);
        loop {
            let remaining = remaining_until(deadline);
            if remaining.is_zero() || shutdown.load(Ordering::Acquire) {
                return PushOutcome::Dropped(handle);
            }
            match self.tx.send_timeout(handle, remaining.min(BLOCK_SLICE)) {
                Ok(()) => return PushOutcome::Queued,
                Err(SendTimeoutError::Timeout(h)) => handle = h,
                Err(SendTimeoutError::Disconnected(h)) => return PushOutcome::Dropped(h),
            }
        }
    }

    /// Consumer: wait up to `wait` for the next handle.
    pub fn pop(&self, wait: Duration) -> Option<FrameHandle> {
        let received = match deadline_after(wait) {
            Some(deadline) => self.rx.recv_deadline(deadline),
            None => self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(handle) => {
                self.stats.popped.fetch_add(1, Ordering::Relaxed);
                Some(handle)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Take every queued handle, leaving the queue empty.
    pub fn drain(&self) -> Vec<FrameHandle> {
        self.rx.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> IngressStats {
        IngressStats {
            pushed: self.stats.pushed.load(Ordering::Relaxed),
            popped: self.stats.popped.load(Ordering::Relaxed),
            evicted: self.stats.evicted.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
        }
    }
}
