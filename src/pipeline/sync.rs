//! Cross-camera reconciliation by capture timestamp.
//!
//! Workers finish out of order, so each camera's recent results are kept
//! sorted by (timestamp, frame id) in a bounded buffer. A probe takes the
//! earliest buffered timestamp across cameras as the reference and looks
//! for one result per camera within the tolerance of it.
//!
//! Frames still queued or being extracted are tracked per camera, so a
//! reference is only given up once nothing in flight could still match it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::trace;

use crate::capture::CameraId;
use crate::pipeline::result::ExtractionResult;
use crate::utils::{deadline_after, remaining_until};

type Key = (Duration, u64);

/// One result per camera, all within tolerance of `reference`.
#[derive(Debug, Clone)]
pub struct SyncedSet {
    pub reference: Duration,
    /// Indexed by camera
    pub results: Vec<ExtractionResult>,
}

impl SyncedSet {
    pub fn get(&self, camera: CameraId) -> Option<&ExtractionResult> {
        self.results.get(camera.index())
    }

    /// Largest timestamp difference inside the set.
    pub fn spread(&self) -> Duration {
        let stamps = self.results.iter().map(|r| r.timestamp);
        match (stamps.clone().min(), stamps.max()) {
            (Some(lo), Some(hi)) => hi - lo,
            _ => Duration::ZERO,
        }
    }
}

/// What a synchronized pull could assemble before its deadline.
#[derive(Debug, Clone)]
pub struct PartialSet {
    pub reference: Duration,
    /// Indexed by camera; `None` where no candidate was buffered
    pub results: Vec<Option<ExtractionResult>>,
}

impl PartialSet {
    pub fn missing(&self) -> Vec<CameraId> {
        self.results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_none())
            .map(|(index, _)| CameraId(index as u16))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub enum SyncOutcome {
    Complete(SyncedSet),
    /// Deadline passed with only some cameras holding a candidate.
    Partial(PartialSet),
    /// Deadline passed with nothing buffered.
    TimedOut,
    Stopped,
}

enum Probe {
    Matched(SyncedSet),
    Pending(Option<PartialSet>),
}

struct SyncState {
    buffers: Vec<BTreeMap<Key, ExtractionResult>>,
    /// Per camera: frame id -> capture timestamp of frames not yet settled
    in_flight: Vec<BTreeMap<u64, Duration>>,
    closed: bool,
}

pub struct SynchronizationStage {
    depth: usize,
    state: Mutex<SyncState>,
    ready: Condvar,
    evicted: AtomicU64,
    unmatched: AtomicU64,
}

fn distance(a: Duration, b: Duration) -> Duration {
    if a > b {
        a - b
    } else {
        b - a
    }
}

impl SynchronizationStage {
    pub fn new(camera_count: usize, depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            state: Mutex::new(SyncState {
                buffers: (0..camera_count).map(|_| BTreeMap::new()).collect(),
                in_flight: (0..camera_count).map(|_| BTreeMap::new()).collect(),
                closed: false,
            }),
            ready: Condvar::new(),
            evicted: AtomicU64::new(0),
            unmatched: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Announce a frame whose result will arrive later, either through
    /// [`insert`](Self::insert) or [`abandon`](Self::abandon).
    pub fn expect(&self, camera: CameraId, frame_id: u64, timestamp: Duration) {
        if let Some(pending) = self.lock().in_flight.get_mut(camera.index()) {
            pending.insert(frame_id, timestamp);
        }
    }

    /// An announced frame will never produce a result.
    pub fn abandon(&self, camera: CameraId, frame_id: u64) {
        let removed = self
            .lock()
            .in_flight
            .get_mut(camera.index())
            .and_then(|pending| pending.remove(&frame_id))
            .is_some();
        if removed {
            self.ready.notify_all();
        }
    }

    /// Buffer a result, dropping that camera's oldest on overflow.
    pub fn insert(&self, result: ExtractionResult) {
        {
            let mut state = self.lock();
            let index = result.camera.index();
            if let Some(pending) = state.in_flight.get_mut(index) {
                pending.remove(&result.frame_id);
            }
            let Some(buffer) = state.buffers.get_mut(index) else {
                return;
            };
            buffer.insert((result.timestamp, result.frame_id), result);
            if buffer.len() > self.depth {
                if let Some(((_, frame_id), oldest)) = buffer.pop_first() {
                    trace!(camera = %oldest.camera, frame_id, "Sync buffer overflow");
                    self.evicted.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        self.ready.notify_all();
    }

    /// Single non-blocking probe.
    pub fn try_synchronize(&self, tolerance: Duration) -> Option<SyncedSet> {
        match self.probe(&mut self.lock(), tolerance) {
            Probe::Matched(set) => Some(set),
            Probe::Pending(_) => None,
        }
    }

    /// Probe until a set is complete, the deadline passes, or the stage
    /// closes.
    pub fn wait_synchronized(&self, tolerance: Duration, timeout: Duration) -> SyncOutcome {
        let deadline = deadline_after(timeout);
        let mut state = self.lock();

        loop {
            let partial = match self.probe(&mut state, tolerance) {
                Probe::Matched(set) => return SyncOutcome::Complete(set),
                Probe::Pending(partial) => partial,
            };
            if state.closed {
                return SyncOutcome::Stopped;
            }
            let remaining = remaining_until(deadline);
            if remaining.is_zero() {
                return partial.map_or(SyncOutcome::TimedOut, SyncOutcome::Partial);
            }
            state = self
                .ready
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn probe(&self, state: &mut SyncState, tolerance: Duration) -> Probe {
        loop {
            // Reference: earliest buffered timestamp, lowest camera on ties.
            let Some((ref_camera, reference)) = state
                .buffers
                .iter()
                .enumerate()
                .filter_map(|(index, buffer)| buffer.keys().next().map(|k| (index, k.0)))
                .min_by_key(|&(index, stamp)| (stamp, index))
            else {
                return Probe::Pending(None);
            };

            let horizon = reference.saturating_add(tolerance);
            let low = (reference.saturating_sub(tolerance), 0);
            let high = (horizon, u64::MAX);
            let candidates: Vec<Option<Key>> = state
                .buffers
                .iter()
                .map(|buffer| {
                    buffer
                        .range(low..=high)
                        .map(|(key, _)| *key)
                        .min_by_key(|key| distance(key.0, reference))
                })
                .collect();

            if candidates.iter().all(Option::is_some) {
                let results = candidates
                    .iter()
                    .zip(state.buffers.iter_mut())
                    .filter_map(|(key, buffer)| key.and_then(|key| buffer.remove(&key)))
                    .collect();
                return Probe::Matched(SyncedSet { reference, results });
            }

            // Every camera lacking a candidate has already delivered a
            // result past the window and has nothing in flight that could
            // still land inside it: the reference can never be matched.
            let unmatchable = candidates
                .iter()
                .zip(state.buffers.iter().zip(state.in_flight.iter()))
                .filter(|(key, _)| key.is_none())
                .all(|(_, (buffer, pending))| {
                    buffer
                        .last_key_value()
                        .is_some_and(|(key, _)| key.0 > horizon)
                        && pending.values().all(|&stamp| stamp > horizon)
                });

            if unmatchable {
                if let Some(((_, frame_id), _)) = state.buffers[ref_camera].pop_first() {
                    trace!(camera = ref_camera, frame_id, "Unmatchable sync reference dropped");
                    self.unmatched.fetch_add(1, Ordering::Relaxed);
                }
                continue;
            }

            let results = candidates
                .iter()
                .zip(state.buffers.iter())
                .map(|(key, buffer)| key.and_then(|key| buffer.get(&key).cloned()))
                .collect();
            return Probe::Pending(Some(PartialSet { reference, results }));
        }
    }

    /// Wake every waiter and make further waits return `Stopped`.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn buffered(&self, camera: CameraId) -> usize {
        self.lock()
            .buffers
            .get(camera.index())
            .map_or(0, BTreeMap::len)
    }

    /// Announced frames of `camera` with no result or abandonment yet.
    pub fn in_flight(&self, camera: CameraId) -> usize {
        self.lock()
            .in_flight
            .get(camera.index())
            .map_or(0, BTreeMap::len)
    }

    /// Results pushed out by buffer overflow.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// References dropped because no match could arrive any more.
    pub fn unmatched(&self) -> u64 {
        self.unmatched.load(Ordering::Relaxed)
    }
}
