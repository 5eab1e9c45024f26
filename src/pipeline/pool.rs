//! Per-camera rings of leased capture buffers.
//!
//! Each camera owns `buffer_count` slots behind its own lock, so cameras
//! never contend with one another. A slot moves through
//!
//! ```text
//!   Free --acquire_free_slot/fill--> Filled --lease--> Leased --release--> Free
//!                                      |
//!                                      +--discard / reclaim_oldest_unconsumed--> Free
//! ```
//!
//! and its generation is bumped every time it is handed out again, so a
//! [`FrameHandle`] that outlived its slot is detected as stale instead of
//! reading someone else's pixels.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use tracing::{debug, trace};

use crate::capture::{BufferRef, CameraId, CapturedBuffer, FrameHandle, PixelFormat};
use crate::error::PoolError;
use crate::inference::{FrameInput, FrameView};
use crate::utils::{deadline_after, remaining_until};
use crate::CameraConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Filled,
    Leased,
}

/// Point-in-time view of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub state: SlotState,
    pub lease_count: u8,
    pub generation: u64,
    pub frame_id: Option<u64>,
}

/// A slot reserved for a capture that has not been attached yet.
#[must_use = "an acquired slot stays reserved until it is filled"]
#[derive(Debug)]
pub struct SlotGrant {
    camera: CameraId,
    slot: u32,
    generation: u64,
}

impl SlotGrant {
    pub fn slot(&self) -> u32 {
        self.slot
    }
}

struct BufferSlot {
    state: SlotState,
    lease_count: u8,
    generation: u64,
    frame_id: Option<u64>,
    payload: Option<CapturedBuffer>,
}

impl BufferSlot {
    fn snapshot(&self) -> SlotSnapshot {
        SlotSnapshot {
            state: self.state,
            lease_count: self.lease_count,
            generation: self.generation,
            frame_id: self.frame_id,
        }
    }

    fn clear(&mut self) -> Option<CapturedBuffer> {
        self.state = SlotState::Free;
        self.lease_count = 0;
        self.frame_id = None;
        self.payload.take()
    }
}

struct SlotRing {
    camera: CameraId,
    width: u32,
    height: u32,
    format: PixelFormat,
    slots: Mutex<Vec<BufferSlot>>,
    freed: Condvar,
}

impl SlotRing {
    fn lock(&self) -> MutexGuard<'_, Vec<BufferSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up the slot a handle refers to, rejecting recycled slots.
    fn checked<'a>(
        &self,
        slots: &'a mut [BufferSlot],
        buffer: BufferRef,
    ) -> Result<&'a mut BufferSlot, PoolError> {
        let slot = slots
            .get_mut(buffer.slot as usize)
            .ok_or(PoolError::UnknownSlot {
                camera: self.camera,
                slot: buffer.slot,
            })?;
        if slot.generation != buffer.generation {
            return Err(PoolError::StaleHandle {
                slot: buffer.slot,
                handle: buffer.generation,
                current: slot.generation,
            });
        }
        Ok(slot)
    }
}

/// Fixed set of capture buffers for every camera in the rig.
pub struct FrameBufferPool {
    rings: Vec<SlotRing>,
}

impl FrameBufferPool {
    pub fn new(cameras: &[CameraConfig]) -> Self {
        let rings = cameras
            .iter()
            .enumerate()
            .map(|(index, camera)| {
                let slots = (0..camera.buffer_count)
                    .map(|_| BufferSlot {
                        state: SlotState::Free,
                        lease_count: 0,
                        generation: 0,
                        frame_id: None,
                        payload: None,
                    })
                    .collect();
                SlotRing {
                    camera: CameraId(index as u16),
                    width: camera.width,
                    height: camera.height,
                    format: camera.format,
                    slots: Mutex::new(slots),
                    freed: Condvar::new(),
                }
            })
            .collect();

        Self { rings }
    }

    fn ring(&self, camera: CameraId) -> Result<&SlotRing, PoolError> {
        self.rings
            .get(camera.index())
            .ok_or(PoolError::UnknownCamera(camera))
    }

    /// Reserve a free slot for a new capture. Never blocks.
    pub fn acquire_free_slot(&self, camera: CameraId) -> Result<SlotGrant, PoolError> {
        let ring = self.ring(camera)?;
        let mut slots = ring.lock();

        let (index, slot) = slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.state == SlotState::Free)
            .ok_or(PoolError::Exhausted { camera })?;

        slot.generation = slot.generation.wrapping_add(1);
        slot.state = SlotState::Filled;
        slot.lease_count = 0;
        slot.frame_id = None;

        Ok(SlotGrant {
            camera,
            slot: index as u32,
            generation: slot.generation,
        })
    }

    /// Attach a captured buffer to a reserved slot and mint its handle.
    pub fn fill(
        &self,
        grant: SlotGrant,
        frame_id: u64,
        captured: CapturedBuffer,
    ) -> Result<FrameHandle, PoolError> {
        let ring = self.ring(grant.camera)?;
        let buffer = BufferRef {
            slot: grant.slot,
            generation: grant.generation,
        };

        let handle = FrameHandle {
            frame_id,
            camera: grant.camera,
            timestamp: captured.timestamp,
            captured_at: Instant::now(),
            width: ring.width,
            height: ring.height,
            format: ring.format,
            buffer,
            keyframe: captured.keyframe,
        };

        let mut slots = ring.lock();
        let slot = ring.checked(&mut slots, buffer)?;
        slot.frame_id = Some(frame_id);
        slot.payload = Some(captured);

        trace!(camera = %grant.camera, slot = grant.slot, frame_id, "Slot filled");
        Ok(handle)
    }

    /// Take the lease on a filled slot. At most one lease exists per slot.
    pub fn lease(&self, handle: &FrameHandle) -> Result<(), PoolError> {
        let ring = self.ring(handle.camera)?;
        let mut slots = ring.lock();
        let slot = ring.checked(&mut slots, handle.buffer)?;

        match slot.state {
            SlotState::Free => Err(PoolError::StaleHandle {
                slot: handle.buffer.slot,
                handle: handle.buffer.generation,
                current: slot.generation,
            }),
            SlotState::Leased => Err(PoolError::AlreadyLeased {
                slot: handle.buffer.slot,
            }),
            SlotState::Filled => {
                slot.state = SlotState::Leased;
                slot.lease_count = 1;
                Ok(())
            }
        }
    }

    /// Give back a lease; the slot returns to Free.
    pub fn release(&self, handle: &FrameHandle) -> Result<(), PoolError> {
        let ring = self.ring(handle.camera)?;
        let payload = {
            let mut slots = ring.lock();
            let slot = ring.checked(&mut slots, handle.buffer)?;

            match slot.state {
                SlotState::Free => {
                    return Err(PoolError::DoubleRelease {
                        slot: handle.buffer.slot,
                    })
                }
                SlotState::Filled => {
                    return Err(PoolError::NotLeased {
                        slot: handle.buffer.slot,
                    })
                }
                SlotState::Leased => {}
            }

            slot.lease_count -= 1;
            if slot.lease_count > 0 {
                return Ok(());
            }
            slot.clear()
        };

        // Dropping the payload hands the memory back to the driver; do it
        // outside the ring lock.
        drop(payload);
        ring.freed.notify_one();
        Ok(())
    }

    /// Return a frame nobody leased (dropped by backpressure or left in
    /// the queue at shutdown) to Free.
    pub fn discard(&self, handle: &FrameHandle) -> Result<(), PoolError> {
        let ring = self.ring(handle.camera)?;
        let payload = {
            let mut slots = ring.lock();
            let slot = ring.checked(&mut slots, handle.buffer)?;

            match slot.state {
                SlotState::Free => {
                    return Err(PoolError::DoubleRelease {
                        slot: handle.buffer.slot,
                    })
                }
                SlotState::Leased => {
                    return Err(PoolError::AlreadyLeased {
                        slot: handle.buffer.slot,
                    })
                }
                SlotState::Filled => slot.clear(),
            }
        };

        drop(payload);
        ring.freed.notify_one();
        Ok(())
    }

    /// Free the oldest filled-but-unleased slot of `camera`, invalidating
    /// the handle still sitting in the ingress queue. Leased slots are
    /// never touched. Returns the reclaimed frame id.
    pub fn reclaim_oldest_unconsumed(&self, camera: CameraId) -> Option<u64> {
        let ring = self.ring(camera).ok()?;
        let (frame_id, payload) = {
            let mut slots = ring.lock();
            let slot = slots
                .iter_mut()
                .filter(|slot| slot.state == SlotState::Filled && slot.frame_id.is_some())
                .min_by_key(|slot| slot.frame_id)?;

            let frame_id = slot.frame_id?;
            slot.generation = slot.generation.wrapping_add(1);
            (frame_id, slot.clear())
        };

        drop(payload);
        debug!(camera = %camera, frame_id, "Reclaimed unconsumed slot");
        ring.freed.notify_one();
        Some(frame_id)
    }

    /// Wait up to `timeout` for `camera` to have a free slot.
    pub fn wait_for_free(&self, camera: CameraId, timeout: Duration) -> bool {
        let Ok(ring) = self.ring(camera) else {
            return false;
        };
        let deadline = deadline_after(timeout);
        let mut slots = ring.lock();

        loop {
            if slots.iter().any(|slot| slot.state == SlotState::Free) {
                return true;
            }
            let remaining = remaining_until(deadline);
            if remaining.is_zero() {
                return false;
            }
            slots = ring
                .freed
                .wait_timeout(slots, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Build the engine-facing view of a live buffer.
    ///
    /// With `allow_dma` and an exported descriptor, the accelerator gets the
    /// DMA buffer itself. Otherwise the view shares the capture memory when
    /// rows are tightly packed (or the format is compressed). Padded rows
    /// are repacked into one fresh buffer: that copy is the last resort and
    /// is reported as [`FrameView::Copied`].
    pub fn map_for_zero_copy(
        &self,
        handle: &FrameHandle,
        allow_dma: bool,
    ) -> Result<FrameInput, PoolError> {
        let ring = self.ring(handle.camera)?;
        let (data, stride, dma) = {
            let mut slots = ring.lock();
            let slot = ring.checked(&mut slots, handle.buffer)?;
            let payload = match (slot.state, slot.payload.as_ref()) {
                (SlotState::Free, _) | (_, None) => {
                    return Err(PoolError::StaleHandle {
                        slot: handle.buffer.slot,
                        handle: handle.buffer.generation,
                        current: slot.generation,
                    })
                }
                (_, Some(payload)) => payload,
            };
            (payload.data.clone(), payload.stride, payload.dma)
        };

        let input = |view, stride| FrameInput {
            view,
            width: handle.width,
            height: handle.height,
            format: handle.format,
            stride,
        };

        if allow_dma {
            if let Some(descriptor) = dma {
                return Ok(input(FrameView::Dma(descriptor), stride));
            }
        }

        let Some(row) = handle.format.packed_row_bytes(handle.width) else {
            return Ok(input(FrameView::Mapped(data), stride));
        };
        let rows = handle.format.rows(handle.height);
        let stride_bytes = stride as usize;

        if stride_bytes <= row {
            let len = (row * rows).min(data.len());
            return Ok(input(FrameView::Mapped(data.slice(..len)), stride));
        }

        debug!(
            camera = %handle.camera,
            frame_id = handle.frame_id,
            stride,
            row,
            "Padded capture rows, repacking for a CPU view"
        );
        let mut packed = BytesMut::with_capacity(row * rows);
        for r in 0..rows {
            let start = r * stride_bytes;
            if start >= data.len() {
                break;
            }
            let end = (start + row).min(data.len());
            packed.put_slice(&data[start..end]);
        }
        Ok(input(FrameView::Copied(packed.freeze()), row as u32))
    }

    pub fn snapshot(&self, camera: CameraId) -> Result<Vec<SlotSnapshot>, PoolError> {
        let ring = self.ring(camera)?;
        let slots = ring.lock();
        Ok(slots.iter().map(BufferSlot::snapshot).collect())
    }

    pub fn free_count(&self, camera: CameraId) -> usize {
        self.count(camera, SlotState::Free)
    }

    pub fn leased_count(&self, camera: CameraId) -> usize {
        self.count(camera, SlotState::Leased)
    }

    /// Slots across all cameras that are not Free.
    pub fn outstanding(&self) -> usize {
        self.rings
            .iter()
            .map(|ring| {
                ring.lock()
                    .iter()
                    .filter(|slot| slot.state != SlotState::Free)
                    .count()
            })
            .sum()
    }

    fn count(&self, camera: CameraId, state: SlotState) -> usize {
        self.ring(camera)
            .map(|ring| ring.lock().iter().filter(|slot| slot.state == state).count())
            .unwrap_or(0)
    }
}
