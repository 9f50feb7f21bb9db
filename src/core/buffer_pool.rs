//! # Buffer Pool Module
//!
//! A fixed-capacity pool of recyclable frame buffers shared between one
//! producer (the capture adapter) and any number of consumers (the clients
//! a frame was fanned out to).
//!
//! ## Overview
//!
//! Every buffer has a producer hold flag and a consumer hold count. The
//! producer reserves a buffer, fills it, and hands it to the distribution
//! controller, which adds one consumer hold per client it delivered to before
//! the producer hold is dropped. The buffer becomes reusable once every
//! client has returned it.
//!
//! ```text
//!                reserve_for_producer          hold_for_consumers(n)
//!   ┌────────┐ ───────────────────────▶ ┌──────────┐ ─────────────────▶ ┌──────────────┐
//!   │  free  │                          │ producer │                    │ producer + n │
//!   └────────┘ ◀─────────────────────── └──────────┘                    └──────────────┘
//!       ▲       relinquish_producer_reservation                              │
//!       │                                                                     │ relinquish_producer_reservation
//!       │         relinquish_consumer_hold (count reaches 0)           ┌──────────────┐
//!       └───────────────────────────────────────────────────────────── │  n consumers │
//!                                                                      └──────────────┘
//! ```
//!
//! ## Reservation policy
//!
//! 1. Reuse the oldest free tracker with the same format and storage whose
//!    backing is large enough.
//! 2. Otherwise allocate a new tracker if the pool is below capacity.
//! 3. Otherwise evict the largest free tracker (oldest on ties) and allocate a
//!    replacement; the evicted id is returned so cached references can be
//!    dropped.
//! 4. If nothing is free the reservation fails. This is backpressure, not an
//!    error.
//!
//! Backing memory is allocated outside the pool lock. While an allocation is
//! in flight its slot (and its eviction candidate, if any) is held so a
//! concurrent caller cannot claim it.
//!
//! ## Example
//!
//! ```rust
//! use capture_fanout::core::buffer_pool::BufferPool;
//! use capture_fanout::core::format::StorageKind;
//! use cap_convert::format::{PixelFormat, Size};
//!
//! let pool = BufferPool::with_shared_memory(3);
//! let size = Size::new(64, 48);
//!
//! let reservation = pool
//!     .reserve_for_producer(PixelFormat::I420, StorageKind::Cpu, size)
//!     .expect("pool has room");
//! assert!((pool.utilization() - 1.0 / 3.0).abs() < 1e-9);
//!
//! pool.hold_for_consumers(reservation.buffer_id, 2).unwrap();
//! pool.relinquish_producer_reservation(reservation.buffer_id).unwrap();
//! pool.relinquish_consumer_hold(reservation.buffer_id, 2).unwrap();
//! assert_eq!(pool.utilization(), 0.0);
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use cap_convert::format::{PixelFormat, Size};
use parking_lot::Mutex;
use tracing::{error, warn};

use crate::core::buffer_tracker::{
    Backing, BackingAllocator, BufferTracker, SharedMemoryAllocator, TrackerSnapshot,
};
use crate::core::format::{BufferId, StorageKind, TargetProcess};
use crate::core::shared_memory::SharedMemoryHandle;
use crate::error::PoolError;

/// Outcome of a successful [`BufferPool::reserve_for_producer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reservation {
    pub buffer_id: BufferId,
    /// Tracker destroyed to make room for this reservation.
    pub evicted: Option<BufferId>,
}

struct PoolInner {
    next_buffer_id: u32,
    trackers: BTreeMap<BufferId, BufferTracker>,
    /// Slots claimed by allocations running outside the lock.
    pending_allocations: usize,
}

/// Bounded pool of buffer trackers. All state changes go through one mutex.
pub struct BufferPool {
    capacity: usize,
    allocator: Arc<dyn BackingAllocator>,
    inner: Mutex<PoolInner>,
}

enum Plan {
    Reuse(BufferId),
    Allocate { evict: Option<BufferId> },
}

impl BufferPool {
    /// Creates an empty pool holding at most `capacity` trackers.
    pub fn new(capacity: usize, allocator: Arc<dyn BackingAllocator>) -> Self {
        Self {
            capacity,
            allocator,
            inner: Mutex::new(PoolInner {
                next_buffer_id: 1,
                trackers: BTreeMap::new(),
                pending_allocations: 0,
            }),
        }
    }

    /// Pool backed by [`SharedMemoryAllocator`].
    pub fn with_shared_memory(capacity: usize) -> Self {
        Self::new(capacity, Arc::new(SharedMemoryAllocator::new()))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reserves a buffer able to hold one `pixel_format` image of `dimensions`.
    ///
    /// Returns `None` when every tracker is held (backpressure), when the
    /// request is malformed, or when backing allocation fails.
    ///
    /// # Performance Characteristics
    ///
    /// **Time complexity**: O(capacity) under the lock, plus one allocation
    /// outside it when no tracker can be reused.
    pub fn reserve_for_producer(
        &self,
        pixel_format: PixelFormat,
        storage: StorageKind,
        dimensions: Size,
    ) -> Option<Reservation> {
        if dimensions.is_empty() || pixel_format == PixelFormat::Unknown {
            error!(%dimensions, %pixel_format, "invalid buffer reservation request");
            return None;
        }
        let bytes = pixel_format.allocation_size(dimensions);

        let evict = {
            let mut inner = self.inner.lock();
            match self.plan_reservation(&inner, pixel_format, storage, bytes)? {
                Plan::Reuse(id) => {
                    if let Some(tracker) = inner.trackers.get_mut(&id) {
                        tracker.held_by_producer = true;
                        tracker.dimensions = dimensions;
                    }
                    return Some(Reservation {
                        buffer_id: id,
                        evicted: None,
                    });
                }
                Plan::Allocate { evict } => {
                    inner.pending_allocations += 1;
                    if let Some(tracker) = evict.and_then(|id| inner.trackers.get_mut(&id)) {
                        tracker.held_by_producer = true;
                    }
                    evict
                }
            }
        };

        let allocated = self.allocator.allocate(storage, bytes);

        let mut inner = self.inner.lock();
        inner.pending_allocations -= 1;
        let backing = match allocated {
            Ok(backing) => backing,
            Err(e) => {
                error!(%dimensions, %pixel_format, "failed to allocate buffer backing: {e}");
                if let Some(tracker) = evict.and_then(|id| inner.trackers.get_mut(&id)) {
                    tracker.held_by_producer = false;
                }
                return None;
            }
        };

        if let Some(id) = evict {
            inner.trackers.remove(&id);
        }
        let buffer_id = BufferId(inner.next_buffer_id);
        inner.next_buffer_id += 1;
        let mut tracker = BufferTracker::new(pixel_format, dimensions, backing);
        tracker.held_by_producer = true;
        inner.trackers.insert(buffer_id, tracker);

        Some(Reservation {
            buffer_id,
            evicted: evict,
        })
    }

    fn plan_reservation(
        &self,
        inner: &PoolInner,
        pixel_format: PixelFormat,
        storage: StorageKind,
        bytes: usize,
    ) -> Option<Plan> {
        let mut candidate: Option<(BufferId, usize)> = None;
        for (&id, tracker) in &inner.trackers {
            if !tracker.is_free() {
                continue;
            }
            if tracker.fits(pixel_format, storage, bytes) {
                return Some(Plan::Reuse(id));
            }
            let len = tracker.backing.len();
            if candidate.is_none_or(|(_, largest)| len > largest) {
                candidate = Some((id, len));
            }
        }

        if inner.trackers.len() + inner.pending_allocations < self.capacity {
            return Some(Plan::Allocate { evict: None });
        }
        candidate.map(|(id, _)| Plan::Allocate { evict: Some(id) })
    }

    /// Releases the producer's claim on `buffer_id`.
    pub fn relinquish_producer_reservation(&self, buffer_id: BufferId) -> Result<(), PoolError> {
        let mut inner = self.inner.lock();
        let tracker = Self::tracker_mut(&mut inner, buffer_id)?;
        if !tracker.held_by_producer {
            error!(%buffer_id, "producer reservation released twice");
            return Err(PoolError::NotProducerHeld(buffer_id));
        }
        tracker.held_by_producer = false;
        Ok(())
    }

    /// Adds `num_clients` consumer holds. Zero is a no-op.
    pub fn hold_for_consumers(&self, buffer_id: BufferId, num_clients: usize) -> Result<(), PoolError> {
        let mut inner = self.inner.lock();
        let tracker = Self::tracker_mut(&mut inner, buffer_id)?;
        tracker.consumer_hold_count += num_clients;
        Ok(())
    }

    /// Drops `num_clients` consumer holds, never going below zero.
    pub fn relinquish_consumer_hold(&self, buffer_id: BufferId, num_clients: usize) -> Result<(), PoolError> {
        let mut inner = self.inner.lock();
        let tracker = Self::tracker_mut(&mut inner, buffer_id)?;
        if num_clients > tracker.consumer_hold_count {
            warn!(
                %buffer_id,
                held = tracker.consumer_hold_count,
                released = num_clients,
                "more consumer holds released than taken"
            );
        }
        tracker.consumer_hold_count = tracker.consumer_hold_count.saturating_sub(num_clients);
        Ok(())
    }

    /// Fraction of capacity occupied by held trackers, in `[0.0, 1.0]`.
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        let inner = self.inner.lock();
        let held = inner.trackers.values().filter(|t| !t.is_free()).count();
        held as f64 / self.capacity as f64
    }

    /// Backing memory of `buffer_id`.
    pub fn buffer_handle(&self, buffer_id: BufferId) -> Result<Backing, PoolError> {
        let mut inner = self.inner.lock();
        Ok(Self::tracker_mut(&mut inner, buffer_id)?.backing.clone())
    }

    /// Makes `buffer_id`'s memory mappable by `target`.
    pub fn share_to_process(
        &self,
        buffer_id: BufferId,
        target: TargetProcess,
    ) -> Result<SharedMemoryHandle, PoolError> {
        let backing = self.buffer_handle(buffer_id)?;
        let memory = backing
            .shared_memory()
            .ok_or(PoolError::NoCpuMapping(buffer_id))?;
        memory.share().map_err(|source| {
            warn!(%buffer_id, %target, "failed to share buffer: {source}");
            PoolError::Share { buffer_id, source }
        })
    }

    /// Number of live trackers.
    pub fn tracker_count(&self) -> usize {
        self.inner.lock().trackers.len()
    }

    pub fn tracker(&self, buffer_id: BufferId) -> Option<TrackerSnapshot> {
        self.inner.lock().trackers.get(&buffer_id).map(BufferTracker::snapshot)
    }

    fn tracker_mut(inner: &mut PoolInner, buffer_id: BufferId) -> Result<&mut BufferTracker, PoolError> {
        inner.trackers.get_mut(&buffer_id).ok_or_else(|| {
            error!(%buffer_id, "use of unknown buffer id");
            PoolError::InvalidBufferId(buffer_id)
        })
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("BufferPool")
            .field("capacity", &self.capacity)
            .field("trackers", &inner.trackers.len())
            .field("next_buffer_id", &inner.next_buffer_id)
            .finish()
    }
}
