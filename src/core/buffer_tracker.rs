//! # Buffer Trackers and Backing Allocation
//!
//! A [`BufferTracker`] is the pool's bookkeeping for one physical buffer:
//! what it was sized for, who holds it, and the memory behind it. Backing
//! memory comes from a [`BackingAllocator`] passed to the pool at
//! construction, so tests and external collaborators can substitute their own.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use cap_convert::format::{PixelFormat, Size};

use crate::core::format::StorageKind;
use crate::core::shared_memory::SharedMemory;

/// Opaque reference to memory owned by an external collaborator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ExternalToken(pub u64);

/// Memory behind a tracker.
#[derive(Clone, Debug)]
pub enum Backing {
    /// Mappable shared memory.
    Shared(Arc<SharedMemory>),
    /// Externally owned storage; `len` is the byte size it was requested at.
    External { token: ExternalToken, len: usize },
}

impl Backing {
    pub fn len(&self) -> usize {
        match self {
            Backing::Shared(memory) => memory.len(),
            Backing::External { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn storage(&self) -> StorageKind {
        match self {
            Backing::Shared(_) => StorageKind::Cpu,
            Backing::External { .. } => StorageKind::External,
        }
    }

    pub fn shared_memory(&self) -> Option<&Arc<SharedMemory>> {
        match self {
            Backing::Shared(memory) => Some(memory),
            Backing::External { .. } => None,
        }
    }
}

/// Provides backing memory for new trackers.
pub trait BackingAllocator: Send + Sync {
    fn allocate(&self, storage: StorageKind, bytes: usize) -> io::Result<Backing>;
}

/// Default allocator: shared memory for CPU storage, sequential tokens for
/// external storage.
#[derive(Debug, Default)]
pub struct SharedMemoryAllocator {
    next_token: AtomicU64,
}

impl SharedMemoryAllocator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BackingAllocator for SharedMemoryAllocator {
    fn allocate(&self, storage: StorageKind, bytes: usize) -> io::Result<Backing> {
        match storage {
            StorageKind::Cpu => Ok(Backing::Shared(Arc::new(SharedMemory::create(bytes)?))),
            StorageKind::External => Ok(Backing::External {
                token: ExternalToken(self.next_token.fetch_add(1, Ordering::Relaxed)),
                len: bytes,
            }),
        }
    }
}

/// Bookkeeping for one pooled buffer.
#[derive(Debug)]
pub struct BufferTracker {
    pub(crate) pixel_format: PixelFormat,
    pub(crate) storage: StorageKind,
    /// Dimensions of the most recent reservation.
    pub(crate) dimensions: Size,
    pub(crate) held_by_producer: bool,
    pub(crate) consumer_hold_count: usize,
    pub(crate) backing: Backing,
}

impl BufferTracker {
    pub(crate) fn new(pixel_format: PixelFormat, dimensions: Size, backing: Backing) -> Self {
        Self {
            pixel_format,
            storage: backing.storage(),
            dimensions,
            held_by_producer: false,
            consumer_hold_count: 0,
            backing,
        }
    }

    /// Neither the producer nor any consumer holds the buffer.
    pub fn is_free(&self) -> bool {
        !self.held_by_producer && self.consumer_hold_count == 0
    }

    /// Can serve a reservation of `bytes` for this format and storage without reallocating.
    pub(crate) fn fits(&self, pixel_format: PixelFormat, storage: StorageKind, bytes: usize) -> bool {
        self.pixel_format == pixel_format && self.storage == storage && self.backing.len() >= bytes
    }

    pub(crate) fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            pixel_format: self.pixel_format,
            storage: self.storage,
            dimensions: self.dimensions,
            held_by_producer: self.held_by_producer,
            consumer_hold_count: self.consumer_hold_count,
            backing_len: self.backing.len(),
        }
    }
}

/// Copy of a tracker's state, for diagnostics and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrackerSnapshot {
    pub pixel_format: PixelFormat,
    pub storage: StorageKind,
    pub dimensions: Size,
    pub held_by_producer: bool,
    pub consumer_hold_count: usize,
    pub backing_len: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_tokens_are_distinct() {
        let allocator = SharedMemoryAllocator::new();
        let a = allocator.allocate(StorageKind::External, 16).unwrap();
        let b = allocator.allocate(StorageKind::External, 16).unwrap();
        match (a, b) {
            (Backing::External { token: ta, .. }, Backing::External { token: tb, .. }) => {
                assert_ne!(ta, tb)
            }
            other => panic!("unexpected backings: {other:?}"),
        }
    }

    #[test]
    fn test_tracker_fit_and_freedom() {
        let backing = SharedMemoryAllocator::new()
            .allocate(StorageKind::Cpu, 150)
            .unwrap();
        let mut tracker = BufferTracker::new(PixelFormat::I420, Size::new(10, 10), backing);
        assert!(tracker.is_free());
        assert!(tracker.fits(PixelFormat::I420, StorageKind::Cpu, 150));
        assert!(!tracker.fits(PixelFormat::I420, StorageKind::Cpu, 151));
        assert!(!tracker.fits(PixelFormat::Argb, StorageKind::Cpu, 100));
        assert!(!tracker.fits(PixelFormat::I420, StorageKind::External, 100));

        tracker.consumer_hold_count = 1;
        assert!(!tracker.is_free());
    }
}
