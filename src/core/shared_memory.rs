//! # Shareable Buffer Memory
//!
//! CPU buffers are backed by an anonymous temporary file mapped with
//! `memmap2`. Sharing a buffer with a consumer hands out a duplicate of the file
//! descriptor; the consumer maps it read-only and sees the producer's writes
//! without any copy.
//!
//! ```text
//!   producer (capture context)            consumer (any context)
//!   ┌──────────────────────────┐          ┌──────────────────────────┐
//!   │ SharedMemory             │  share() │ SharedMemoryHandle       │
//!   │  file ──► MmapMut (rw)   │ ───────▶ │  dup(file) ──► Mmap (ro) │
//!   └──────────────────────────┘          └──────────────────────────┘
//!                   \____________ same pages ____________/
//! ```

use std::fs::File;
use std::io;

use memmap2::{Mmap, MmapMut, MmapOptions};
use parking_lot::{Mutex, MutexGuard};

/// Writable shared memory region owned by one buffer tracker.
#[derive(Debug)]
pub struct SharedMemory {
    file: File,
    len: usize,
    map: Mutex<MmapMut>,
}

impl SharedMemory {
    /// Creates a zero-filled region of `len` bytes.
    ///
    /// # Errors
    ///
    /// Fails if the temporary file cannot be created, sized or mapped, or if
    /// `len` is zero.
    pub fn create(len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty region",
            ));
        }
        let file = tempfile::tempfile()?;
        file.set_len(len as u64)?;
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self {
            file,
            len,
            map: Mutex::new(map),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Locks the mapping for writing. Only the producer holding the buffer
    /// should write.
    pub fn lock(&self) -> MutexGuard<'_, MmapMut> {
        self.map.lock()
    }

    /// Duplicates the file handle so another party can map the same pages.
    pub fn share(&self) -> io::Result<SharedMemoryHandle> {
        Ok(SharedMemoryHandle {
            file: self.file.try_clone()?,
            size: self.len,
        })
    }
}

/// Transferable handle to a [`SharedMemory`] region.
#[derive(Debug)]
pub struct SharedMemoryHandle {
    file: File,
    size: usize,
}

impl SharedMemoryHandle {
    /// Mapped size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Maps the region read-only.
    pub fn map(&self) -> io::Result<Mmap> {
        unsafe { MmapOptions::new().len(self.size).map(&self.file) }
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            file: self.file.try_clone()?,
            size: self.size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_sees_producer_writes() {
        let memory = SharedMemory::create(64).unwrap();
        let handle = memory.share().unwrap();
        assert_eq!(handle.size(), 64);

        memory.lock()[..4].copy_from_slice(&[1, 2, 3, 4]);

        let view = handle.map().unwrap();
        assert_eq!(&view[..4], &[1, 2, 3, 4]);
        assert!(view[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_empty_region_is_rejected() {
        let err = SharedMemory::create(0).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
