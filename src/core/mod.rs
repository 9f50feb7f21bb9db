//! # Core Infrastructure Module
//!
//! The pooled-buffer layer shared by the capture and distribution contexts:
//! capture format descriptors and ids, shareable backing memory, buffer
//! trackers, the bounded buffer pool and the frame descriptors handed to
//! clients.

pub mod buffer_pool;
pub mod buffer_tracker;
pub mod format;
pub mod shared_memory;
pub mod video_frame;

pub use buffer_pool::{BufferPool, Reservation};
pub use buffer_tracker::{Backing, BackingAllocator, ExternalToken, SharedMemoryAllocator, TrackerSnapshot};
pub use format::{BufferId, CaptureFormat, CaptureParams, ControllerId, HandlerId, SessionId, StorageKind, TargetProcess};
pub use shared_memory::{SharedMemory, SharedMemoryHandle};
pub use video_frame::{FrameMetadata, VideoFrame};
