//! Frame descriptors handed to clients.
//!
//! A [`VideoFrame`] carries no pixels. CPU frames live in the pooled buffer
//! the client was told about in its `buffer_created` handshake; external
//! frames carry the collaborator's token. The metadata block is shared by
//! every client the frame went to, which is what lets consumer feedback be
//! aggregated per frame.

use cap_convert::format::{I420Layout, PixelFormat, Size};
use parking_lot::Mutex;

use crate::core::buffer_tracker::ExternalToken;
use crate::core::format::StorageKind;

/// Per-frame metadata, mutable after the frame is shared.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FrameMetadata {
    pub frame_rate: Option<f64>,
    /// Largest utilization reported by any consumer of this frame.
    pub resource_utilization: Option<f64>,
}

#[derive(Debug)]
pub struct VideoFrame {
    pixel_format: PixelFormat,
    storage: StorageKind,
    coded_size: Size,
    external: Option<ExternalToken>,
    metadata: Mutex<FrameMetadata>,
}

impl VideoFrame {
    /// Frame whose pixels are in a CPU-mapped pool buffer.
    pub fn cpu(pixel_format: PixelFormat, coded_size: Size) -> Self {
        Self::new(pixel_format, StorageKind::Cpu, coded_size, None)
    }

    /// Frame whose pixels live in externally owned storage.
    pub fn external(pixel_format: PixelFormat, coded_size: Size, token: ExternalToken) -> Self {
        Self::new(pixel_format, StorageKind::External, coded_size, Some(token))
    }

    fn new(
        pixel_format: PixelFormat,
        storage: StorageKind,
        coded_size: Size,
        external: Option<ExternalToken>,
    ) -> Self {
        Self {
            pixel_format,
            storage,
            coded_size,
            external,
            metadata: Mutex::new(FrameMetadata::default()),
        }
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    pub fn storage(&self) -> StorageKind {
        self.storage
    }

    pub fn coded_size(&self) -> Size {
        self.coded_size
    }

    pub fn external_token(&self) -> Option<ExternalToken> {
        self.external
    }

    /// Plane layout inside the shared buffer for CPU I420 frames.
    pub fn i420_layout(&self) -> Option<I420Layout> {
        (self.storage == StorageKind::Cpu && self.pixel_format == PixelFormat::I420)
            .then(|| I420Layout::new(self.coded_size))
    }

    /// Only CPU I420 and external ARGB frames can be handed to clients.
    pub fn is_distributable(&self) -> bool {
        matches!(
            (self.storage, self.pixel_format),
            (StorageKind::Cpu, PixelFormat::I420) | (StorageKind::External, PixelFormat::Argb)
        )
    }

    pub fn metadata(&self) -> FrameMetadata {
        *self.metadata.lock()
    }

    pub fn frame_rate(&self) -> Option<f64> {
        self.metadata.lock().frame_rate
    }

    pub fn set_frame_rate(&self, frame_rate: f64) {
        self.metadata.lock().frame_rate = Some(frame_rate);
    }

    /// Sets the frame rate unless one is already present. Returns whether it was set.
    pub fn set_frame_rate_if_missing(&self, frame_rate: f64) -> bool {
        let mut metadata = self.metadata.lock();
        if metadata.frame_rate.is_some() {
            return false;
        }
        metadata.frame_rate = Some(frame_rate);
        true
    }

    pub fn resource_utilization(&self) -> Option<f64> {
        self.metadata.lock().resource_utilization
    }

    /// Keeps the maximum of the recorded utilization and `utilization`.
    pub fn merge_resource_utilization(&self, utilization: f64) {
        let mut metadata = self.metadata.lock();
        metadata.resource_utilization = Some(match metadata.resource_utilization {
            Some(current) => current.max(utilization),
            None => utilization,
        });
    }
}
