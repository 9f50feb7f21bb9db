//! # Capture Adapter
//!
//! Runs on the capture context and turns raw captured images into pooled,
//! canonical I420 frames for the distribution controller.
//!
//! ## Per-frame flow
//!
//! ```text
//!   raw bytes + CaptureFormat + rotation
//!        │
//!        ├─ validate format and rotation ........... invalid → drop
//!        ├─ crop to even size, swap axes for 90/270
//!        ├─ reserve I420 buffer from the pool ...... exhausted → drop
//!        ├─ convert into the buffer ................ failure → drop (reservation released)
//!        └─ try_send CapturedFrame ................. queue full → drop (reservation released)
//! ```
//!
//! Drops are silent frame-level events: they are counted and logged at debug
//! or warn level, never reported to clients. Only [`CaptureAdapter::report_error`]
//! ends a session.

use std::sync::Arc;
use std::time::Duration;

use cap_convert::cpu::{convert_to_i420, i420_copy, ConvertError, ConvertRequest, Staging};
use cap_convert::format::{I420Layout, I420PlanesRef, PixelFormat, Rotation, Size};
use parking_lot::{MappedMutexGuard, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::controller::controller::ControllerEvent;
use crate::core::buffer_pool::BufferPool;
use crate::core::buffer_tracker::{Backing, ExternalToken};
use crate::core::format::{BufferId, CaptureFormat, StorageKind};
use crate::core::video_frame::VideoFrame;
use crate::error::{log_error, HubError, HubResult, PoolError};

/// A buffer reserved for the producer. Dropping it releases the reservation.
pub struct ProducerBuffer {
    buffer_id: BufferId,
    pool: Arc<BufferPool>,
    backing: Backing,
    pixel_format: PixelFormat,
    dimensions: Size,
}

impl ProducerBuffer {
    pub fn id(&self) -> BufferId {
        self.buffer_id
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    pub fn storage(&self) -> StorageKind {
        self.backing.storage()
    }

    /// Dimensions the buffer was reserved for.
    pub fn dimensions(&self) -> Size {
        self.dimensions
    }

    /// Token of externally backed storage.
    pub fn external_token(&self) -> Option<ExternalToken> {
        match self.backing {
            Backing::External { token, .. } => Some(token),
            Backing::Shared(_) => None,
        }
    }

    /// Writable view of CPU-backed memory. `None` for external storage.
    pub fn data_mut(&mut self) -> Option<MappedMutexGuard<'_, [u8]>> {
        let memory = self.backing.shared_memory()?;
        Some(MutexGuard::map(memory.lock(), |map| &mut map[..]))
    }
}

impl Drop for ProducerBuffer {
    fn drop(&mut self) {
        // Misuse is already reported by the pool.
        let _ = self.pool.relinquish_producer_reservation(self.buffer_id);
    }
}

impl std::fmt::Debug for ProducerBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerBuffer")
            .field("buffer_id", &self.buffer_id)
            .field("pixel_format", &self.pixel_format)
            .field("dimensions", &self.dimensions)
            .finish()
    }
}

/// A filled buffer on its way to the distribution context.
#[derive(Debug)]
pub struct CapturedFrame {
    pub buffer: ProducerBuffer,
    pub frame: Arc<VideoFrame>,
    pub timestamp: Duration,
}

/// Counters kept by the adapter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AdapterStats {
    pub frames_delivered: u64,
    pub frames_dropped: u64,
}

pub struct CaptureAdapter {
    pool: Arc<BufferPool>,
    frames: mpsc::Sender<CapturedFrame>,
    events: mpsc::UnboundedSender<ControllerEvent>,
    staging: Staging,
    last_pixel_format: Option<PixelFormat>,
    last_frame: Option<Arc<VideoFrame>>,
    utilization_throttle: f64,
    stats: AdapterStats,
}

impl CaptureAdapter {
    pub fn new(
        pool: Arc<BufferPool>,
        frames: mpsc::Sender<CapturedFrame>,
        events: mpsc::UnboundedSender<ControllerEvent>,
        utilization_throttle: f64,
    ) -> Self {
        Self {
            pool,
            frames,
            events,
            staging: Staging::new(),
            last_pixel_format: None,
            last_frame: None,
            utilization_throttle,
            stats: AdapterStats::default(),
        }
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn stats(&self) -> AdapterStats {
        self.stats
    }

    /// Converts one packed or compressed image and hands it off. `rotation`
    /// is clockwise degrees and must be a multiple of 90 below 360.
    pub fn on_incoming_captured_data(
        &mut self,
        data: &[u8],
        format: &CaptureFormat,
        rotation: i32,
        timestamp: Duration,
    ) {
        if self.last_pixel_format != Some(format.pixel_format) {
            self.log(format!("Pixel format: {}", format.pixel_format));
            self.last_pixel_format = Some(format.pixel_format);
        }

        if let Err(e) = self.convert_and_deliver(data, format, rotation, timestamp) {
            self.stats.frames_dropped += 1;
            log_error("dropping captured frame", &e);
        }
    }

    fn convert_and_deliver(
        &mut self,
        data: &[u8],
        format: &CaptureFormat,
        rotation: i32,
        timestamp: Duration,
    ) -> HubResult<()> {
        let rotation = Rotation::from_degrees(rotation).ok_or(HubError::InvalidRotation(rotation))?;
        let crop = format.frame_size.even();
        if !format.is_valid() || crop.is_empty() {
            return Err(HubError::InvalidFormat(*format));
        }
        let output_size = rotation.apply(crop);

        let mut buffer = self
            .reserve_output_buffer(output_size, PixelFormat::I420, StorageKind::Cpu)
            .ok_or(HubError::PoolExhausted)?;

        let request = ConvertRequest {
            src_size: format.frame_size,
            format: format.pixel_format,
            flip_vertical: format.flip_vertical,
            crop,
            rotation,
        };
        {
            let buffer_id = buffer.id();
            let mut data_out = buffer.data_mut().ok_or(PoolError::NoCpuMapping(buffer_id))?;
            let planes = I420Layout::new(output_size)
                .split_mut(&mut data_out[..])
                .ok_or(ConvertError::DestinationTooSmall)?;
            convert_to_i420(data, &request, planes, &mut self.staging)?;
        }

        let frame = VideoFrame::cpu(PixelFormat::I420, output_size);
        frame.set_frame_rate(format.frame_rate);
        self.deliver_frame(buffer, frame, timestamp);
        Ok(())
    }

    /// Copies an already planar I420 image, honouring each plane's stride.
    pub fn on_incoming_captured_yuv_data(
        &mut self,
        planes: &I420PlanesRef<'_>,
        format: &CaptureFormat,
        timestamp: Duration,
    ) {
        if let Err(e) = self.copy_and_deliver(planes, format, timestamp) {
            self.stats.frames_dropped += 1;
            log_error("dropping planar frame", &e);
        }
    }

    fn copy_and_deliver(
        &mut self,
        planes: &I420PlanesRef<'_>,
        format: &CaptureFormat,
        timestamp: Duration,
    ) -> HubResult<()> {
        if format.pixel_format != PixelFormat::I420 || !format.is_valid() {
            return Err(HubError::InvalidFormat(*format));
        }
        let size = format.frame_size;
        let mut buffer = self
            .reserve_output_buffer(size, PixelFormat::I420, StorageKind::Cpu)
            .ok_or(HubError::PoolExhausted)?;
        {
            let buffer_id = buffer.id();
            let mut data_out = buffer.data_mut().ok_or(PoolError::NoCpuMapping(buffer_id))?;
            let dst = I420Layout::new(size)
                .split_mut(&mut data_out[..])
                .ok_or(ConvertError::DestinationTooSmall)?;
            i420_copy(planes, size, dst)?;
        }

        let frame = VideoFrame::cpu(PixelFormat::I420, size);
        frame.set_frame_rate(format.frame_rate);
        self.deliver_frame(buffer, frame, timestamp);
        Ok(())
    }

    /// Reserves a buffer from the pool. If a buffer had to be evicted, the
    /// controller is told so clients can forget it.
    pub fn reserve_output_buffer(
        &self,
        dimensions: Size,
        pixel_format: PixelFormat,
        storage: StorageKind,
    ) -> Option<ProducerBuffer> {
        let reservation = self.pool.reserve_for_producer(pixel_format, storage, dimensions)?;
        if let Some(evicted) = reservation.evicted {
            debug!(%evicted, "buffer evicted for resize");
            let _ = self.events.send(ControllerEvent::BufferDestroyed(evicted));
        }

        let backing = match self.pool.buffer_handle(reservation.buffer_id) {
            Ok(backing) => backing,
            Err(_) => {
                let _ = self.pool.relinquish_producer_reservation(reservation.buffer_id);
                return None;
            }
        };
        Some(ProducerBuffer {
            buffer_id: reservation.buffer_id,
            pool: Arc::clone(&self.pool),
            backing,
            pixel_format,
            dimensions,
        })
    }

    /// Hands a filled buffer and its frame descriptor to the controller.
    /// Never blocks: if the frame queue is full the frame is dropped.
    pub fn deliver_frame(&mut self, buffer: ProducerBuffer, frame: VideoFrame, timestamp: Duration) {
        let frame = Arc::new(frame);
        let captured = CapturedFrame {
            buffer,
            frame: Arc::clone(&frame),
            timestamp,
        };
        match self.frames.try_send(captured) {
            Ok(()) => {
                self.last_frame = Some(frame);
                self.stats.frames_delivered += 1;
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.frames_dropped += 1;
                debug!("frame queue full, dropping frame");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.frames_dropped += 1;
                debug!("distribution context gone, dropping frame");
            }
        }
    }

    /// The capture source failed; the session cannot continue.
    pub fn report_error(&self, reason: &str) {
        log_error("video capture", &HubError::CaptureSource(reason.to_string()));
        self.log(format!("Error: {reason}"));
        let _ = self.events.send(ControllerEvent::Error(reason.to_string()));
    }

    /// Forwards a diagnostic message to the controller's log.
    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        if self.events.send(ControllerEvent::Log(message.clone())).is_err() {
            info!("Video capture: {message}");
        }
    }

    pub fn buffer_pool_utilization(&self) -> f64 {
        self.pool.utilization()
    }

    /// The capture loop should skip a frame.
    pub fn should_throttle(&self) -> bool {
        self.pool.utilization() > self.utilization_throttle
    }

    /// Largest utilization reported by the consumers of the last frame handed off.
    pub fn last_resource_utilization(&self) -> Option<f64> {
        self.last_frame.as_ref()?.resource_utilization()
    }
}
