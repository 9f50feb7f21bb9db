//! Common test utilities shared by the integration tests.
//!
//! `Harness` wires a pool, an adapter and a controller together with the same
//! channels the session uses, but pumps them by hand so tests stay
//! deterministic.

#![allow(dead_code)]

use std::sync::Arc;

use cap_convert::format::{PixelFormat, Size};
use capture_fanout::capture::{CaptureAdapter, CapturedFrame};
use capture_fanout::controller::{ChannelEventHandler, ClientEvent, ControllerEvent, DistributionController};
use capture_fanout::core::{BufferId, BufferPool, CaptureFormat, CaptureParams, ControllerId, HandlerId, SessionId};
use tokio::sync::mpsc;

pub struct Harness {
    pub pool: Arc<BufferPool>,
    pub adapter: CaptureAdapter,
    pub controller: DistributionController,
    frames: mpsc::Receiver<CapturedFrame>,
    events: mpsc::UnboundedReceiver<ControllerEvent>,
}

impl Harness {
    pub fn new(capacity: usize) -> Self {
        let pool = Arc::new(BufferPool::with_shared_memory(capacity));
        let (frame_tx, frames) = mpsc::channel(capacity + 1);
        let (event_tx, events) = mpsc::unbounded_channel();
        Self {
            adapter: CaptureAdapter::new(Arc::clone(&pool), frame_tx, event_tx, 1.0),
            controller: DistributionController::new(Arc::clone(&pool)),
            pool,
            frames,
            events,
        }
    }

    /// Registers a client whose session id equals its controller id.
    pub fn add_client(&mut self, controller_id: u32, handler_id: u64) -> mpsc::UnboundedReceiver<ClientEvent> {
        let (handler, rx) = ChannelEventHandler::new(HandlerId(handler_id));
        self.controller.add_client(
            ControllerId(controller_id),
            handler,
            SessionId(controller_id as i32),
            CaptureParams::new(test_frames::i420_format(Size::new(444, 200))),
        );
        rx
    }

    /// Feeds a solid I420 frame through the adapter and distributes it.
    pub fn push_i420(&mut self, size: Size, luma: u8) {
        let format = test_frames::i420_format(size);
        let data = test_frames::solid_i420(size, luma);
        self.adapter.on_incoming_captured_data(&data, &format, 0, Default::default());
        self.pump();
    }

    /// Serves queued adapter events, then queued frames, like the session loop.
    pub fn pump(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.controller.handle_event(event);
        }
        while let Ok(CapturedFrame { buffer, frame, timestamp }) = self.frames.try_recv() {
            self.controller.distribute_frame(buffer, frame, timestamp);
        }
    }

    pub fn return_buffer(&mut self, controller_id: u32, handler_id: u64, buffer_id: BufferId, feedback: Option<f64>) {
        self.controller
            .return_buffer(ControllerId(controller_id), HandlerId(handler_id), buffer_id, feedback);
    }

    pub fn consumer_holds(&self, buffer_id: BufferId) -> usize {
        self.pool
            .tracker(buffer_id)
            .map(|t| t.consumer_hold_count)
            .unwrap_or_default()
    }
}

/// Drains every event currently queued for a client.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Buffer ids of `BufferReady` events, in delivery order.
pub fn ready_ids(events: &[ClientEvent]) -> Vec<BufferId> {
    events
        .iter()
        .filter_map(|e| match e {
            ClientEvent::BufferReady { buffer_id, .. } => Some(*buffer_id),
            _ => None,
        })
        .collect()
}

/// Buffer ids of `BufferCreated` events, in delivery order.
pub fn created_ids(events: &[ClientEvent]) -> Vec<BufferId> {
    events
        .iter()
        .filter_map(|e| match e {
            ClientEvent::BufferCreated { buffer_id, .. } => Some(*buffer_id),
            _ => None,
        })
        .collect()
}

/// Buffer ids of `BufferDestroyed` events, in delivery order.
pub fn destroyed_ids(events: &[ClientEvent]) -> Vec<BufferId> {
    events
        .iter()
        .filter_map(|e| match e {
            ClientEvent::BufferDestroyed { buffer_id, .. } => Some(*buffer_id),
            _ => None,
        })
        .collect()
}

pub fn error_reasons(events: &[ClientEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            ClientEvent::Error { reason, .. } => Some(reason.clone()),
            _ => None,
        })
        .collect()
}

/// Test frame builders
pub mod test_frames {
    use super::*;

    pub fn i420_format(size: Size) -> CaptureFormat {
        CaptureFormat::new(size, 30.0, PixelFormat::I420)
    }

    pub fn argb_format(size: Size) -> CaptureFormat {
        CaptureFormat::new(size, 30.0, PixelFormat::Argb)
    }

    /// I420 image with every luma sample set to `luma` and neutral chroma.
    pub fn solid_i420(size: Size, luma: u8) -> Vec<u8> {
        let y_len = (size.width * size.height) as usize;
        let uv_len = (size.width.div_ceil(2) * size.height.div_ceil(2)) as usize;
        let mut data = vec![luma; y_len];
        data.resize(y_len + 2 * uv_len, 128);
        data
    }

    /// ARGB image (B,G,R,A byte order) of one colour.
    pub fn solid_argb(size: Size, r: u8, g: u8, b: u8) -> Vec<u8> {
        let mut data = Vec::with_capacity((size.width * size.height * 4) as usize);
        for _ in 0..size.width * size.height {
            data.extend_from_slice(&[b, g, r, 255]);
        }
        data
    }
}
