//! # Distribution Controller
//!
//! The hub of a capture session. It owns the client list, fans every captured
//! frame out to the clients that want it, collects their feedback when they
//! return buffers, and latches the session into a terminal error state when
//! the capture source fails.
//!
//! ## Fan-out
//!
//! ```text
//!                       ┌──────────────────────────┐
//!   CapturedFrame ────▶ │ DistributionController   │──▶ client A  buffer_created? + buffer_ready
//!   (producer hold)     │  for each receiving      │──▶ client B  buffer_ready
//!                       │  client: handshake,      │    client C  (paused: skipped)
//!                       │  deliver, count          │
//!                       └────────────┬─────────────┘
//!                                    │ hold_for_consumers(id, delivered)
//!                                    ▼
//!                              BufferPool  ◀── return_buffer (one hold each)
//! ```
//!
//! Consumer holds are added before the producer hold is released, so a
//! delivered buffer is never free while a client may still read it.
//!
//! The controller is single-threaded: it lives on the distribution context
//! (see [`crate::session`]) and only the pool is shared with other contexts.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::capture::adapter::ProducerBuffer;
use crate::controller::client::{ClientEventHandler, ControllerClient};
use crate::core::buffer_pool::BufferPool;
use crate::core::format::{
    BufferId, CaptureFormat, CaptureParams, ControllerId, HandlerId, SessionId, StorageKind,
};
use crate::core::video_frame::VideoFrame;
use crate::error::{log_error, HubError, HubResult};

/// Aspect ratio recorded when the first frame has zero height.
pub const INVALID_ASPECT_RATIO: u32 = 99999;

/// Controller-wide state. `Error` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerState {
    Started,
    Error,
}

/// Events posted by the capture context.
#[derive(Debug)]
pub enum ControllerEvent {
    /// The capture source failed.
    Error(String),
    /// The pool evicted this buffer to make room for a larger one.
    BufferDestroyed(BufferId),
    /// Free-form diagnostic from the capture source.
    Log(String),
}

/// Diagnostics recorded from the first distributed frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FirstFrameStats {
    pub width: u32,
    pub height: u32,
    /// `width * 100 / height`, or [`INVALID_ASPECT_RATIO`].
    pub aspect_ratio_x100: u32,
    pub frame_rate: Option<f64>,
}

/// Read-only view of one client registration.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientInfo {
    pub session_id: SessionId,
    pub params: CaptureParams,
    pub paused: bool,
    pub session_closed: bool,
    pub known_buffers: Vec<BufferId>,
    pub active_buffers: Vec<BufferId>,
}

pub struct DistributionController {
    pool: Arc<BufferPool>,
    clients: Vec<ControllerClient>,
    state: ControllerState,
    error_reason: Option<String>,
    video_capture_format: Option<CaptureFormat>,
    first_frame: Option<FirstFrameStats>,
}

impl DistributionController {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            pool,
            clients: Vec::new(),
            state: ControllerState::Started,
            error_reason: None,
            video_capture_format: None,
            first_frame: None,
        }
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Registers a client. A client added while in `Error` is told about the
    /// error and not registered; re-adding a registered client does nothing.
    pub fn add_client(
        &mut self,
        controller_id: ControllerId,
        handler: Arc<dyn ClientEventHandler>,
        session_id: SessionId,
        params: CaptureParams,
    ) {
        let handler_id = handler.handler_id();
        debug!(%controller_id, %handler_id, %session_id, format = %params.requested_format, "add client");

        // The first client's request becomes the active format, even in Error.
        if self.clients.is_empty() {
            self.video_capture_format = Some(params.requested_format);
        }

        if self.state == ControllerState::Error {
            let reason = self.error_reason.as_deref().unwrap_or("capture failed");
            handler.on_error(controller_id, reason);
            return;
        }

        if self.find_client(controller_id, handler_id).is_some() {
            return;
        }

        self.clients
            .push(ControllerClient::new(controller_id, handler, session_id, params));
    }

    /// Unregisters a client, releasing every buffer it still holds. Returns
    /// its session id, or `None` if it was not registered.
    pub fn remove_client(&mut self, controller_id: ControllerId, handler_id: HandlerId) -> Option<SessionId> {
        let index = self.find_client(controller_id, handler_id)?;
        let client = self.clients.remove(index);
        debug!(
            %controller_id,
            %handler_id,
            outstanding = client.active_buffers.len(),
            "remove client"
        );

        for &buffer_id in client.active_buffers.keys() {
            if let Err(e) = self.pool.relinquish_consumer_hold(buffer_id, 1) {
                log_error("releasing removed client's buffer", &HubError::from(e));
            }
        }
        Some(client.session_id)
    }

    pub fn pause_or_resume_client(&mut self, controller_id: ControllerId, handler_id: HandlerId, pause: bool) {
        match self.find_client(controller_id, handler_id) {
            Some(index) => {
                debug!(%controller_id, %handler_id, pause, "pause or resume client");
                self.clients[index].paused = pause;
            }
            None => warn!(%controller_id, %handler_id, "pause/resume for unknown client"),
        }
    }

    /// Closes the client registered for `session_id` and tells it the session ended.
    pub fn stop_session(&mut self, session_id: SessionId) {
        debug!(%session_id, "stop session");
        if let Some(client) = self.clients.iter_mut().find(|c| c.session_id == session_id) {
            client.session_closed = true;
            client.handler.on_ended(client.controller_id);
        }
    }

    /// Fans `frame` out to every receiving client.
    ///
    /// `buffer` carries the producer hold; it is released when this returns,
    /// after the consumer holds for this frame are in place.
    pub fn distribute_frame(&mut self, buffer: ProducerBuffer, frame: Arc<VideoFrame>, timestamp: Duration) {
        if self.state != ControllerState::Started {
            return;
        }
        if !frame.is_distributable() {
            error!(
                format = %frame.pixel_format(),
                storage = ?frame.storage(),
                "dropping frame with unsupported format/storage combination"
            );
            return;
        }

        if let Some(format) = &self.video_capture_format {
            frame.set_frame_rate_if_missing(format.frame_rate);
        }

        let buffer_id = buffer.id();
        let mut delivered = 0;
        for client in self.clients.iter_mut().filter(|c| c.is_receiving()) {
            if frame.storage() == StorageKind::Cpu && !client.known_buffers.contains(&buffer_id) {
                let handle = match self.pool.share_to_process(buffer_id, client.handler.target_process()) {
                    Ok(handle) => handle,
                    Err(e) => {
                        log_error("buffer handshake", &HubError::from(e));
                        continue;
                    }
                };
                let size = handle.size();
                client.known_buffers.insert(buffer_id);
                client
                    .handler
                    .on_buffer_created(client.controller_id, handle, size, buffer_id);
            }

            client
                .handler
                .on_buffer_ready(client.controller_id, buffer_id, Arc::clone(&frame), timestamp);
            if client.active_buffers.insert(buffer_id, Arc::clone(&frame)).is_some() {
                warn!(%buffer_id, controller_id = %client.controller_id, "buffer delivered twice");
            }
            delivered += 1;
        }

        if let Err(e) = self.pool.hold_for_consumers(buffer_id, delivered) {
            log_error("holding delivered buffer", &HubError::from(e));
        }

        if self.first_frame.is_none() {
            self.record_first_frame(&frame);
        }
        drop(buffer);
    }

    fn record_first_frame(&mut self, frame: &VideoFrame) {
        let size = frame.coded_size();
        let aspect_ratio_x100 = if size.height == 0 {
            INVALID_ASPECT_RATIO
        } else {
            (u64::from(size.width) * 100 / u64::from(size.height)) as u32
        };
        let stats = FirstFrameStats {
            width: size.width,
            height: size.height,
            aspect_ratio_x100,
            frame_rate: frame.frame_rate(),
        };
        info!(
            width = stats.width,
            height = stats.height,
            aspect_ratio_x100 = stats.aspect_ratio_x100,
            frame_rate = ?stats.frame_rate,
            "first frame distributed"
        );
        self.first_frame = Some(stats);
    }

    /// A client is done with `buffer_id`. `consumer_feedback` is merged into
    /// the frame's utilization when it is finite and non-negative.
    pub fn return_buffer(
        &mut self,
        controller_id: ControllerId,
        handler_id: HandlerId,
        buffer_id: BufferId,
        consumer_feedback: Option<f64>,
    ) {
        if let Err(e) = self.try_return_buffer(controller_id, handler_id, buffer_id, consumer_feedback) {
            log_error("return buffer", &e);
        }
    }

    fn try_return_buffer(
        &mut self,
        controller_id: ControllerId,
        handler_id: HandlerId,
        buffer_id: BufferId,
        consumer_feedback: Option<f64>,
    ) -> HubResult<()> {
        let index = self.find_client(controller_id, handler_id).ok_or_else(|| {
            HubError::ProtocolViolation(format!(
                "buffer {buffer_id} returned by unknown client {controller_id}/{handler_id}"
            ))
        })?;
        let frame = self.clients[index]
            .active_buffers
            .remove(&buffer_id)
            .ok_or_else(|| {
                HubError::ProtocolViolation(format!(
                    "client {controller_id}/{handler_id} returned buffer {buffer_id} it does not hold"
                ))
            })?;

        if let Some(utilization) = consumer_feedback.filter(|u| u.is_finite() && *u >= 0.0) {
            frame.merge_resource_utilization(utilization);
        }

        self.pool.relinquish_consumer_hold(buffer_id, 1)?;
        Ok(())
    }

    /// Latches `Error` and tells every open client.
    pub fn notify_error(&mut self, reason: &str) {
        error!("capture error: {reason}");
        self.state = ControllerState::Error;
        self.error_reason = Some(reason.to_string());
        for client in self.clients.iter().filter(|c| !c.session_closed) {
            client.handler.on_error(client.controller_id, reason);
        }
    }

    /// Forgets `buffer_id` for every client that knew it.
    pub fn notify_buffer_evicted(&mut self, buffer_id: BufferId) {
        for client in self.clients.iter_mut().filter(|c| !c.session_closed) {
            if client.known_buffers.remove(&buffer_id) {
                client.handler.on_buffer_destroyed(client.controller_id, buffer_id);
            }
        }
    }

    pub fn handle_event(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::Error(reason) => self.notify_error(&reason),
            ControllerEvent::BufferDestroyed(buffer_id) => self.notify_buffer_evicted(buffer_id),
            ControllerEvent::Log(message) => info!("Video capture: {message}"),
        }
    }

    pub fn video_capture_format(&self) -> Option<CaptureFormat> {
        self.video_capture_format
    }

    pub fn first_frame_stats(&self) -> Option<FirstFrameStats> {
        self.first_frame
    }

    pub fn error_reason(&self) -> Option<&str> {
        self.error_reason.as_deref()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Registered clients that are not paused.
    pub fn active_client_count(&self) -> usize {
        self.clients.iter().filter(|c| !c.paused).count()
    }

    pub fn client_info(&self, controller_id: ControllerId, handler_id: HandlerId) -> Option<ClientInfo> {
        let client = &self.clients[self.find_client(controller_id, handler_id)?];
        Some(ClientInfo {
            session_id: client.session_id,
            params: client.params,
            paused: client.paused,
            session_closed: client.session_closed,
            known_buffers: client.known_buffers.iter().copied().collect(),
            active_buffers: client.active_buffers.keys().copied().collect(),
        })
    }

    fn find_client(&self, controller_id: ControllerId, handler_id: HandlerId) -> Option<usize> {
        self.clients.iter().position(|c| c.matches(controller_id, handler_id))
    }
}
