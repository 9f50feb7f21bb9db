//! # Client Records and Event Delivery
//!
//! A client is one registration of a consumer with the distribution
//! controller, identified by its caller-chosen [`ControllerId`] together with
//! the [`HandlerId`] of the event handler it registered. The same handler may
//! register several times under different controller ids.
//!
//! Clients are told about the hub through [`ClientEventHandler`]. Handlers
//! run on the distribution context and must not block; [`ChannelEventHandler`]
//! forwards every notification into an unbounded channel so the consumer can
//! process it on its own task.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::trace;

use crate::core::format::{BufferId, CaptureParams, ControllerId, HandlerId, SessionId, TargetProcess};
use crate::core::shared_memory::SharedMemoryHandle;
use crate::core::video_frame::VideoFrame;

/// Notifications a registered client receives.
pub trait ClientEventHandler: Send + Sync {
    /// Identity of this handler. Must be stable and unique among live handlers.
    fn handler_id(&self) -> HandlerId;

    /// Process buffers are shared into.
    fn target_process(&self) -> TargetProcess {
        TargetProcess::current()
    }

    /// First use of `buffer_id` by this client. `handle` maps the buffer memory.
    fn on_buffer_created(&self, controller_id: ControllerId, handle: SharedMemoryHandle, size: usize, buffer_id: BufferId);

    /// `buffer_id` was evicted; any cached mapping must be dropped.
    fn on_buffer_destroyed(&self, controller_id: ControllerId, buffer_id: BufferId);

    /// A frame is ready in `buffer_id`. The client owns one hold on the buffer
    /// until it returns it.
    fn on_buffer_ready(&self, controller_id: ControllerId, buffer_id: BufferId, frame: Arc<VideoFrame>, timestamp: Duration);

    /// The capture session failed. No further frames will follow.
    fn on_error(&self, controller_id: ControllerId, reason: &str);

    /// The session was stopped.
    fn on_ended(&self, controller_id: ControllerId);
}

/// Owned form of every [`ClientEventHandler`] notification.
#[derive(Debug)]
pub enum ClientEvent {
    BufferCreated {
        controller_id: ControllerId,
        buffer_id: BufferId,
        handle: SharedMemoryHandle,
        size: usize,
    },
    BufferDestroyed {
        controller_id: ControllerId,
        buffer_id: BufferId,
    },
    BufferReady {
        controller_id: ControllerId,
        buffer_id: BufferId,
        frame: Arc<VideoFrame>,
        timestamp: Duration,
    },
    Error {
        controller_id: ControllerId,
        reason: String,
    },
    Ended {
        controller_id: ControllerId,
    },
}

/// Handler that turns notifications into [`ClientEvent`]s on a channel.
#[derive(Debug)]
pub struct ChannelEventHandler {
    id: HandlerId,
    target: TargetProcess,
    tx: mpsc::UnboundedSender<ClientEvent>,
}

impl ChannelEventHandler {
    pub fn new(id: HandlerId) -> (Arc<Self>, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = Arc::new(Self {
            id,
            target: TargetProcess::current(),
            tx,
        });
        (handler, rx)
    }

    fn send(&self, event: ClientEvent) {
        if self.tx.send(event).is_err() {
            trace!(handler = %self.id, "client event receiver dropped");
        }
    }
}

impl ClientEventHandler for ChannelEventHandler {
    fn handler_id(&self) -> HandlerId {
        self.id
    }

    fn target_process(&self) -> TargetProcess {
        self.target
    }

    fn on_buffer_created(&self, controller_id: ControllerId, handle: SharedMemoryHandle, size: usize, buffer_id: BufferId) {
        self.send(ClientEvent::BufferCreated {
            controller_id,
            buffer_id,
            handle,
            size,
        });
    }

    fn on_buffer_destroyed(&self, controller_id: ControllerId, buffer_id: BufferId) {
        self.send(ClientEvent::BufferDestroyed {
            controller_id,
            buffer_id,
        });
    }

    fn on_buffer_ready(&self, controller_id: ControllerId, buffer_id: BufferId, frame: Arc<VideoFrame>, timestamp: Duration) {
        self.send(ClientEvent::BufferReady {
            controller_id,
            buffer_id,
            frame,
            timestamp,
        });
    }

    fn on_error(&self, controller_id: ControllerId, reason: &str) {
        self.send(ClientEvent::Error {
            controller_id,
            reason: reason.to_string(),
        });
    }

    fn on_ended(&self, controller_id: ControllerId) {
        self.send(ClientEvent::Ended { controller_id });
    }
}

/// Registration record owned by the distribution controller.
pub(crate) struct ControllerClient {
    pub(crate) controller_id: ControllerId,
    pub(crate) handler: Arc<dyn ClientEventHandler>,
    pub(crate) session_id: SessionId,
    pub(crate) params: CaptureParams,
    /// Buffers this client has received a `buffer_created` handshake for.
    pub(crate) known_buffers: BTreeSet<BufferId>,
    /// Frames delivered and not yet returned; one consumer hold each.
    pub(crate) active_buffers: BTreeMap<BufferId, Arc<VideoFrame>>,
    pub(crate) paused: bool,
    pub(crate) session_closed: bool,
}

impl ControllerClient {
    pub(crate) fn new(
        controller_id: ControllerId,
        handler: Arc<dyn ClientEventHandler>,
        session_id: SessionId,
        params: CaptureParams,
    ) -> Self {
        Self {
            controller_id,
            handler,
            session_id,
            params,
            known_buffers: BTreeSet::new(),
            active_buffers: BTreeMap::new(),
            paused: false,
            session_closed: false,
        }
    }

    pub(crate) fn matches(&self, controller_id: ControllerId, handler_id: HandlerId) -> bool {
        self.controller_id == controller_id && self.handler.handler_id() == handler_id
    }

    /// Eligible for new frames.
    pub(crate) fn is_receiving(&self) -> bool {
        !self.session_closed && !self.paused
    }
}
