//! # Hub Session Management
//!
//! Wires the three execution contexts of a capture hub together with message
//! passing:
//!
//! ```text
//!   capture context                 distribution context (tokio task)         consumer contexts
//!  ┌────────────────┐  frames (bounded)  ┌─────────────────────────────┐  ClientEvent   ┌──────────┐
//!  │ CaptureAdapter │ ─────────────────▶ │                             │ ─────────────▶ │ client A │
//!  │                │  events (unbounded)│   DistributionController    │                └──────────┘
//!  │                │ ─────────────────▶ │                             │ ─────────────▶ ┌──────────┐
//!  └───────┬────────┘                    └──────────────▲──────────────┘                │ client B │
//!          │ reserve                                    │ commands (unbounded)          └────┬─────┘
//!          ▼                                            │                                    │
//!     BufferPool (mutex) ◀────── hold / relinquish ─────┴──────────── HubHandle ◀────────────┘
//! ```
//!
//! The controller is owned by the distribution task, so every controller
//! operation runs one at a time. Only the pool is shared, behind its mutex.
//! Adapter events are served before commands, and commands before frames,
//! so an eviction notice always reaches clients before a frame that reuses
//! the buffer slot, and returned buffers are recycled before new frames are
//! fanned out.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::capture::adapter::{CaptureAdapter, CapturedFrame};
use crate::config::HubConfig;
use crate::controller::client::ClientEventHandler;
use crate::controller::controller::{ControllerEvent, DistributionController};
use crate::core::buffer_pool::BufferPool;
use crate::core::buffer_tracker::{BackingAllocator, SharedMemoryAllocator};
use crate::core::format::{BufferId, CaptureFormat, CaptureParams, ControllerId, HandlerId, SessionId};
use crate::error::{HubError, HubResult};

enum Command {
    AddClient {
        controller_id: ControllerId,
        handler: Arc<dyn ClientEventHandler>,
        session_id: SessionId,
        params: CaptureParams,
    },
    RemoveClient {
        controller_id: ControllerId,
        handler_id: HandlerId,
        reply: oneshot::Sender<Option<SessionId>>,
    },
    PauseOrResume {
        controller_id: ControllerId,
        handler_id: HandlerId,
        pause: bool,
    },
    StopSession(SessionId),
    ReturnBuffer {
        controller_id: ControllerId,
        handler_id: HandlerId,
        buffer_id: BufferId,
        consumer_feedback: Option<f64>,
    },
    GetActiveFormat(oneshot::Sender<Option<CaptureFormat>>),
    ClientCount(oneshot::Sender<ClientCounts>),
    Shutdown,
}

/// Registered clients, and how many of them are not paused.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClientCounts {
    pub total: usize,
    pub active: usize,
}

/// Admin and consumer surface of a running hub. Cheap to clone.
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::UnboundedSender<Command>,
    pool: Arc<BufferPool>,
}

impl HubHandle {
    fn send(&self, command: Command) -> HubResult<()> {
        self.commands.send(command).map_err(|_| HubError::SessionClosed)
    }

    pub fn add_client(
        &self,
        controller_id: ControllerId,
        handler: Arc<dyn ClientEventHandler>,
        session_id: SessionId,
        params: CaptureParams,
    ) -> HubResult<()> {
        self.send(Command::AddClient {
            controller_id,
            handler,
            session_id,
            params,
        })
    }

    /// Unregisters a client and waits for its session id.
    pub async fn remove_client(&self, controller_id: ControllerId, handler_id: HandlerId) -> HubResult<Option<SessionId>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::RemoveClient {
            controller_id,
            handler_id,
            reply,
        })?;
        rx.await.map_err(|_| HubError::SessionClosed)
    }

    pub fn pause_client(&self, controller_id: ControllerId, handler_id: HandlerId) -> HubResult<()> {
        self.send(Command::PauseOrResume {
            controller_id,
            handler_id,
            pause: true,
        })
    }

    pub fn resume_client(&self, controller_id: ControllerId, handler_id: HandlerId) -> HubResult<()> {
        self.send(Command::PauseOrResume {
            controller_id,
            handler_id,
            pause: false,
        })
    }

    pub fn stop_session(&self, session_id: SessionId) -> HubResult<()> {
        self.send(Command::StopSession(session_id))
    }

    /// Gives a delivered buffer back. Safe to call from any thread.
    pub fn return_buffer(
        &self,
        controller_id: ControllerId,
        handler_id: HandlerId,
        buffer_id: BufferId,
        consumer_feedback: Option<f64>,
    ) -> HubResult<()> {
        self.send(Command::ReturnBuffer {
            controller_id,
            handler_id,
            buffer_id,
            consumer_feedback,
        })
    }

    pub async fn active_format(&self) -> HubResult<Option<CaptureFormat>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GetActiveFormat(reply))?;
        rx.await.map_err(|_| HubError::SessionClosed)
    }

    pub async fn client_counts(&self) -> HubResult<ClientCounts> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ClientCount(reply))?;
        rx.await.map_err(|_| HubError::SessionClosed)
    }

    /// Asks the distribution task to stop after the commands already queued.
    pub fn shutdown(&self) -> HubResult<()> {
        self.send(Command::Shutdown)
    }

    pub fn pool_utilization(&self) -> f64 {
        self.pool.utilization()
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }
}

/// A running hub.
pub struct HubSession {
    pub handle: HubHandle,
    /// Belongs on the capture context.
    pub adapter: CaptureAdapter,
    /// Resolves to the controller once the distribution task ends.
    pub task: JoinHandle<DistributionController>,
}

impl HubSession {
    /// Starts a hub backed by shared memory. Must be called within a tokio runtime.
    pub fn spawn(config: HubConfig) -> HubResult<Self> {
        Self::spawn_with_allocator(config, Arc::new(SharedMemoryAllocator::new()))
    }

    pub fn spawn_with_allocator(config: HubConfig, allocator: Arc<dyn BackingAllocator>) -> HubResult<Self> {
        config.validate().map_err(HubError::Config)?;

        let pool = Arc::new(BufferPool::new(config.max_buffers, allocator));
        let (frame_tx, frame_rx) = mpsc::channel(config.frame_queue_depth);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let controller = DistributionController::new(Arc::clone(&pool));
        let task = tokio::spawn(run_distribution(controller, frame_rx, event_rx, command_rx));
        info!(
            max_buffers = config.max_buffers,
            frame_queue_depth = config.frame_queue_depth,
            format = %config.requested_format,
            "hub started"
        );

        Ok(Self {
            handle: HubHandle {
                commands: command_tx,
                pool: Arc::clone(&pool),
            },
            adapter: CaptureAdapter::new(pool, frame_tx, event_tx, config.utilization_throttle),
            task,
        })
    }
}

async fn run_distribution(
    mut controller: DistributionController,
    mut frames: mpsc::Receiver<CapturedFrame>,
    mut events: mpsc::UnboundedReceiver<ControllerEvent>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) -> DistributionController {
    loop {
        tokio::select! {
            biased;
            Some(event) = events.recv() => controller.handle_event(event),
            Some(command) = commands.recv() => {
                if !handle_command(&mut controller, command) {
                    break;
                }
            }
            Some(captured) = frames.recv() => {
                let CapturedFrame { buffer, frame, timestamp } = captured;
                controller.distribute_frame(buffer, frame, timestamp);
            }
            else => break,
        }
    }
    debug!(clients = controller.client_count(), "distribution context stopped");
    controller
}

/// Returns `false` when the loop should stop.
fn handle_command(controller: &mut DistributionController, command: Command) -> bool {
    match command {
        Command::AddClient {
            controller_id,
            handler,
            session_id,
            params,
        } => controller.add_client(controller_id, handler, session_id, params),
        Command::RemoveClient {
            controller_id,
            handler_id,
            reply,
        } => {
            let _ = reply.send(controller.remove_client(controller_id, handler_id));
        }
        Command::PauseOrResume {
            controller_id,
            handler_id,
            pause,
        } => controller.pause_or_resume_client(controller_id, handler_id, pause),
        Command::StopSession(session_id) => controller.stop_session(session_id),
        Command::ReturnBuffer {
            controller_id,
            handler_id,
            buffer_id,
            consumer_feedback,
        } => controller.return_buffer(controller_id, handler_id, buffer_id, consumer_feedback),
        Command::GetActiveFormat(reply) => {
            let _ = reply.send(controller.video_capture_format());
        }
        Command::ClientCount(reply) => {
            let _ = reply.send(ClientCounts {
                total: controller.client_count(),
                active: controller.active_client_count(),
            });
        }
        Command::Shutdown => return false,
    }
    true
}
