//! # Capture Fan-out Hub
//!
//! A bounded pool of reusable frame buffers shared between one capture
//! producer and any number of consumers, plus the distribution controller
//! that fans every captured frame out to registered clients.
//!
//! ## Architecture
//!
//! - `core`: capture formats, ids, shared memory, buffer trackers and the
//!   bounded [`BufferPool`]
//! - `capture`: the [`CaptureAdapter`] that converts raw frames into pooled
//!   I420 buffers, and the [`CaptureSource`] abstraction that feeds it
//! - `controller`: client registration and the [`DistributionController`]
//! - `session`: spawns the distribution task and hands out a [`HubHandle`]
//! - `config`: hub configuration with JSON loading
//! - `error`: error taxonomy with severity classification
//!
//! ## Buffer lifetime
//!
//! A buffer is reserved by the producer, filled, and posted to the
//! distribution context. The controller adds one consumer hold per receiving
//! client before the producer reservation is released. The buffer is free for
//! reuse once every client has returned it.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use capture_fanout::{
//!     CaptureParams, ChannelEventHandler, ControllerId, HandlerId, HubConfig, HubSession, SessionId,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = HubConfig::default();
//! let params = CaptureParams::new(config.requested_format);
//! let session = HubSession::spawn(config)?;
//!
//! let (handler, mut events) = ChannelEventHandler::new(HandlerId(1));
//! session.handle.add_client(ControllerId(1), handler, SessionId(7), params)?;
//! # let _ = events.recv().await;
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod config;
pub mod controller;
pub mod core;
pub mod error;
pub mod session;
pub mod telemetry;

pub use crate::capture::{CaptureAdapter, CaptureSource, ProducerBuffer, SyntheticSource, run_capture};
pub use crate::config::HubConfig;
pub use crate::controller::{ChannelEventHandler, ClientEvent, ClientEventHandler, DistributionController};
pub use crate::core::{
    BufferId, BufferPool, CaptureFormat, CaptureParams, ControllerId, HandlerId, SessionId, StorageKind,
    VideoFrame,
};
pub use crate::error::{ErrorSeverity, HasSeverity, HubError, HubResult, PoolError, Recoverable};
pub use crate::session::{ClientCounts, HubHandle, HubSession};
