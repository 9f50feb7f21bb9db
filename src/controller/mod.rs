//! # Distribution Module
//!
//! Client registration and frame fan-out.

pub mod client;
#[allow(clippy::module_inception)]
pub mod controller;

pub use client::{ChannelEventHandler, ClientEvent, ClientEventHandler};
pub use controller::{
    ClientInfo, ControllerEvent, ControllerState, DistributionController, FirstFrameStats,
    INVALID_ASPECT_RATIO,
};
