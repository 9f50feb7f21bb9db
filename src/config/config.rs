//! # Configuration Module
//!
//! Configuration for one distribution hub: how many buffers the pool may
//! hold, how deep the capture→distribution queue is, the format the capture
//! source is asked for, and when the producer should back off.
//!
//! ## Configuration Parameters
//!
//! | Parameter | Type | Range | Description |
//! |-----------|------|-------|-------------|
//! | `max_buffers` | `usize` | 1-64 | Pool capacity |
//! | `frame_queue_depth` | `usize` | ≥ 1 | Frames in flight between capture and distribution |
//! | `requested_format` | `CaptureFormat` | valid format | Format asked of the capture source |
//! | `utilization_throttle` | `f64` | 0.0-1.0 | Pool utilization at which capture skips frames |
//!
//! ## Examples
//!
//! ```rust
//! use capture_fanout::config::config::HubConfig;
//!
//! // Use defaults
//! let config = HubConfig::default();
//! assert!(config.validate().is_ok());
//!
//! // Load from JSON; missing fields keep their defaults
//! let config = HubConfig::from_json_str(r#"{ "max_buffers": 5 }"#).unwrap();
//! assert_eq!(config.max_buffers, 5);
//! assert_eq!(config.frame_queue_depth, 4);
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::format::CaptureFormat;
use crate::error::{HubError, HubResult};

/// Largest pool a hub may be configured with.
pub const MAX_BUFFERS_LIMIT: usize = 64;

/// Configuration structure for a distribution hub.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Maximum number of buffers alive at once.
    ///
    /// Each buffer holds one canonical frame. Every client holding a frame
    /// pins one buffer, so this bounds how far the slowest client may lag
    /// before capture starts dropping frames.
    pub max_buffers: usize,

    /// Depth of the bounded capture→distribution frame queue.
    ///
    /// When the queue is full new frames are dropped instead of blocking the
    /// capture context.
    pub frame_queue_depth: usize,

    /// Format requested from the capture source.
    pub requested_format: CaptureFormat,

    /// Pool utilization above which the capture loop skips a frame.
    pub utilization_throttle: f64,
}

impl Default for HubConfig {
    /// Default values:
    /// - `max_buffers`: 3
    /// - `frame_queue_depth`: 4
    /// - `requested_format`: 640x480 I420 at 30 fps in CPU memory
    /// - `utilization_throttle`: 0.8
    fn default() -> Self {
        Self {
            max_buffers: 3,
            frame_queue_depth: 4,
            requested_format: CaptureFormat::default(),
            utilization_throttle: 0.8,
        }
    }
}

impl HubConfig {
    pub fn new(max_buffers: usize, frame_queue_depth: usize, requested_format: CaptureFormat) -> Self {
        Self {
            max_buffers,
            frame_queue_depth,
            requested_format,
            ..Self::default()
        }
    }

    /// Validates the configuration parameters.
    ///
    /// Time complexity: O(1) - constant-time range checks.
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=MAX_BUFFERS_LIMIT).contains(&self.max_buffers) {
            return Err(format!("max_buffers must be between 1 and {MAX_BUFFERS_LIMIT}"));
        }
        if self.frame_queue_depth == 0 {
            return Err("frame_queue_depth must be greater than 0".to_string());
        }
        if !self.requested_format.is_valid() {
            return Err(format!("requested format {} is invalid", self.requested_format));
        }
        if !(0.0..=1.0).contains(&self.utilization_throttle) {
            return Err("utilization_throttle must be between 0.0 and 1.0".to_string());
        }
        Ok(())
    }

    /// Parses and validates a JSON configuration.
    pub fn from_json_str(json: &str) -> HubResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate().map_err(HubError::Config)?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> HubResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }
}
