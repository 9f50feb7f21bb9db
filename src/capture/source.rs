//! # Capture Sources
//!
//! Abstract interface for anything that produces raw frames, a synthetic
//! test-pattern source, and the loop that drives a source into a
//! [`CaptureAdapter`] on the capture context.

use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use cap_convert::format::PixelFormat;
use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::capture::adapter::CaptureAdapter;
use crate::core::format::CaptureFormat;

/// One raw image as produced by a capture source.
#[derive(Clone, Debug)]
pub struct RawFrame {
    pub data: Vec<u8>,
    pub format: CaptureFormat,
    /// Clockwise rotation in degrees.
    pub rotation: i32,
    pub timestamp: Duration,
}

/// Abstract interface for frame capture sources.
/// Enables pluggable capture backends for devices, screens and test patterns.
#[async_trait]
pub trait CaptureSource: Send {
    /// Prepares the source. Failure is fatal to the capture session.
    async fn initialize(&mut self) -> Result<()>;

    /// Captures the next frame. `Ok(None)` means the source has ended normally.
    async fn capture_frame(&mut self) -> Result<Option<RawFrame>>;

    /// Format the source produces.
    fn format(&self) -> CaptureFormat;

    /// Releases the source.
    async fn shutdown(&mut self) -> Result<()>;
}

/// Generates moving ARGB gradients.
pub struct SyntheticSource {
    format: CaptureFormat,
    rotation: i32,
    frame_limit: Option<u64>,
    paced: bool,
    ticker: Option<Interval>,
    frame_index: u64,
}

impl SyntheticSource {
    /// `format.pixel_format` is forced to ARGB.
    pub fn new(format: CaptureFormat, rotation: i32) -> Self {
        Self {
            format: CaptureFormat {
                pixel_format: PixelFormat::Argb,
                ..format
            },
            rotation,
            frame_limit: None,
            paced: true,
            ticker: None,
            frame_index: 0,
        }
    }

    /// Ends the stream after `frames` frames.
    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.frame_limit = Some(frames);
        self
    }

    /// Produce frames as fast as they are pulled instead of at the frame rate.
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }

    pub fn frames_produced(&self) -> u64 {
        self.frame_index
    }

    fn render(&self) -> Vec<u8> {
        let size = self.format.frame_size;
        let shift = self.frame_index as usize;
        let mut data = vec![0u8; self.format.allocation_size()];
        for (i, pixel) in data.chunks_exact_mut(4).enumerate() {
            let x = i % size.width as usize;
            let y = i / size.width as usize;
            pixel[0] = (x + shift) as u8;
            pixel[1] = (y + shift) as u8;
            pixel[2] = (x + y) as u8;
            pixel[3] = 255;
        }
        data
    }
}

#[async_trait]
impl CaptureSource for SyntheticSource {
    async fn initialize(&mut self) -> Result<()> {
        if !self.format.is_valid() {
            return Err(anyhow!("invalid synthetic format {}", self.format));
        }
        if self.paced {
            let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / self.format.frame_rate));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            self.ticker = Some(ticker);
        }
        Ok(())
    }

    async fn capture_frame(&mut self) -> Result<Option<RawFrame>> {
        if self.frame_limit.is_some_and(|limit| self.frame_index >= limit) {
            return Ok(None);
        }
        if let Some(ticker) = self.ticker.as_mut() {
            ticker.tick().await;
        }
        let frame = RawFrame {
            data: self.render(),
            format: self.format,
            rotation: self.rotation,
            timestamp: Duration::from_secs_f64(self.frame_index as f64 / self.format.frame_rate),
        };
        self.frame_index += 1;
        Ok(Some(frame))
    }

    fn format(&self) -> CaptureFormat {
        self.format
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.ticker = None;
        Ok(())
    }
}

/// Outcome of [`run_capture`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CaptureSummary {
    /// Frames pulled from the source and passed to the adapter.
    pub frames_captured: u64,
    /// Frames skipped because the pool was above the throttle threshold.
    pub frames_throttled: u64,
    /// The source failed and the error was reported.
    pub failed: bool,
}

/// Pulls frames from `source` into `adapter` until the source ends, fails,
/// or `stop` becomes `true` (or its sender is dropped).
///
/// A source failure is reported through [`CaptureAdapter::report_error`],
/// which latches the distribution controller into its error state.
pub async fn run_capture<S>(source: &mut S, adapter: &mut CaptureAdapter, mut stop: watch::Receiver<bool>) -> CaptureSummary
where
    S: CaptureSource + ?Sized,
{
    let mut summary = CaptureSummary::default();
    if let Err(e) = source.initialize().await {
        adapter.report_error(&format!("failed to initialize capture source: {e:#}"));
        summary.failed = true;
        return summary;
    }
    adapter.log(format!("Capturing {}", source.format()));

    loop {
        if *stop.borrow() {
            break;
        }
        let next = tokio::select! {
            biased;
            _ = stop.changed() => break,
            next = source.capture_frame() => next,
        };
        match next {
            Ok(Some(raw)) => {
                if adapter.should_throttle() {
                    summary.frames_throttled += 1;
                    debug!(utilization = adapter.buffer_pool_utilization(), "throttling capture");
                    continue;
                }
                adapter.on_incoming_captured_data(&raw.data, &raw.format, raw.rotation, raw.timestamp);
                summary.frames_captured += 1;
            }
            Ok(None) => break,
            Err(e) => {
                adapter.report_error(&format!("{e:#}"));
                summary.failed = true;
                break;
            }
        }
    }

    if let Err(e) = source.shutdown().await {
        warn!("capture source shutdown failed: {e:#}");
    }
    summary
}
