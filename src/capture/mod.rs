//! # Capture Module
//!
//! The capture context: the adapter that fills pooled buffers, and the
//! source abstraction that feeds it.

pub mod adapter;
pub mod source;

pub use adapter::{AdapterStats, CaptureAdapter, CapturedFrame, ProducerBuffer};
pub use source::{run_capture, CaptureSource, CaptureSummary, RawFrame, SyntheticSource};
