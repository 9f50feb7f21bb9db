//! # Configuration Module
//!
//! Hub configuration with defaults, validation and JSON loading.

#[allow(clippy::module_inception)]
pub mod config;

pub use config::HubConfig;
