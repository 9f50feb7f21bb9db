// SPDX-License-Identifier: MIT
//! # cap-convert: Capture Format Normalisation
//!
//! Turns whatever a capture device produced into the canonical I420 layout
//! used by the capture-fanout buffer pool.
//!
//! ## Key Components
//!
//! - [`format`]: pixel formats, I420 plane geometry, rotation and allocation sizes
//! - [`cpu`]: software conversion with crop, vertical flip and 90° rotation steps
//!
//! ## Performance Characteristics
//!
//! - **Direct write**: unrotated frames are decoded straight into the destination planes
//! - **Reused scratch**: rotation and MJPEG decode go through a caller-owned [`cpu::Staging`]
//! - **Stride-aware**: planar input can carry padded rows
//!
//! ## Usage Example
//!
//! ```rust
//! use cap_convert::cpu::{convert_to_i420, ConvertRequest, Staging};
//! use cap_convert::format::{I420Layout, PixelFormat, Rotation, Size};
//!
//! let src_size = Size::new(7, 4);
//! let argb = vec![255u8; PixelFormat::Argb.allocation_size(src_size)];
//! let req = ConvertRequest::even_crop(src_size, PixelFormat::Argb, Rotation::R90);
//!
//! let layout = I420Layout::new(req.output_size());
//! assert_eq!(layout.size, Size::new(4, 6));
//!
//! let mut out = vec![0u8; layout.total_len()];
//! let planes = layout.split_mut(&mut out).unwrap();
//! convert_to_i420(&argb, &req, planes, &mut Staging::new()).unwrap();
//! ```

pub mod cpu;
pub mod format;

pub use cpu::{convert_to_i420, i420_copy, ConvertError, ConvertRequest, Staging};
pub use format::{I420Layout, I420PlanesMut, I420PlanesRef, PixelFormat, Rotation, Size};
