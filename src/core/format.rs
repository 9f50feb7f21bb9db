//! # Capture Formats and Identifiers
//!
//! Small value types shared by the pool, the adapter and the controller:
//! the capture format descriptor a source reports, the parameters a client
//! asks for, and the newtype ids that keep buffer, controller, handler and
//! session numbers from being mixed up.

use std::fmt;

use cap_convert::format::{PixelFormat, Size};
use serde::{Deserialize, Serialize};

/// Largest accepted width or height.
pub const MAX_DIMENSION: u32 = (1 << 15) - 1;
/// Largest accepted pixel count.
pub const MAX_CANVAS: usize = 1 << 25;
/// Largest accepted frame rate.
pub const MAX_FRAMES_PER_SECOND: f64 = 1000.0;

/// Where the pixels of a buffer live.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    /// Shared memory mapped into the capture process.
    #[default]
    Cpu,
    /// Backed by a resource owned by an external collaborator (e.g. a GPU
    /// texture); the pool only holds an opaque token for it.
    External,
}

/// Format of the frames a capture source produces, or that a client asks for.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaptureFormat {
    pub frame_size: Size,
    pub frame_rate: f64,
    pub pixel_format: PixelFormat,
    #[serde(default)]
    pub storage: StorageKind,
    /// Source rows are stored bottom-up. Only meaningful for RGB formats.
    #[serde(default)]
    pub flip_vertical: bool,
}

impl Default for CaptureFormat {
    fn default() -> Self {
        Self {
            frame_size: Size::new(640, 480),
            frame_rate: 30.0,
            pixel_format: PixelFormat::I420,
            storage: StorageKind::Cpu,
            flip_vertical: false,
        }
    }
}

impl CaptureFormat {
    pub fn new(frame_size: Size, frame_rate: f64, pixel_format: PixelFormat) -> Self {
        Self {
            frame_size,
            frame_rate,
            pixel_format,
            ..Self::default()
        }
    }

    /// Dimensions are non-zero and bounded, and the frame rate is positive and bounded.
    pub fn is_valid(&self) -> bool {
        let Size { width, height } = self.frame_size;
        width > 0
            && height > 0
            && width <= MAX_DIMENSION
            && height <= MAX_DIMENSION
            && self.frame_size.area() <= MAX_CANVAS
            && self.frame_rate.is_finite()
            && self.frame_rate > 0.0
            && self.frame_rate <= MAX_FRAMES_PER_SECOND
    }

    /// Bytes one raw frame of this format occupies.
    pub fn allocation_size(&self) -> usize {
        self.pixel_format.allocation_size(self.frame_size)
    }
}

impl fmt::Display for CaptureFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}@{:.2}fps ({:?})",
            self.pixel_format, self.frame_size, self.frame_rate, self.storage
        )
    }
}

/// What a client requested when it registered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureParams {
    pub requested_format: CaptureFormat,
}

impl CaptureParams {
    pub fn new(requested_format: CaptureFormat) -> Self {
        Self { requested_format }
    }
}

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub $inner);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(
    /// Pool-assigned buffer id. Ids are handed out in increasing order and
    /// never reused while the pool lives.
    BufferId(u32)
);
id_newtype!(
    /// Caller-chosen id for one registration of a consumer.
    ControllerId(u32)
);
id_newtype!(
    /// Identity of a client event handler.
    HandlerId(u64)
);
id_newtype!(
    /// Capture session a client belongs to.
    SessionId(i32)
);
id_newtype!(
    /// Process a buffer is shared into.
    TargetProcess(u32)
);

impl TargetProcess {
    /// The process the hub runs in.
    pub fn current() -> Self {
        TargetProcess(std::process::id())
    }
}
