// SPDX-License-Identifier: MIT
//! # Pixel Formats and Plane Geometry
//!
//! Describes the pixel formats a capture device may hand us, the canonical
//! I420 layout every CPU buffer is normalised into, and the rotation applied
//! on the way in.
//!
//! ## I420 layout
//!
//! ```text
//! ┌──────────────────────┐
//! │ Y  (w × h)           │
//! ├──────────┬───────────┘
//! │ U (w/2 × h/2)
//! ├──────────┤
//! │ V (w/2 × h/2)
//! └──────────┘
//! ```
//!
//! Chroma planes round up for odd sizes so a planar copy of an odd-sized
//! frame still fits. Frames coming through the conversion path are always
//! cropped to even dimensions first.

/// Represents a 2D size with width and height in pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of pixels covered.
    pub fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Drops the lowest bit of each axis (2×2 chroma alignment).
    pub fn even(&self) -> Size {
        Size::new(self.width & !1, self.height & !1)
    }

    pub fn transposed(&self) -> Size {
        Size::new(self.height, self.width)
    }
}

impl std::fmt::Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Pixel formats a capture source may produce.
///
/// Byte orders follow the little-endian FOURCC convention used by capture
/// drivers: `Rgb24` is stored B,G,R and `Rgb32`/`Argb` are stored B,G,R,A.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PixelFormat {
    /// Colour format not set.
    #[default]
    Unknown,
    I420,
    Yv12,
    Nv12,
    Nv21,
    Yuy2,
    Uyvy,
    Rgb24,
    Rgb32,
    Argb,
    Mjpeg,
}

impl PixelFormat {
    /// Every format, in declaration order.
    pub const ALL: [PixelFormat; 11] = [
        PixelFormat::Unknown,
        PixelFormat::I420,
        PixelFormat::Yv12,
        PixelFormat::Nv12,
        PixelFormat::Nv21,
        PixelFormat::Yuy2,
        PixelFormat::Uyvy,
        PixelFormat::Rgb24,
        PixelFormat::Rgb32,
        PixelFormat::Argb,
        PixelFormat::Mjpeg,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PixelFormat::Unknown => "UNKNOWN",
            PixelFormat::I420 => "I420",
            PixelFormat::Yv12 => "YV12",
            PixelFormat::Nv12 => "NV12",
            PixelFormat::Nv21 => "NV21",
            PixelFormat::Yuy2 => "YUY2",
            PixelFormat::Uyvy => "UYVY",
            PixelFormat::Rgb24 => "RGB24",
            PixelFormat::Rgb32 => "RGB32",
            PixelFormat::Argb => "ARGB",
            PixelFormat::Mjpeg => "MJPEG",
        }
    }

    /// YUV formats with subsampled chroma can only be consumed at even sizes.
    pub fn requires_even_dimensions(&self) -> bool {
        matches!(
            self,
            PixelFormat::I420
                | PixelFormat::Yv12
                | PixelFormat::Nv12
                | PixelFormat::Nv21
                | PixelFormat::Yuy2
                | PixelFormat::Uyvy
        )
    }

    /// Bytes needed to hold one uncompressed image of `size` in this format.
    ///
    /// MJPEG is variable-length; the value returned is an upper bound used
    /// for buffer sizing, not a minimum input length.
    pub fn allocation_size(&self, size: Size) -> usize {
        let area = size.area();
        match self {
            PixelFormat::Unknown => 0,
            PixelFormat::I420 | PixelFormat::Yv12 | PixelFormat::Nv12 | PixelFormat::Nv21 => {
                I420Layout::new(size).total_len()
            }
            PixelFormat::Yuy2 | PixelFormat::Uyvy => chroma_extent(size.width) * 4 * size.height as usize,
            PixelFormat::Rgb24 => area * 3,
            PixelFormat::Rgb32 | PixelFormat::Argb | PixelFormat::Mjpeg => area * 4,
        }
    }

    /// Smallest source length accepted by the converter.
    pub fn min_source_len(&self, size: Size) -> usize {
        match self {
            PixelFormat::Mjpeg => 1,
            other => other.allocation_size(size),
        }
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Clockwise rotation applied while normalising a frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Rotation {
    #[default]
    R0,
    R90,
    R180,
    R270,
}

impl Rotation {
    /// Only exact multiples of 90 in `0..360` are accepted.
    pub fn from_degrees(degrees: i32) -> Option<Self> {
        match degrees {
            0 => Some(Rotation::R0),
            90 => Some(Rotation::R90),
            180 => Some(Rotation::R180),
            270 => Some(Rotation::R270),
            _ => None,
        }
    }

    pub fn degrees(&self) -> i32 {
        match self {
            Rotation::R0 => 0,
            Rotation::R90 => 90,
            Rotation::R180 => 180,
            Rotation::R270 => 270,
        }
    }

    pub fn swaps_dimensions(&self) -> bool {
        matches!(self, Rotation::R90 | Rotation::R270)
    }

    /// Output size of a `size` image after rotation.
    pub fn apply(&self, size: Size) -> Size {
        if self.swaps_dimensions() {
            size.transposed()
        } else {
            size
        }
    }
}

/// Plane geometry of a tightly packed I420 image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct I420Layout {
    pub size: Size,
    pub y_stride: usize,
    pub uv_stride: usize,
    pub y_len: usize,
    pub uv_len: usize,
}

impl I420Layout {
    pub fn new(size: Size) -> Self {
        let y_stride = size.width as usize;
        let uv_stride = chroma_extent(size.width);
        Self {
            size,
            y_stride,
            uv_stride,
            y_len: y_stride * size.height as usize,
            uv_len: uv_stride * chroma_extent(size.height),
        }
    }

    pub fn total_len(&self) -> usize {
        self.y_len + 2 * self.uv_len
    }

    /// Splits `buf` into Y, U and V planes. `None` if `buf` is too small.
    pub fn split_mut<'a>(&self, buf: &'a mut [u8]) -> Option<I420PlanesMut<'a>> {
        if buf.len() < self.total_len() {
            return None;
        }
        let (y, rest) = buf.split_at_mut(self.y_len);
        let (u, rest) = rest.split_at_mut(self.uv_len);
        let v = &mut rest[..self.uv_len];
        Some(I420PlanesMut {
            y,
            u,
            v,
            y_stride: self.y_stride,
            uv_stride: self.uv_stride,
        })
    }

    /// Read-only counterpart of [`I420Layout::split_mut`].
    pub fn split<'a>(&self, buf: &'a [u8]) -> Option<I420PlanesRef<'a>> {
        if buf.len() < self.total_len() {
            return None;
        }
        let (y, rest) = buf.split_at(self.y_len);
        let (u, rest) = rest.split_at(self.uv_len);
        Some(I420PlanesRef {
            y,
            u,
            v: &rest[..self.uv_len],
            y_stride: self.y_stride,
            u_stride: self.uv_stride,
            v_stride: self.uv_stride,
        })
    }
}

/// Mutable destination planes.
pub struct I420PlanesMut<'a> {
    pub y: &'a mut [u8],
    pub u: &'a mut [u8],
    pub v: &'a mut [u8],
    pub y_stride: usize,
    pub uv_stride: usize,
}

/// Borrowed source planes, each with its own stride.
#[derive(Clone, Copy)]
pub struct I420PlanesRef<'a> {
    pub y: &'a [u8],
    pub u: &'a [u8],
    pub v: &'a [u8],
    pub y_stride: usize,
    pub u_stride: usize,
    pub v_stride: usize,
}

/// Number of chroma samples covering `extent` luma samples.
#[inline]
pub fn chroma_extent(extent: u32) -> usize {
    (extent as usize + 1) / 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_even_truncation() {
        assert_eq!(Size::new(7, 5).even(), Size::new(6, 4));
        assert_eq!(Size::new(6, 4).even(), Size::new(6, 4));
    }

    #[test]
    fn test_rotation_parsing() {
        assert_eq!(Rotation::from_degrees(270), Some(Rotation::R270));
        assert_eq!(Rotation::from_degrees(45), None);
        assert_eq!(Rotation::from_degrees(360), None);
        assert_eq!(Rotation::R90.apply(Size::new(6, 4)), Size::new(4, 6));
        assert_eq!(Rotation::R180.apply(Size::new(6, 4)), Size::new(6, 4));
    }

    #[test]
    fn test_allocation_sizes() {
        let size = Size::new(10, 10);
        assert_eq!(PixelFormat::I420.allocation_size(size), 150);
        assert_eq!(PixelFormat::Nv21.allocation_size(size), 150);
        assert_eq!(PixelFormat::Yuy2.allocation_size(size), 200);
        assert_eq!(PixelFormat::Rgb24.allocation_size(size), 300);
        assert_eq!(PixelFormat::Argb.allocation_size(size), 400);
        assert_eq!(PixelFormat::Unknown.allocation_size(size), 0);
        assert_eq!(PixelFormat::Mjpeg.min_source_len(size), 1);
    }

    #[test]
    fn test_odd_i420_layout_rounds_chroma_up() {
        let layout = I420Layout::new(Size::new(5, 3));
        assert_eq!(layout.y_len, 15);
        assert_eq!(layout.uv_stride, 3);
        assert_eq!(layout.uv_len, 6);
        assert_eq!(layout.total_len(), 27);

        let mut buf = vec![0u8; 26];
        assert!(layout.split_mut(&mut buf).is_none());
    }
}
