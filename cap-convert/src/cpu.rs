// SPDX-License-Identifier: MIT
// CPU converter: any capture format in → I420 out, direct write into caller-provided planes.
// Cropping is anchored at the top-left corner; rotation is clockwise.

use crate::format::{chroma_extent, I420Layout, I420PlanesMut, I420PlanesRef, PixelFormat, Rotation, Size};

#[derive(Debug)]
pub enum ConvertError {
    UnsupportedFormat(PixelFormat),
    SourceTooSmall { expected: usize, actual: usize },
    DestinationTooSmall,
    InvalidCrop { source: Size, crop: Size },
    DimensionMismatch { expected: Size, actual: Size },
    StrideTooSmall,
    Decode(image::ImageError),
}

impl From<image::ImageError> for ConvertError {
    fn from(e: image::ImageError) -> Self {
        Self::Decode(e)
    }
}

impl std::fmt::Display for ConvertError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConvertError::UnsupportedFormat(format) => write!(f, "Unsupported pixel format: {}", format),
            ConvertError::SourceTooSmall { expected, actual } => {
                write!(f, "Source buffer too small: need {} bytes, got {}", expected, actual)
            }
            ConvertError::DestinationTooSmall => write!(f, "Destination planes too small"),
            ConvertError::InvalidCrop { source, crop } => {
                write!(f, "Crop {} does not fit an even region of source {}", crop, source)
            }
            ConvertError::DimensionMismatch { expected, actual } => {
                write!(f, "Decoded size {} does not match declared size {}", actual, expected)
            }
            ConvertError::StrideTooSmall => write!(f, "Source stride smaller than row width"),
            ConvertError::Decode(e) => write!(f, "MJPEG decode error: {}", e),
        }
    }
}

impl std::error::Error for ConvertError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConvertError::Decode(e) => Some(e),
            _ => None,
        }
    }
}

/// Parameters of one conversion.
#[derive(Clone, Copy, Debug)]
pub struct ConvertRequest {
    /// Declared size of the source image; strides derive from it.
    pub src_size: Size,
    pub format: PixelFormat,
    /// Read source rows bottom-up (RGB formats only).
    pub flip_vertical: bool,
    /// Region taken from the top-left of the source, before rotation. Must be even.
    pub crop: Size,
    pub rotation: Rotation,
}

impl ConvertRequest {
    /// Crop to the even part of `src_size`, which is what capture devices need.
    pub fn even_crop(src_size: Size, format: PixelFormat, rotation: Rotation) -> Self {
        Self {
            src_size,
            format,
            flip_vertical: false,
            crop: src_size.even(),
            rotation,
        }
    }

    /// Size of the converted image.
    pub fn output_size(&self) -> Size {
        self.rotation.apply(self.crop)
    }
}

/// Pre-allocated scratch reused across frames: decoded MJPEG pixels and the
/// unrotated intermediate planes.
#[derive(Default)]
pub struct Staging {
    rgb: Vec<u8>,
    y: Vec<u8>,
    u: Vec<u8>,
    v: Vec<u8>,
}

impl Staging {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Main conversion entry point.
///
/// `dst` must be laid out for `req.output_size()`.
pub fn convert_to_i420(
    src: &[u8],
    req: &ConvertRequest,
    dst: I420PlanesMut<'_>,
    staging: &mut Staging,
) -> Result<(), ConvertError> {
    if req.format == PixelFormat::Unknown {
        return Err(ConvertError::UnsupportedFormat(req.format));
    }
    let crop = req.crop;
    if crop.is_empty()
        || crop.width % 2 != 0
        || crop.height % 2 != 0
        || crop.width > req.src_size.width
        || crop.height > req.src_size.height
    {
        return Err(ConvertError::InvalidCrop {
            source: req.src_size,
            crop,
        });
    }
    let expected = req.format.min_source_len(req.src_size);
    if src.len() < expected {
        return Err(ConvertError::SourceTooSmall {
            expected,
            actual: src.len(),
        });
    }

    let out = I420Layout::new(req.output_size());
    let out_rows = out.size.height as usize;
    if dst.y_stride < out.y_stride
        || dst.uv_stride < out.uv_stride
        || dst.y.len() < dst.y_stride * out_rows
        || dst.u.len() < dst.uv_stride * (out_rows / 2)
        || dst.v.len() < dst.uv_stride * (out_rows / 2)
    {
        return Err(ConvertError::DestinationTooSmall);
    }

    let Staging { rgb, y, u, v } = staging;

    let bytes: &[u8] = if req.format == PixelFormat::Mjpeg {
        let decoded = image::load_from_memory_with_format(src, image::ImageFormat::Jpeg)?.to_rgb8();
        let actual = Size::new(decoded.width(), decoded.height());
        if actual != req.src_size {
            return Err(ConvertError::DimensionMismatch {
                expected: req.src_size,
                actual,
            });
        }
        rgb.clear();
        rgb.extend_from_slice(decoded.as_raw());
        rgb.as_slice()
    } else {
        src
    };

    if req.rotation == Rotation::R0 {
        return decode(bytes, req, dst);
    }

    let mid = I420Layout::new(crop);
    y.resize(mid.y_len, 0);
    u.resize(mid.uv_len, 0);
    v.resize(mid.uv_len, 0);
    decode(
        bytes,
        req,
        I420PlanesMut {
            y: y.as_mut_slice(),
            u: u.as_mut_slice(),
            v: v.as_mut_slice(),
            y_stride: mid.y_stride,
            uv_stride: mid.uv_stride,
        },
    )?;

    let (cw, ch) = (crop.width as usize, crop.height as usize);
    rotate_plane(y, mid.y_stride, cw, ch, dst.y, dst.y_stride, req.rotation);
    rotate_plane(u, mid.uv_stride, cw / 2, ch / 2, dst.u, dst.uv_stride, req.rotation);
    rotate_plane(v, mid.uv_stride, cw / 2, ch / 2, dst.v, dst.uv_stride, req.rotation);
    Ok(())
}

/// Straight planar copy of an I420 image with arbitrary source strides.
pub fn i420_copy(src: &I420PlanesRef<'_>, size: Size, dst: I420PlanesMut<'_>) -> Result<(), ConvertError> {
    let (w, h) = (size.width as usize, size.height as usize);
    let (cw, ch) = (chroma_extent(size.width), chroma_extent(size.height));
    if src.y_stride < w || src.u_stride < cw || src.v_stride < cw {
        return Err(ConvertError::StrideTooSmall);
    }
    check_plane(src.y, src.y_stride, w, h)?;
    check_plane(src.u, src.u_stride, cw, ch)?;
    check_plane(src.v, src.v_stride, cw, ch)?;
    if dst.y_stride < w
        || dst.uv_stride < cw
        || dst.y.len() < dst.y_stride * h
        || dst.u.len() < dst.uv_stride * ch
        || dst.v.len() < dst.uv_stride * ch
    {
        return Err(ConvertError::DestinationTooSmall);
    }

    copy_plane(src.y, src.y_stride, dst.y, dst.y_stride, w, h);
    copy_plane(src.u, src.u_stride, dst.u, dst.uv_stride, cw, ch);
    copy_plane(src.v, src.v_stride, dst.v, dst.uv_stride, cw, ch);
    Ok(())
}

fn check_plane(plane: &[u8], stride: usize, row_bytes: usize, rows: usize) -> Result<(), ConvertError> {
    let expected = if rows == 0 { 0 } else { stride * (rows - 1) + row_bytes };
    if plane.len() < expected {
        return Err(ConvertError::SourceTooSmall {
            expected,
            actual: plane.len(),
        });
    }
    Ok(())
}

/// Decodes the cropped, unrotated region of `src` into `dst`.
fn decode(src: &[u8], req: &ConvertRequest, dst: I420PlanesMut<'_>) -> Result<(), ConvertError> {
    let sw = req.src_size.width as usize;
    let sh = req.src_size.height as usize;
    let (w, h) = (req.crop.width as usize, req.crop.height as usize);
    let csw = chroma_extent(req.src_size.width);
    let csh = chroma_extent(req.src_size.height);
    let I420PlanesMut {
        y: dy,
        u: du,
        v: dv,
        y_stride: dys,
        uv_stride: duvs,
    } = dst;

    match req.format {
        PixelFormat::I420 | PixelFormat::Yv12 => {
            let u_off = sw * sh;
            let v_off = u_off + csw * csh;
            let (u_off, v_off) = if req.format == PixelFormat::Yv12 {
                (v_off, u_off)
            } else {
                (u_off, v_off)
            };
            copy_plane(src, sw, dy, dys, w, h);
            copy_plane(&src[u_off..], csw, du, duvs, w / 2, h / 2);
            copy_plane(&src[v_off..], csw, dv, duvs, w / 2, h / 2);
        }
        PixelFormat::Nv12 | PixelFormat::Nv21 => {
            copy_plane(src, sw, dy, dys, w, h);
            let uv = &src[sw * sh..];
            let uv_stride = csw * 2;
            let (u_idx, v_idx) = if req.format == PixelFormat::Nv12 { (0, 1) } else { (1, 0) };
            for row in 0..h / 2 {
                let line = &uv[row * uv_stride..];
                for col in 0..w / 2 {
                    du[row * duvs + col] = line[col * 2 + u_idx];
                    dv[row * duvs + col] = line[col * 2 + v_idx];
                }
            }
        }
        PixelFormat::Yuy2 | PixelFormat::Uyvy => {
            // Byte offsets of (Y0, U, Y1, V) inside each 4-byte macropixel.
            let (y0, u, y1, v) = if req.format == PixelFormat::Yuy2 {
                (0, 1, 2, 3)
            } else {
                (1, 0, 3, 2)
            };
            let stride = csw * 4;
            for row in 0..h {
                let line = &src[row * stride..];
                for pair in 0..w / 2 {
                    let px = &line[pair * 4..pair * 4 + 4];
                    dy[row * dys + pair * 2] = px[y0];
                    dy[row * dys + pair * 2 + 1] = px[y1];
                }
            }
            for row in 0..h / 2 {
                let top = &src[row * 2 * stride..];
                let bottom = &src[(row * 2 + 1) * stride..];
                for pair in 0..w / 2 {
                    let base = pair * 4;
                    du[row * duvs + pair] = avg2(top[base + u], bottom[base + u]);
                    dv[row * duvs + pair] = avg2(top[base + v], bottom[base + v]);
                }
            }
        }
        PixelFormat::Rgb24 => decode_rgb(src, sw * 3, 3, [2, 1, 0], req, dy, dys, du, dv, duvs),
        PixelFormat::Rgb32 | PixelFormat::Argb => decode_rgb(src, sw * 4, 4, [2, 1, 0], req, dy, dys, du, dv, duvs),
        // Decoded JPEG pixels are R,G,B.
        PixelFormat::Mjpeg => decode_rgb(src, sw * 3, 3, [0, 1, 2], req, dy, dys, du, dv, duvs),
        PixelFormat::Unknown => return Err(ConvertError::UnsupportedFormat(req.format)),
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn decode_rgb(
    src: &[u8],
    stride: usize,
    bpp: usize,
    rgb_offsets: [usize; 3],
    req: &ConvertRequest,
    dy: &mut [u8],
    dys: usize,
    du: &mut [u8],
    dv: &mut [u8],
    duvs: usize,
) {
    let sh = req.src_size.height as usize;
    let (w, h) = (req.crop.width as usize, req.crop.height as usize);
    let [ro, go, bo] = rgb_offsets;
    let row_of = |row: usize| if req.flip_vertical { sh - 1 - row } else { row };
    let pixel = |x: usize, row: usize| {
        let base = row_of(row) * stride + x * bpp;
        (src[base + ro] as i32, src[base + go] as i32, src[base + bo] as i32)
    };

    for row in 0..h {
        for x in 0..w {
            let (r, g, b) = pixel(x, row);
            dy[row * dys + x] = rgb_to_y(r, g, b);
        }
    }
    for row in 0..h / 2 {
        for col in 0..w / 2 {
            let (mut r, mut g, mut b) = (0, 0, 0);
            for (x, yy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                let (pr, pg, pb) = pixel(col * 2 + x, row * 2 + yy);
                r += pr;
                g += pg;
                b += pb;
            }
            let (r, g, b) = ((r + 2) >> 2, (g + 2) >> 2, (b + 2) >> 2);
            du[row * duvs + col] = rgb_to_u(r, g, b);
            dv[row * duvs + col] = rgb_to_v(r, g, b);
        }
    }
}

// BT.601 studio-swing coefficients.
#[inline]
fn rgb_to_y(r: i32, g: i32, b: i32) -> u8 {
    clamp_u8(((66 * r + 129 * g + 25 * b + 128) >> 8) + 16)
}

#[inline]
fn rgb_to_u(r: i32, g: i32, b: i32) -> u8 {
    clamp_u8(((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128)
}

#[inline]
fn rgb_to_v(r: i32, g: i32, b: i32) -> u8 {
    clamp_u8(((112 * r - 94 * g - 18 * b + 128) >> 8) + 128)
}

#[inline]
fn clamp_u8(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

#[inline]
fn avg2(a: u8, b: u8) -> u8 {
    ((a as u16 + b as u16 + 1) / 2) as u8
}

#[inline]
fn copy_plane(src: &[u8], src_stride: usize, dst: &mut [u8], dst_stride: usize, row_bytes: usize, rows: usize) {
    for r in 0..rows {
        let s = &src[r * src_stride..r * src_stride + row_bytes];
        let d = &mut dst[r * dst_stride..r * dst_stride + row_bytes];
        d.copy_from_slice(s);
    }
}

fn rotate_plane(
    src: &[u8],
    src_stride: usize,
    w: usize,
    h: usize,
    dst: &mut [u8],
    dst_stride: usize,
    rotation: Rotation,
) {
    for y in 0..h {
        for x in 0..w {
            let (dx, dy) = match rotation {
                Rotation::R0 => (x, y),
                Rotation::R90 => (h - 1 - y, x),
                Rotation::R180 => (w - 1 - x, h - 1 - y),
                Rotation::R270 => (y, w - 1 - x),
            };
            dst[dy * dst_stride + dx] = src[y * src_stride + x];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convert(src: &[u8], req: ConvertRequest) -> Result<Vec<u8>, ConvertError> {
        let layout = I420Layout::new(req.output_size());
        let mut out = vec![0u8; layout.total_len()];
        let planes = layout.split_mut(&mut out).unwrap();
        convert_to_i420(src, &req, planes, &mut Staging::new())?;
        Ok(out)
    }

    #[test]
    fn test_white_argb_is_studio_white() {
        let size = Size::new(4, 2);
        let src = vec![255u8; size.area() * 4];
        let out = convert(&src, ConvertRequest::even_crop(size, PixelFormat::Argb, Rotation::R0)).unwrap();
        assert!(out[..8].iter().all(|&y| y == 235));
        assert!(out[8..].iter().all(|&c| c == 128));
    }

    #[test]
    fn test_black_rgb24_is_studio_black() {
        let size = Size::new(2, 2);
        let src = vec![0u8; size.area() * 3];
        let out = convert(&src, ConvertRequest::even_crop(size, PixelFormat::Rgb24, Rotation::R0)).unwrap();
        assert_eq!(out, vec![16, 16, 16, 16, 128, 128]);
    }

    #[test]
    fn test_odd_source_is_cropped() {
        let size = Size::new(7, 5);
        let src = vec![0u8; size.area() * 4];
        let req = ConvertRequest::even_crop(size, PixelFormat::Argb, Rotation::R0);
        assert_eq!(req.output_size(), Size::new(6, 4));
        let out = convert(&src, req).unwrap();
        assert_eq!(out.len(), 6 * 4 + 2 * 3 * 2);
    }

    #[test]
    fn test_i420_rotation_moves_luma() {
        // 4x2 luma: 0 1 2 3 / 4 5 6 7
        let size = Size::new(4, 2);
        let mut src: Vec<u8> = (0..8).collect();
        src.extend_from_slice(&[10, 11, 20, 21]);

        let out = convert(&src, ConvertRequest::even_crop(size, PixelFormat::I420, Rotation::R90)).unwrap();
        // Rotated clockwise into 2x4: 4 0 / 5 1 / 6 2 / 7 3
        assert_eq!(&out[..8], &[4, 0, 5, 1, 6, 2, 7, 3]);
        assert_eq!(&out[8..10], &[10, 11]);
        assert_eq!(&out[10..12], &[20, 21]);

        let out = convert(&src, ConvertRequest::even_crop(size, PixelFormat::I420, Rotation::R180)).unwrap();
        assert_eq!(&out[..8], &[7, 6, 5, 4, 3, 2, 1, 0]);
        assert_eq!(&out[8..10], &[11, 10]);

        let out = convert(&src, ConvertRequest::even_crop(size, PixelFormat::I420, Rotation::R270)).unwrap();
        assert_eq!(&out[..8], &[3, 7, 2, 6, 1, 5, 0, 4]);
    }

    #[test]
    fn test_yv12_swaps_chroma() {
        let size = Size::new(2, 2);
        let src = [1, 2, 3, 4, 50, 60];
        let out = convert(&src, ConvertRequest::even_crop(size, PixelFormat::Yv12, Rotation::R0)).unwrap();
        assert_eq!(out, vec![1, 2, 3, 4, 60, 50]);
    }

    #[test]
    fn test_nv21_deinterleaves_chroma() {
        let size = Size::new(2, 2);
        let src = [1, 2, 3, 4, 90, 70];
        let out = convert(&src, ConvertRequest::even_crop(size, PixelFormat::Nv21, Rotation::R0)).unwrap();
        assert_eq!(out, vec![1, 2, 3, 4, 70, 90]);
    }

    #[test]
    fn test_yuy2_averages_chroma_rows() {
        let size = Size::new(2, 2);
        // Row 0: Y0=10 U=100 Y1=20 V=200, row 1: Y0=30 U=110 Y1=40 V=210
        let src = [10, 100, 20, 200, 30, 110, 40, 210];
        let out = convert(&src, ConvertRequest::even_crop(size, PixelFormat::Yuy2, Rotation::R0)).unwrap();
        assert_eq!(out, vec![10, 20, 30, 40, 105, 205]);

        let uyvy = [100, 10, 200, 20, 110, 30, 210, 40];
        let out = convert(&uyvy, ConvertRequest::even_crop(size, PixelFormat::Uyvy, Rotation::R0)).unwrap();
        assert_eq!(out, vec![10, 20, 30, 40, 105, 205]);
    }

    #[test]
    fn test_flip_reads_rows_bottom_up() {
        let size = Size::new(2, 2);
        // Top row white, bottom row black (B,G,R).
        let mut src = vec![255u8; 6];
        src.extend_from_slice(&[0u8; 6]);
        let mut req = ConvertRequest::even_crop(size, PixelFormat::Rgb24, Rotation::R0);
        req.flip_vertical = true;
        let out = convert(&src, req).unwrap();
        assert_eq!(&out[..4], &[16, 16, 235, 235]);
    }

    #[test]
    fn test_mjpeg_decodes() {
        let size = Size::new(16, 16);
        let img = image::RgbImage::from_pixel(16, 16, image::Rgb([128, 128, 128]));
        let mut jpeg = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut jpeg, image::ImageFormat::Jpeg)
            .unwrap();

        let out = convert(
            jpeg.get_ref(),
            ConvertRequest::even_crop(size, PixelFormat::Mjpeg, Rotation::R0),
        )
        .unwrap();
        // Mid grey lands near Y=126; allow for JPEG quantisation.
        assert!(out[..256].iter().all(|&y| (120..=132).contains(&y)));
    }

    #[test]
    fn test_mjpeg_garbage_fails() {
        let size = Size::new(4, 4);
        let err = convert(&[0u8; 64], ConvertRequest::even_crop(size, PixelFormat::Mjpeg, Rotation::R0)).unwrap_err();
        assert!(matches!(err, ConvertError::Decode(_)));
    }

    #[test]
    fn test_short_source_and_unknown_format_fail() {
        let size = Size::new(4, 4);
        let err = convert(&[0u8; 10], ConvertRequest::even_crop(size, PixelFormat::Argb, Rotation::R0)).unwrap_err();
        assert!(matches!(err, ConvertError::SourceTooSmall { expected: 64, actual: 10 }));

        let err = convert(&[0u8; 64], ConvertRequest::even_crop(size, PixelFormat::Unknown, Rotation::R0)).unwrap_err();
        assert!(matches!(err, ConvertError::UnsupportedFormat(PixelFormat::Unknown)));
    }

    #[test]
    fn test_i420_copy_honours_source_strides() {
        let size = Size::new(2, 2);
        let y = [1, 2, 0xEE, 3, 4];
        let u = [5, 0xEE];
        let v = [6];
        let src = I420PlanesRef {
            y: &y,
            u: &u,
            v: &v,
            y_stride: 3,
            u_stride: 2,
            v_stride: 1,
        };
        let layout = I420Layout::new(size);
        let mut out = vec![0u8; layout.total_len()];
        i420_copy(&src, size, layout.split_mut(&mut out).unwrap()).unwrap();
        assert_eq!(out, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_i420_copy_rejects_narrow_stride() {
        let size = Size::new(4, 2);
        let plane = [0u8; 16];
        let src = I420PlanesRef {
            y: &plane,
            u: &plane,
            v: &plane,
            y_stride: 3,
            u_stride: 2,
            v_stride: 2,
        };
        let layout = I420Layout::new(size);
        let mut out = vec![0u8; layout.total_len()];
        let err = i420_copy(&src, size, layout.split_mut(&mut out).unwrap()).unwrap_err();
        assert!(matches!(err, ConvertError::StrideTooSmall));
    }
}
