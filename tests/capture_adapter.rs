//! Integration tests for the capture adapter: every input path ends up as a
//! canonical I420 frame a client can read through its mapped handle.

mod common;

use std::sync::Arc;
use std::time::Duration;

use cap_convert::format::{I420Layout, I420PlanesRef, PixelFormat, Size};
use capture_fanout::capture::{CaptureAdapter, CapturedFrame};
use capture_fanout::controller::ClientEvent;
use capture_fanout::core::{BufferId, BufferPool, CaptureFormat};
use common::{Harness, drain, test_frames};
use tokio::sync::mpsc;

/// Maps the buffer announced to the client and returns its I420 planes as
/// one vector, together with the delivered frame size.
fn delivered_i420(events: &[ClientEvent]) -> (Size, Vec<u8>) {
    let handle = events
        .iter()
        .find_map(|e| match e {
            ClientEvent::BufferCreated { handle, .. } => Some(handle),
            _ => None,
        })
        .expect("no buffer handshake");
    let frame = events
        .iter()
        .find_map(|e| match e {
            ClientEvent::BufferReady { frame, .. } => Some(Arc::clone(frame)),
            _ => None,
        })
        .expect("no frame delivered");
    let layout = frame.i420_layout().unwrap();
    let map = handle.map().unwrap();
    (frame.coded_size(), map[..layout.total_len()].to_vec())
}

#[test]
fn test_argb_rotated_to_i420() {
    let mut hub = Harness::new(2);
    let mut client = hub.add_client(1, 1);
    let size = Size::new(8, 6);

    hub.adapter.on_incoming_captured_data(
        &test_frames::solid_argb(size, 255, 255, 255),
        &test_frames::argb_format(size),
        90,
        Duration::ZERO,
    );
    hub.pump();

    let (coded, data) = delivered_i420(&drain(&mut client));
    assert_eq!(coded, Size::new(6, 8));
    let layout = I420Layout::new(coded);
    assert!(data[..layout.y_len].iter().all(|&y| y == 235));
    assert!(data[layout.y_len..].iter().all(|&c| c == 128));
}

#[test]
fn test_odd_size_is_cropped_even() {
    let mut hub = Harness::new(2);
    let mut client = hub.add_client(1, 1);
    let size = Size::new(7, 5);

    hub.adapter.on_incoming_captured_data(
        &test_frames::solid_argb(size, 0, 0, 0),
        &test_frames::argb_format(size),
        270,
        Duration::ZERO,
    );
    hub.pump();

    let (coded, data) = delivered_i420(&drain(&mut client));
    assert_eq!(coded, Size::new(4, 6));
    assert!(data[..24].iter().all(|&y| y == 16));
}

#[test]
fn test_yuy2_through_adapter() {
    let mut hub = Harness::new(2);
    let mut client = hub.add_client(1, 1);
    let size = Size::new(4, 2);
    // Y0 U Y1 V per pixel pair.
    let src: Vec<u8> = [50, 100, 60, 200].repeat(4);

    hub.adapter.on_incoming_captured_data(
        &src,
        &CaptureFormat::new(size, 15.0, PixelFormat::Yuy2),
        0,
        Duration::ZERO,
    );
    hub.pump();

    let (_, data) = delivered_i420(&drain(&mut client));
    assert_eq!(&data[..8], &[50, 60, 50, 60, 50, 60, 50, 60]);
    assert_eq!(&data[8..10], &[100, 100]);
    assert_eq!(&data[10..12], &[200, 200]);
}

#[test]
fn test_mjpeg_through_adapter() {
    let mut hub = Harness::new(2);
    let mut client = hub.add_client(1, 1);
    let img = image::RgbImage::from_pixel(16, 8, image::Rgb([128, 128, 128]));
    let mut jpeg = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut jpeg, image::ImageFormat::Jpeg)
        .unwrap();

    hub.adapter.on_incoming_captured_data(
        jpeg.get_ref(),
        &CaptureFormat::new(Size::new(16, 8), 30.0, PixelFormat::Mjpeg),
        0,
        Duration::ZERO,
    );
    hub.pump();

    let (coded, data) = delivered_i420(&drain(&mut client));
    assert_eq!(coded, Size::new(16, 8));
    assert!(data[..128].iter().all(|&y| (120..=132).contains(&y)));
}

#[test]
fn test_planar_input_with_padded_strides() {
    let mut hub = Harness::new(2);
    let mut client = hub.add_client(1, 1);
    let size = Size::new(4, 2);
    let y: Vec<u8> = vec![1, 2, 3, 4, 0, 0, 5, 6, 7, 8, 0, 0];
    let u = [40, 41, 0, 0];
    let v = [90, 91, 0];

    let planes = I420PlanesRef {
        y: &y,
        u: &u,
        v: &v,
        y_stride: 6,
        u_stride: 4,
        v_stride: 3,
    };
    hub.adapter
        .on_incoming_captured_yuv_data(&planes, &test_frames::i420_format(size), Duration::from_millis(5));
    hub.pump();

    let (coded, data) = delivered_i420(&drain(&mut client));
    assert_eq!(coded, size);
    assert_eq!(data, vec![1, 2, 3, 4, 5, 6, 7, 8, 40, 41, 90, 91]);
}

#[test]
fn test_planar_input_must_be_i420() {
    let mut hub = Harness::new(2);
    let mut client = hub.add_client(1, 1);
    let y = [0u8; 8];
    let planes = I420PlanesRef {
        y: &y,
        u: &y[..2],
        v: &y[..2],
        y_stride: 4,
        u_stride: 2,
        v_stride: 2,
    };
    hub.adapter.on_incoming_captured_yuv_data(
        &planes,
        &CaptureFormat::new(Size::new(4, 2), 30.0, PixelFormat::Nv12),
        Duration::ZERO,
    );
    hub.pump();

    assert!(drain(&mut client).is_empty());
    assert_eq!(hub.adapter.stats().frames_dropped, 1);
}

#[test]
fn test_bad_frames_are_dropped_without_leaking_buffers() {
    let mut hub = Harness::new(2);
    let mut client = hub.add_client(1, 1);
    let size = Size::new(8, 8);
    let good = test_frames::solid_argb(size, 10, 20, 30);

    // Rotation that is not a quarter turn.
    hub.adapter
        .on_incoming_captured_data(&good, &test_frames::argb_format(size), 45, Duration::ZERO);
    // Zero frame rate.
    hub.adapter.on_incoming_captured_data(
        &good,
        &CaptureFormat::new(size, 0.0, PixelFormat::Argb),
        0,
        Duration::ZERO,
    );
    // Truncated source.
    hub.adapter
        .on_incoming_captured_data(&good[..100], &test_frames::argb_format(size), 0, Duration::ZERO);
    // Unknown pixel format.
    hub.adapter.on_incoming_captured_data(
        &good,
        &CaptureFormat::new(size, 30.0, PixelFormat::Unknown),
        0,
        Duration::ZERO,
    );
    hub.pump();

    assert!(drain(&mut client).is_empty());
    assert_eq!(hub.adapter.stats().frames_dropped, 4);
    assert_eq!(hub.adapter.stats().frames_delivered, 0);
    assert_eq!(hub.pool.utilization(), 0.0);
    assert_eq!(hub.controller.state(), capture_fanout::controller::ControllerState::Started);
}

#[test]
fn test_throttle_threshold() {
    let pool = Arc::new(BufferPool::with_shared_memory(4));
    let (frame_tx, mut frame_rx) = mpsc::channel::<CapturedFrame>(4);
    let (event_tx, _event_rx) = mpsc::unbounded_channel();
    let mut adapter = CaptureAdapter::new(Arc::clone(&pool), frame_tx, event_tx, 0.5);
    let size = Size::new(4, 4);
    let data = test_frames::solid_i420(size, 30);

    // Frames stay queued, so each one keeps its buffer held.
    for _ in 0..3 {
        adapter.on_incoming_captured_data(&data, &test_frames::i420_format(size), 0, Duration::ZERO);
    }
    assert_eq!(adapter.buffer_pool_utilization(), 0.75);
    assert!(adapter.should_throttle());

    let CapturedFrame { buffer, .. } = frame_rx.try_recv().unwrap();
    assert_eq!(buffer.id(), BufferId(1));
    drop(buffer);
    assert_eq!(adapter.buffer_pool_utilization(), 0.5);
    assert!(!adapter.should_throttle());
}
