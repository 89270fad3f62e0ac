//! Integration tests using vivid virtual camera.
//!
//! These tests require:
//! - The `integration` feature flag: `cargo test --features integration`
//! - The vivid kernel module loaded (`modprobe vivid n_devs=2`)
//! - Access to /dev/video* devices (may require sudo or video group membership)
//!
//! Expected vivid configuration:
//! - Device 1: Gray Ramp pattern (gradient) - `test_pattern=20`
//! - Device 2: 100% Colorbar pattern - `test_pattern=1`
//! - Format: 640x480 YUYV
//!
//! Tests will fail if vivid is not available or not configured correctly.

#![cfg(feature = "integration")]

use cam_session::{
    CaptureSession, FourCC, Frame, Platform, PropertyKind, SessionConfig, V4L2Device, VideoFormat,
};
use serial_test::serial;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// Find all available vivid virtual camera devices.
///
/// Uses sysfs to check device driver name before opening, avoiding
/// unnecessary device opens on real cameras.
fn find_vivid_devices() -> Vec<PathBuf> {
    let video4linux = Path::new("/sys/class/video4linux");
    if !video4linux.exists() {
        return Vec::new();
    }

    let mut devices = Vec::new();
    for index in 0..10 {
        let name_path = video4linux.join(format!("video{index}")).join("name");
        let Ok(name) = fs::read_to_string(&name_path) else {
            continue;
        };

        if !name.to_lowercase().contains("vivid") {
            continue;
        }

        let path = PathBuf::from(format!("/dev/video{index}"));
        if v4l::Device::with_path(&path).is_ok() {
            devices.push(path);
        }
    }
    devices
}

/// Macro to fail test if vivid is not available.
///
/// Integration tests MUST have vivid loaded - they should fail, not silently skip.
macro_rules! require_vivid {
    () => {
        match find_vivid_devices().first().cloned() {
            Some(path) => path,
            None => {
                panic!(
                    "vivid virtual camera not available.\n\
                     Load vivid with: sudo modprobe vivid n_devs=2\n\
                     Or run unit tests only: cargo test --lib"
                );
            }
        }
    };
}

/// Macro to get both vivid devices (for pattern-specific tests).
///
/// Returns a tuple of (gradient device path, colorbar device path).
macro_rules! require_vivid_pair {
    () => {{
        let devices = find_vivid_devices();
        if devices.len() < 2 {
            panic!(
                "Two vivid devices required but found {}.\n\
                 Load vivid with: sudo modprobe vivid n_devs=2\n\
                 Or run unit tests only: cargo test --lib",
                devices.len()
            );
        }
        (devices[0].clone(), devices[1].clone())
    }};
}

fn vga() -> VideoFormat {
    VideoFormat::new(640, 480, FourCC::YUYV)
}

fn open_session(path: &Path, format: Option<&VideoFormat>) -> CaptureSession {
    let platform = Platform::initialize();
    let session = CaptureSession::new(
        &platform,
        Box::new(V4L2Device::new()),
        SessionConfig::default(),
    )
    .expect("Failed to create session");
    session
        .open(path.to_string_lossy().as_ref(), format)
        .expect("Failed to open vivid device");
    session
}

/// Start capture and wait for the first accepted frame.
fn capture_frame(session: &CaptureSession) -> Frame {
    session.start().expect("Failed to start capture");
    for _ in 0..50 {
        let frame = session.grab_frame().expect("Failed to grab frame");
        if frame.metadata.index > 0 {
            return frame;
        }
        thread::sleep(Duration::from_millis(100));
    }
    panic!("no frame delivered within 5 seconds");
}

/// Luma of the pixel at (x, y) in a packed YUYV frame.
fn luma_at(frame: &Frame, format: &VideoFormat, x: u32, y: u32) -> u8 {
    let offset = (y * format.stride() + x * 2) as usize;
    frame.data[offset]
}

#[test]
#[serial]
fn test_vivid_device_open() {
    let path = require_vivid!();
    let session = open_session(&path, None);

    let device = session.device().expect("device descriptor");
    println!("Opened vivid device:");
    println!("  Name: {}", device.friendly_name);
    println!("  Description: {}", device.description);
    println!("  Formats: {}", session.formats().len());

    assert!(
        device.description.contains("vivid"),
        "Expected vivid driver"
    );
    assert!(!session.formats().is_empty(), "vivid should report formats");
}

#[test]
#[serial]
fn test_vivid_format_query() {
    let path = require_vivid!();
    let session = open_session(&path, None);
    let format = session.current_format().expect("Failed to query format");

    println!("Current format: {format}");

    assert!(format.width > 0, "Width should be positive");
    assert!(format.height > 0, "Height should be positive");
}

#[test]
#[serial]
fn test_vivid_set_format() {
    let path = require_vivid!();
    let session = open_session(&path, Some(&vga()));

    let actual = session.current_format().expect("format");
    assert_eq!(actual.width, 640, "Width mismatch");
    assert_eq!(actual.height, 480, "Height mismatch");
    assert_eq!(session.frame_type(), Some(FourCC::YUYV));
}

#[test]
#[serial]
fn test_vivid_capture_single_frame() {
    let path = require_vivid!();
    let session = open_session(&path, Some(&vga()));
    let frame = capture_frame(&session);

    println!("Captured frame:");
    println!("  Index: {}", frame.metadata.index);
    println!("  Bytes used: {}", frame.metadata.bytes_used);

    let expected_size = 640 * 480 * 2;
    assert_eq!(frame.data.len(), expected_size, "Frame size mismatch");
    session.stop().expect("Failed to stop capture");
}

#[test]
#[serial]
fn test_vivid_capture_multiple_frames() {
    let path = require_vivid!();
    let session = open_session(&path, Some(&vga()));
    let first = capture_frame(&session);

    thread::sleep(Duration::from_millis(500));
    let later = session.grab_frame().expect("Failed to grab frame");

    println!(
        "Frame index {} -> {}, fps {:.1}",
        first.metadata.index,
        later.metadata.index,
        session.fps()
    );
    assert!(later.metadata.index > first.metadata.index, "frame index did not advance");
    assert!(session.fps() > 0.0, "vivid should report a frame rate");
}

#[test]
#[serial]
fn test_vivid_gradient_pattern() {
    let (gradient_device, _) = require_vivid_pair!();
    let format = vga();
    let session = open_session(&gradient_device, Some(&format));
    let frame = capture_frame(&session);

    // First vivid device should be configured with Gray Ramp (test_pattern=20)
    let left = luma_at(&frame, &format, 8, 240);
    let right = luma_at(&frame, &format, 630, 240);
    assert!(
        right > left.saturating_add(100),
        "Gradient validation failed on first vivid device: left={left} right={right}"
    );
}

#[test]
#[serial]
fn test_vivid_colorbar_pattern() {
    let (_, colorbar_device) = require_vivid_pair!();
    let format = vga();
    let session = open_session(&colorbar_device, Some(&format));
    let frame = capture_frame(&session);

    // Second vivid device should be configured with 100% Colorbar (test_pattern=1).
    // Bar luma falls from white to black.
    let bar_width = format.width / 8;
    let lumas: Vec<u8> = (0..8)
        .map(|bar| luma_at(&frame, &format, bar * bar_width + bar_width / 2, 240))
        .collect();
    println!("Bar luma: {lumas:?}");
    assert!(
        lumas.windows(2).all(|pair| pair[0] >= pair[1]),
        "Color bars validation failed on second vivid device: {lumas:?}"
    );
}

#[test]
#[serial]
fn test_vivid_properties() {
    let path = require_vivid!();
    let session = open_session(&path, None);

    for descriptor in session.properties().iter().filter(|d| d.is_supported()) {
        println!("  {descriptor}");
    }

    let brightness = session.property(PropertyKind::Brightness);
    assert!(brightness.is_supported(), "vivid exposes brightness");

    let target = brightness.min() + (brightness.max() - brightness.min()) / 4;
    session
        .set_property(PropertyKind::Brightness, target, false)
        .expect("Failed to set brightness");
    session.refresh_properties().expect("Failed to refresh");
    assert_eq!(session.property(PropertyKind::Brightness).value(), target);

    session.reset_properties(false).expect("Failed to reset");
}
