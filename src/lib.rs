//! Cam-Session: a capture session engine for video devices
//!
//! This library opens one capture device at a time, negotiates its format,
//! streams frames into an application-readable buffer, exposes the device's
//! imaging properties and watches for unexpected disconnection. Backends sit
//! behind a trait, so the same session drives real V4L2 hardware or a
//! simulated device in tests.

pub mod config;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod format;
pub mod pipeline;
pub mod platform;
pub mod property;
pub mod session;
pub mod simulated;
pub mod sink;
pub mod traits;
pub mod watchdog;

pub use config::{SessionConfig, SinkConfig, TransitionConfig, WatchdogConfig};
pub use descriptor::{DeviceDescriptor, DeviceSelector};
pub use device::V4L2Device;
pub use error::{CaptureError, PropertyError, Result};
pub use format::{FormatCatalog, FormatSource, FourCC, NativeFormat, VideoFormat};
pub use pipeline::{Pipeline, Stage};
pub use platform::Platform;
pub use property::{
    PropertyBank, PropertyControl, PropertyDescriptor, PropertyKind, PropertyRange, PropertyValue,
};
pub use session::{CaptureSession, SessionState};
pub use simulated::{SimulatedDevice, SimulatedHandle, StageEvent, TestPattern};
pub use sink::{Frame, FrameMetadata, FrameSink, PayloadSize, SampleCallback, SinkState};
pub use traits::{CaptureBackend, ControlState, StageContext, StateChange};
pub use watchdog::{ConnectionWatchdog, DeviceHealth, HealthSignal};
