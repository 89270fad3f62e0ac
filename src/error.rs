//! Error types shared by every layer of the capture session.

use crate::format::VideoFormat;
use crate::property::PropertyKind;

/// Reasons a property change is refused before the device is touched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PropertyError {
    /// The device does not expose this property at all.
    #[error("{kind} is not supported by the device")]
    Unsupported {
        /// Property that was addressed.
        kind: PropertyKind,
    },
    /// The requested value lies outside the imported range.
    #[error("{kind} value {value} is out of range [{min}, {max}]")]
    OutOfRange {
        /// Property that was addressed.
        kind: PropertyKind,
        /// Rejected value.
        value: i32,
        /// Lower bound reported by the device.
        min: i32,
        /// Upper bound reported by the device.
        max: i32,
    },
    /// The requested auto/manual mode is not available for this property.
    #[error("{kind} does not support {} mode", mode_name(.auto))]
    ModeUnsupported {
        /// Property that was addressed.
        kind: PropertyKind,
        /// Whether auto mode was requested.
        auto: bool,
    },
}

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn mode_name(auto: &bool) -> &'static str {
    if *auto {
        "auto"
    } else {
        "manual"
    }
}

/// Error type for capture session operations.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// A pipeline construction step failed.
    #[error("{step}: {reason}")]
    Setup {
        /// Human readable description of the failing step.
        step: &'static str,
        /// Platform error text.
        reason: String,
    },
    /// No device matched the selector.
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    /// `open` was called on a session that is already open.
    #[error("session is already open")]
    AlreadyOpen,
    /// The operation requires an open session.
    #[error("session is not open")]
    NotOpen,
    /// The operation requires a running capture.
    #[error("session is not capturing")]
    NotCapturing,
    /// The requested format is not offered by the device.
    #[error("format not supported: {0}")]
    FormatNotSupported(VideoFormat),
    /// A format index was outside the catalog.
    #[error("format index {index} out of range (catalog holds {len})")]
    FormatIndex {
        /// Requested index.
        index: usize,
        /// Catalog length.
        len: usize,
    },
    /// The caller supplied a buffer smaller than the current frame.
    #[error("output buffer holds {provided} bytes, frame needs {required}")]
    BufferTooSmall {
        /// Bytes needed for the current frame.
        required: usize,
        /// Bytes offered by the caller.
        provided: usize,
    },
    /// A control-surface state change did not settle in time.
    #[error("{target} transition did not complete after {attempts} polls")]
    TransitionTimeout {
        /// Target state name.
        target: &'static str,
        /// Number of polls performed.
        attempts: u32,
    },
    /// A property change was refused.
    #[error(transparent)]
    Property(#[from] PropertyError),
    /// One or more property imports failed; messages are joined.
    #[error("property import failed: {0}")]
    PropertyImport(String),
    /// The backend reported a failure outside pipeline construction.
    #[error("backend error: {0}")]
    Backend(String),
    /// The configuration could not be parsed or is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    /// Build a setup error for the given pipeline step.
    pub fn setup<E: ToString>(step: &'static str, reason: E) -> Self {
        Self::Setup {
            step,
            reason: reason.to_string(),
        }
    }

    /// Build a backend error from any displayable value.
    pub fn backend<E: ToString>(reason: E) -> Self {
        Self::Backend(reason.to_string())
    }
}

impl From<toml::de::Error> for CaptureError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result type for capture session operations.
pub type Result<T> = std::result::Result<T, CaptureError>;
