//! Device descriptors produced by enumeration and the selectors that resolve them.

use std::ffi::OsStr;
use std::fmt;
use std::path::PathBuf;

use crate::error::{CaptureError, Result};
use crate::format::VideoFormat;

/// One capture device as reported by enumeration.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDescriptor {
    /// Name shown to users.
    pub friendly_name: String,
    /// Driver or bus description.
    pub description: String,
    /// Stable device path (e.g. `/dev/video0`).
    pub device_path: PathBuf,
    /// Formats reported at enumeration time.
    pub formats: Vec<VideoFormat>,
    /// Lowest frame rate the device legitimately produces. Slower delivery
    /// is treated as a stall.
    pub minimum_fps: Option<f64>,
}

impl DeviceDescriptor {
    /// Create a descriptor with no formats.
    #[must_use]
    pub fn new<N: Into<String>, P: Into<PathBuf>>(friendly_name: N, device_path: P) -> Self {
        Self {
            friendly_name: friendly_name.into(),
            description: String::new(),
            device_path: device_path.into(),
            formats: Vec::new(),
            minimum_fps: None,
        }
    }

    /// Set the description.
    #[must_use]
    pub fn with_description<D: Into<String>>(mut self, description: D) -> Self {
        self.description = description.into();
        self
    }

    /// Set the enumerated formats.
    #[must_use]
    pub fn with_formats(mut self, formats: Vec<VideoFormat>) -> Self {
        self.formats = formats;
        self
    }

    /// Set the minimum frame rate contract.
    #[must_use]
    pub const fn with_minimum_fps(mut self, minimum_fps: f64) -> Self {
        self.minimum_fps = Some(minimum_fps);
        self
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.friendly_name, self.device_path.display())
    }
}

/// How the caller identifies the device to open.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceSelector {
    /// Position in the enumerated list.
    Index(usize),
    /// Device path, falling back to friendly name.
    Path(String),
    /// A full descriptor; matched by its path, then its friendly name.
    Descriptor(DeviceDescriptor),
}

impl DeviceSelector {
    /// Pick the matching descriptor from `devices`.
    pub fn resolve(&self, devices: &[DeviceDescriptor]) -> Result<DeviceDescriptor> {
        let found = match self {
            Self::Index(index) => devices.get(*index),
            Self::Path(key) => find(devices, OsStr::new(key), key),
            Self::Descriptor(wanted) => {
                find(devices, wanted.device_path.as_os_str(), &wanted.friendly_name)
            }
        };
        found
            .cloned()
            .ok_or_else(|| CaptureError::DeviceNotFound(self.to_string()))
    }
}

fn find<'a>(
    devices: &'a [DeviceDescriptor],
    path: &OsStr,
    name: &str,
) -> Option<&'a DeviceDescriptor> {
    devices
        .iter()
        .find(|d| d.device_path.as_os_str() == path)
        .or_else(|| devices.iter().find(|d| d.friendly_name == name))
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(index) => write!(f, "#{index}"),
            Self::Path(path) => f.write_str(path),
            Self::Descriptor(descriptor) => write!(f, "{descriptor}"),
        }
    }
}

impl From<usize> for DeviceSelector {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

impl From<&str> for DeviceSelector {
    fn from(path: &str) -> Self {
        Self::Path(path.to_owned())
    }
}

impl From<String> for DeviceSelector {
    fn from(path: String) -> Self {
        Self::Path(path)
    }
}

impl From<DeviceDescriptor> for DeviceSelector {
    fn from(descriptor: DeviceDescriptor) -> Self {
        Self::Descriptor(descriptor)
    }
}

impl From<&DeviceDescriptor> for DeviceSelector {
    fn from(descriptor: &DeviceDescriptor) -> Self {
        Self::Descriptor(descriptor.clone())
    }
}
