//! Hardware-controlled imaging properties.
//!
//! A [`PropertyDescriptor`] mirrors one device control: its static range,
//! the live value and the auto/manual mode. Changes are validated against the
//! imported range before the device is touched, so a refused change never
//! leaves the mirror half updated.

use std::fmt;

use tracing::{debug, warn};

use crate::error::{CaptureError, PropertyError, Result};

/// Identifies one imaging property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PropertyKind {
    /// Image brightness.
    Brightness,
    /// Image contrast.
    Contrast,
    /// Hue shift.
    Hue,
    /// Color saturation.
    Saturation,
    /// Edge sharpening.
    Sharpness,
    /// Gamma correction.
    Gamma,
    /// Color versus monochrome output.
    ColorEnable,
    /// White balance temperature.
    WhiteBalance,
    /// Backlight compensation.
    BacklightCompensation,
    /// Sensor gain.
    Gain,
    /// Horizontal pan.
    Pan,
    /// Vertical tilt.
    Tilt,
    /// Rotation around the optical axis.
    Roll,
    /// Optical or digital zoom.
    Zoom,
    /// Exposure time.
    Exposure,
    /// Aperture.
    Iris,
    /// Focus distance.
    Focus,
}

impl PropertyKind {
    /// Every property, in bank order.
    pub const ALL: [Self; 17] = [
        Self::Brightness,
        Self::Contrast,
        Self::Hue,
        Self::Saturation,
        Self::Sharpness,
        Self::Gamma,
        Self::ColorEnable,
        Self::WhiteBalance,
        Self::BacklightCompensation,
        Self::Gain,
        Self::Pan,
        Self::Tilt,
        Self::Roll,
        Self::Zoom,
        Self::Exposure,
        Self::Iris,
        Self::Focus,
    ];

    /// Display name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Brightness => "Brightness",
            Self::Contrast => "Contrast",
            Self::Hue => "Hue",
            Self::Saturation => "Saturation",
            Self::Sharpness => "Sharpness",
            Self::Gamma => "Gamma",
            Self::ColorEnable => "ColorEnable",
            Self::WhiteBalance => "WhiteBalance",
            Self::BacklightCompensation => "BacklightCompensation",
            Self::Gain => "Gain",
            Self::Pan => "Pan",
            Self::Tilt => "Tilt",
            Self::Roll => "Roll",
            Self::Zoom => "Zoom",
            Self::Exposure => "Exposure",
            Self::Iris => "Iris",
            Self::Focus => "Focus",
        }
    }

    /// Case-insensitive lookup by display name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Static bounds reported by the device for one property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyRange {
    /// Lowest accepted value.
    pub min: i32,
    /// Highest accepted value.
    pub max: i32,
    /// Granularity.
    pub step: i32,
    /// Factory default.
    pub default: i32,
    /// Whether the device can drive the value itself.
    pub supports_auto: bool,
    /// Whether an explicit value can be set.
    pub supports_manual: bool,
}

/// Live value of a property as read from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyValue {
    /// Current value.
    pub value: i32,
    /// Whether the device currently drives the value.
    pub auto: bool,
}

/// Device-side access to imaging properties, implemented by capture backends.
pub trait PropertyControl {
    /// Static range of `kind`, or `None` when the device does not expose it.
    fn property_range(&self, kind: PropertyKind) -> Result<Option<PropertyRange>>;

    /// Current value and mode of `kind`.
    fn property_value(&self, kind: PropertyKind) -> Result<PropertyValue>;

    /// Write `value` and mode to the device.
    fn write_property(&mut self, kind: PropertyKind, value: i32, auto: bool) -> Result<()>;
}

/// Mirror of one hardware-controlled value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyDescriptor {
    kind: PropertyKind,
    supported: bool,
    min: i32,
    max: i32,
    step: i32,
    default: i32,
    value: i32,
    auto: bool,
    supports_auto: bool,
    supports_manual: bool,
}

impl PropertyDescriptor {
    /// Create an unsupported, zeroed descriptor.
    #[must_use]
    pub const fn new(kind: PropertyKind) -> Self {
        Self {
            kind,
            supported: false,
            min: 0,
            max: 0,
            step: 0,
            default: 0,
            value: 0,
            auto: false,
            supports_auto: false,
            supports_manual: false,
        }
    }

    /// Return to the unsupported, zeroed state.
    pub fn reset(&mut self) {
        *self = Self::new(self.kind);
    }

    /// Populate static bounds. The value starts at the default.
    pub fn import_range(&mut self, range: PropertyRange) {
        let (min, max) = if range.min <= range.max {
            (range.min, range.max)
        } else {
            (range.max, range.min)
        };
        self.supported = range.supports_auto || range.supports_manual;
        self.min = min;
        self.max = max;
        self.step = range.step.max(1);
        self.default = range.default.clamp(min, max);
        self.value = self.default;
        self.supports_auto = range.supports_auto;
        self.supports_manual = range.supports_manual;
        self.auto = range.supports_auto && !range.supports_manual;
    }

    /// Read the live value and mode from the device.
    pub fn import_current_value(&mut self, device: &dyn PropertyControl) -> Result<()> {
        if !self.supported {
            return Err(PropertyError::Unsupported { kind: self.kind }.into());
        }
        let live = device.property_value(self.kind)?;
        let value = live.value.clamp(self.min, self.max);
        if value != live.value {
            warn!(
                property = %self.kind,
                reported = live.value,
                min = self.min,
                max = self.max,
                "device reported a value outside its own range; clamping"
            );
        }
        self.value = value;
        self.auto = if live.auto {
            self.supports_auto
        } else {
            !self.supports_manual
        };
        Ok(())
    }

    /// Validate and apply a new value and mode.
    ///
    /// With `device == None` only the local mirror is updated. Nothing is
    /// changed when validation or the device write fails.
    pub fn set_value(
        &mut self,
        device: Option<&mut dyn PropertyControl>,
        value: i32,
        auto: bool,
    ) -> Result<()> {
        self.validate(value, auto)?;
        if let Some(device) = device {
            device.write_property(self.kind, value, auto)?;
        }
        debug!(property = %self.kind, value, auto, "property updated");
        self.value = value;
        self.auto = auto;
        Ok(())
    }

    /// Apply the default value; auto mode is used only when requested and supported.
    pub fn set_to_default(
        &mut self,
        device: Option<&mut dyn PropertyControl>,
        as_auto: bool,
    ) -> Result<()> {
        let auto = (as_auto && self.supports_auto) || !self.supports_manual;
        self.set_value(device, self.default, auto)
    }

    fn validate(&self, value: i32, auto: bool) -> std::result::Result<(), PropertyError> {
        if !self.supported {
            return Err(PropertyError::Unsupported { kind: self.kind });
        }
        if (auto && !self.supports_auto) || (!auto && !self.supports_manual) {
            return Err(PropertyError::ModeUnsupported {
                kind: self.kind,
                auto,
            });
        }
        if value < self.min || value > self.max {
            return Err(PropertyError::OutOfRange {
                kind: self.kind,
                value,
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }

    /// Property identity.
    #[must_use]
    pub const fn kind(&self) -> PropertyKind {
        self.kind
    }

    /// Display name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Whether the device exposes this property.
    #[must_use]
    pub const fn is_supported(&self) -> bool {
        self.supported
    }

    /// Lower bound.
    #[must_use]
    pub const fn min(&self) -> i32 {
        self.min
    }

    /// Upper bound.
    #[must_use]
    pub const fn max(&self) -> i32 {
        self.max
    }

    /// Granularity.
    #[must_use]
    pub const fn step(&self) -> i32 {
        self.step
    }

    /// Factory default.
    #[must_use]
    pub const fn default_value(&self) -> i32 {
        self.default
    }

    /// Current value.
    #[must_use]
    pub const fn value(&self) -> i32 {
        self.value
    }

    /// Whether the device currently drives the value.
    #[must_use]
    pub const fn is_auto(&self) -> bool {
        self.auto
    }

    /// Whether auto mode is available.
    #[must_use]
    pub const fn supports_auto(&self) -> bool {
        self.supports_auto
    }

    /// Whether manual mode is available.
    #[must_use]
    pub const fn supports_manual(&self) -> bool {
        self.supports_manual
    }
}

impl fmt::Display for PropertyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.supported {
            return write!(f, "{}: unsupported", self.kind);
        }
        write!(
            f,
            "{}: {} ({}) range [{}, {}] step {} default {}",
            self.kind,
            self.value,
            if self.auto { "auto" } else { "manual" },
            self.min,
            self.max,
            self.step,
            self.default
        )
    }
}

/// Fixed collection with one descriptor per [`PropertyKind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyBank {
    descriptors: [PropertyDescriptor; PropertyKind::ALL.len()],
}

impl Default for PropertyBank {
    fn default() -> Self {
        Self::new()
    }
}

impl PropertyBank {
    /// Create a bank of unsupported descriptors.
    #[must_use]
    pub fn new() -> Self {
        Self {
            descriptors: PropertyKind::ALL.map(PropertyDescriptor::new),
        }
    }

    /// Re-import every descriptor from the device.
    ///
    /// Properties the device does not expose stay unsupported. Query
    /// failures do not stop the batch; their messages are combined in the
    /// returned error.
    pub fn refresh(&mut self, device: &dyn PropertyControl) -> Result<()> {
        let mut failures = Vec::new();
        for descriptor in &mut self.descriptors {
            descriptor.reset();
            let range = match device.property_range(descriptor.kind) {
                Ok(Some(range)) => range,
                Ok(None) => continue,
                Err(err) => {
                    failures.push(format!("{}: {err}", descriptor.kind));
                    continue;
                }
            };
            descriptor.import_range(range);
            if let Err(err) = descriptor.import_current_value(device) {
                failures.push(format!("{}: {err}", descriptor.kind));
            }
        }
        combine(failures)
    }

    /// Apply the default value to every supported descriptor.
    pub fn reset_to_default(
        &mut self,
        mut device: Option<&mut dyn PropertyControl>,
        as_auto: bool,
    ) -> Result<()> {
        let mut failures = Vec::new();
        for descriptor in self.descriptors.iter_mut().filter(|d| d.supported) {
            if let Err(err) = descriptor.set_to_default(device.as_deref_mut(), as_auto) {
                failures.push(err.to_string());
            }
        }
        combine(failures)
    }

    /// Validate and apply a value to one property.
    pub fn set(
        &mut self,
        kind: PropertyKind,
        device: Option<&mut dyn PropertyControl>,
        value: i32,
        auto: bool,
    ) -> Result<()> {
        self.get_mut(kind).set_value(device, value, auto)
    }

    /// Mark every descriptor unsupported.
    pub fn clear(&mut self) {
        for descriptor in &mut self.descriptors {
            descriptor.reset();
        }
    }

    /// Descriptor for `kind`.
    #[must_use]
    #[allow(clippy::indexing_slicing)]
    pub const fn get(&self, kind: PropertyKind) -> &PropertyDescriptor {
        // ALL lists every variant in declaration order.
        &self.descriptors[kind as usize]
    }

    /// Mutable descriptor for `kind`.
    #[allow(clippy::indexing_slicing)]
    pub fn get_mut(&mut self, kind: PropertyKind) -> &mut PropertyDescriptor {
        &mut self.descriptors[kind as usize]
    }

    /// Descriptor by case-insensitive name.
    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<&PropertyDescriptor> {
        PropertyKind::from_name(name).map(|kind| self.get(kind))
    }

    /// All descriptors, in [`PropertyKind::ALL`] order.
    pub fn iter(&self) -> impl Iterator<Item = &PropertyDescriptor> {
        self.descriptors.iter()
    }
}

fn combine(failures: Vec<String>) -> Result<()> {
    if failures.is_empty() {
        Ok(())
    } else {
        Err(CaptureError::PropertyImport(failures.join("; ")))
    }
}
