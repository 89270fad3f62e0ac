//! Core traits and types for the capture backend abstraction.

use std::fmt;
use std::sync::Arc;

use crate::descriptor::DeviceDescriptor;
use crate::error::Result;
use crate::format::{FormatSource, VideoFormat};
use crate::pipeline::Stage;
use crate::property::PropertyControl;
use crate::sink::SampleCallback;
use crate::watchdog::DeviceHealth;

/// State of the pipeline's control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    /// No data flows; device resources may be released.
    Stopped,
    /// Data flow held; device resources kept.
    Paused,
    /// Data flows to the frame callback.
    Running,
}

impl ControlState {
    /// Lower-case state name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Paused => "paused",
            Self::Running => "running",
        }
    }
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of a control-surface state request or poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    /// The requested state has been reached.
    Complete,
    /// The transition is still in progress; poll again.
    Pending,
    /// Paused, but the source cannot produce data while paused. Not an error.
    CannotCue,
}

/// Inputs available while building a pipeline stage.
pub struct StageContext<'a> {
    /// Device being opened.
    pub device: &'a DeviceDescriptor,
    /// Frame callback target, registered by the [`Stage::Callback`] stage.
    pub callback: Arc<dyn SampleCallback>,
}

/// Capability set of a capture device backend.
///
/// A session builds the backend's pipeline stage by stage in [`Stage::ORDER`]
/// and releases them in reverse. After the [`Stage::Terminal`] stage the
/// backend must be able to report formats and properties and to change the
/// control-surface state.
pub trait CaptureBackend: FormatSource + PropertyControl + Send {
    /// Short backend name used in logs.
    fn name(&self) -> &str;

    /// The backend as a format source.
    fn format_source(&self) -> &dyn FormatSource;

    /// The backend as a property control surface.
    fn property_control(&self) -> &dyn PropertyControl;

    /// Mutable property control surface.
    fn property_control_mut(&mut self) -> &mut dyn PropertyControl;

    /// Devices this backend can open.
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>>;

    /// Build one pipeline stage.
    fn build_stage(&mut self, stage: Stage, context: &StageContext<'_>) -> Result<()>;

    /// Release one pipeline stage. Called exactly once for every stage that
    /// was built, in reverse construction order.
    fn release_stage(&mut self, stage: Stage);

    /// Format the device is currently configured for.
    fn current_format(&self) -> Result<VideoFormat>;

    /// Apply `format` to the device's stream configuration.
    fn apply_format(&mut self, format: &VideoFormat) -> Result<()>;

    /// Tell the grabber which payload size and encoding to expect.
    fn configure_grabber(&mut self, format: &VideoFormat) -> Result<()>;

    /// Request a control-surface state.
    fn request_state(&mut self, target: ControlState) -> Result<StateChange>;

    /// Poll an in-progress transition.
    fn poll_state(&mut self) -> Result<StateChange>;

    /// Health probe usable from the watchdog thread.
    fn health(&self) -> Arc<dyn DeviceHealth>;
}
