//! Hardware-free capture backend.
//!
//! [`SimulatedDevice`] builds the same pipeline stages as a real device and
//! streams generated frames from its own delivery thread. A
//! [`SimulatedHandle`] stays with the test after the device is moved into a
//! session and can inject failures, stalls and disconnection.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::descriptor::DeviceDescriptor;
use crate::error::{CaptureError, PropertyError, Result};
use crate::format::{FormatSource, FourCC, NativeFormat, VideoFormat};
use crate::pipeline::Stage;
use crate::property::{PropertyControl, PropertyKind, PropertyRange, PropertyValue};
use crate::sink::SampleCallback;
use crate::traits::{CaptureBackend, ControlState, StageContext, StateChange};
use crate::watchdog::{DeviceHealth, HealthSignal};

/// Test pattern types for generated frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPattern {
    /// SMPTE color bars pattern.
    ColorBars,
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Solid color with specified Y, U, V values.
    Solid(u8, u8, u8),
}

/// A pipeline stage event recorded by the simulated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageEvent {
    /// Stage was built.
    Built(Stage),
    /// Stage was released.
    Released(Stage),
}

#[derive(Debug)]
struct Controls {
    descriptor: DeviceDescriptor,
    disconnected: bool,
    stalled: bool,
    payload_override: Option<usize>,
    fail_stage: Option<Stage>,
    fail_format: bool,
    pending_polls: u32,
    cannot_cue: bool,
    events: Vec<StageEvent>,
}

#[derive(Debug)]
struct Shared {
    controls: Mutex<Controls>,
    delivered: AtomicU64,
}

impl Shared {
    fn controls(&self) -> MutexGuard<'_, Controls> {
        self.controls.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Test-side control over a [`SimulatedDevice`].
#[derive(Debug, Clone)]
pub struct SimulatedHandle {
    shared: Arc<Shared>,
}

impl SimulatedHandle {
    /// Descriptor the device enumerates as.
    pub fn descriptor(&self) -> DeviceDescriptor {
        self.shared.controls().descriptor.clone()
    }

    /// Unplug the device: delivery stops and health probes report loss.
    pub fn disconnect(&self) {
        info!("simulated device disconnected");
        self.shared.controls().disconnected = true;
    }

    /// Plug the device back in.
    pub fn reconnect(&self) {
        self.shared.controls().disconnected = false;
    }

    /// Pause delivery without reporting loss.
    pub fn set_stalled(&self, stalled: bool) {
        self.shared.controls().stalled = stalled;
    }

    /// Deliver payloads of `size` bytes instead of the configured frame size.
    pub fn override_payload_size(&self, size: Option<usize>) {
        self.shared.controls().payload_override = size;
    }

    /// Make building `stage` fail.
    pub fn fail_stage(&self, stage: Option<Stage>) {
        self.shared.controls().fail_stage = stage;
    }

    /// Make the next format change fail.
    pub fn fail_next_format(&self) {
        self.shared.controls().fail_format = true;
    }

    /// Number of polls every following state transition stays pending.
    pub fn set_pending_polls(&self, polls: u32) {
        self.shared.controls().pending_polls = polls;
    }

    /// Report "cannot cue" when pausing.
    pub fn set_cannot_cue(&self, cannot_cue: bool) {
        self.shared.controls().cannot_cue = cannot_cue;
    }

    /// Recorded stage events, oldest first.
    pub fn events(&self) -> Vec<StageEvent> {
        self.shared.controls().events.clone()
    }

    /// Stages built, in order.
    pub fn built_stages(&self) -> Vec<Stage> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                StageEvent::Built(stage) => Some(stage),
                StageEvent::Released(_) => None,
            })
            .collect()
    }

    /// Stages released, in order.
    pub fn released_stages(&self) -> Vec<Stage> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                StageEvent::Released(stage) => Some(stage),
                StageEvent::Built(_) => None,
            })
            .collect()
    }

    /// Forget recorded events.
    pub fn clear_events(&self) {
        self.shared.controls().events.clear();
    }

    /// Payloads handed to the frame callback so far.
    pub fn frames_delivered(&self) -> u64 {
        self.shared.delivered.load(Ordering::Acquire)
    }
}

struct SimulatedHealth {
    shared: Arc<Shared>,
}

impl DeviceHealth for SimulatedHealth {
    fn check(&self) -> HealthSignal {
        if self.shared.controls().disconnected {
            HealthSignal::Lost
        } else {
            HealthSignal::Healthy
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SimulatedProperty {
    range: PropertyRange,
    value: PropertyValue,
}

struct Streamer {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// Simulated capture device.
pub struct SimulatedDevice {
    shared: Arc<Shared>,
    formats: Vec<VideoFormat>,
    current: VideoFormat,
    grabber_format: Option<VideoFormat>,
    properties: BTreeMap<PropertyKind, SimulatedProperty>,
    fps: f64,
    pattern: TestPattern,
    callback: Option<Arc<dyn SampleCallback>>,
    state: ControlState,
    pending: Option<(ControlState, u32)>,
    streamer: Option<Streamer>,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDevice {
    /// Create a simulated device with default settings: three formats
    /// (640x480 YUYV current), a handful of properties, 30 fps color bars.
    #[must_use]
    pub fn new() -> Self {
        let device = Self {
            shared: Arc::new(Shared {
                controls: Mutex::new(Controls {
                    descriptor: DeviceDescriptor::new("Simulated Camera", "/dev/simulated0")
                        .with_description("simulated"),
                    disconnected: false,
                    stalled: false,
                    payload_override: None,
                    fail_stage: None,
                    fail_format: false,
                    pending_polls: 0,
                    cannot_cue: false,
                    events: Vec::new(),
                }),
                delivered: AtomicU64::new(0),
            }),
            formats: Vec::new(),
            current: VideoFormat::empty(),
            grabber_format: None,
            properties: BTreeMap::new(),
            fps: 30.0,
            pattern: TestPattern::ColorBars,
            callback: None,
            state: ControlState::Stopped,
            pending: None,
            streamer: None,
        };

        let manual = |min, max, step, default| PropertyRange {
            min,
            max,
            step,
            default,
            supports_auto: false,
            supports_manual: true,
        };
        device
            .with_formats(vec![
                VideoFormat::new(640, 480, FourCC::YUYV),
                VideoFormat::new(320, 240, FourCC::YUYV),
                VideoFormat::new(640, 480, FourCC::RGB3),
            ])
            .with_property(PropertyKind::Brightness, manual(0, 255, 1, 128))
            .with_property(PropertyKind::Contrast, manual(0, 255, 1, 32))
            .with_property(
                PropertyKind::Exposure,
                PropertyRange {
                    min: -12,
                    max: -3,
                    step: 1,
                    default: -6,
                    supports_auto: true,
                    supports_manual: true,
                },
            )
            .with_property(
                PropertyKind::WhiteBalance,
                PropertyRange {
                    min: 2800,
                    max: 6500,
                    step: 10,
                    default: 4600,
                    supports_auto: true,
                    supports_manual: true,
                },
            )
    }

    /// Set the name and path the device enumerates as.
    #[must_use]
    pub fn with_identity<N: Into<String>, P: Into<PathBuf>>(self, name: N, path: P) -> Self {
        {
            let mut controls = self.shared.controls();
            controls.descriptor.friendly_name = name.into();
            controls.descriptor.device_path = path.into();
        }
        self
    }

    /// Replace the supported formats. The first one becomes current.
    #[must_use]
    pub fn with_formats(mut self, formats: Vec<VideoFormat>) -> Self {
        self.formats = formats
            .into_iter()
            .enumerate()
            .map(|(index, format)| format.with_native(NativeFormat::new(index, index as u64)))
            .collect();
        self.current = self.formats.first().cloned().unwrap_or_else(VideoFormat::empty);
        self.shared.controls().descriptor.formats = self.formats.clone();
        self
    }

    /// Expose `kind` with `range`; the current value starts at the default.
    #[must_use]
    pub fn with_property(mut self, kind: PropertyKind, range: PropertyRange) -> Self {
        let value = PropertyValue {
            value: range.default,
            auto: range.supports_auto && !range.supports_manual,
        };
        self.properties.insert(kind, SimulatedProperty { range, value });
        self
    }

    /// Expose no properties.
    #[must_use]
    pub fn without_properties(mut self) -> Self {
        self.properties.clear();
        self
    }

    /// Delivery rate.
    #[must_use]
    pub fn with_fps(mut self, fps: f64) -> Self {
        self.fps = fps.max(0.1);
        self
    }

    /// Frame content pattern.
    #[must_use]
    pub const fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Advertise a minimum frame-rate contract.
    #[must_use]
    pub fn with_minimum_fps(self, minimum_fps: f64) -> Self {
        self.shared.controls().descriptor.minimum_fps = Some(minimum_fps);
        self
    }

    /// Test-side handle sharing this device's state.
    #[must_use]
    pub fn handle(&self) -> SimulatedHandle {
        SimulatedHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.shared.controls().disconnected {
            return Err(CaptureError::backend("device disconnected"));
        }
        Ok(())
    }

    fn record(&self, event: StageEvent) {
        self.shared.controls().events.push(event);
    }

    fn enter(&mut self, target: ControlState) -> Result<()> {
        match target {
            ControlState::Running => self.start_stream()?,
            ControlState::Paused | ControlState::Stopped => self.stop_stream(),
        }
        debug!(state = %target, "simulated control state");
        self.state = target;
        Ok(())
    }

    fn start_stream(&mut self) -> Result<()> {
        if self.streamer.is_some() {
            return Ok(());
        }
        let Some(callback) = self.callback.clone() else {
            return Err(CaptureError::backend("frame callback not registered"));
        };
        let format = self
            .grabber_format
            .clone()
            .unwrap_or_else(|| self.current.clone());
        let stop = Arc::new(AtomicBool::new(false));
        let delivery = Delivery {
            shared: Arc::clone(&self.shared),
            stop: Arc::clone(&stop),
            callback,
            format,
            pattern: self.pattern,
            interval: Duration::from_secs_f64(1.0 / self.fps),
        };
        let thread = thread::Builder::new()
            .name("cam-simulated".to_owned())
            .spawn(move || delivery.run())
            .map_err(|err| CaptureError::backend(format!("failed to spawn delivery: {err}")))?;
        self.streamer = Some(Streamer { stop, thread });
        Ok(())
    }

    fn stop_stream(&mut self) {
        if let Some(streamer) = self.streamer.take() {
            streamer.stop.store(true, Ordering::Release);
            if streamer.thread.join().is_err() {
                warn!("simulated delivery thread panicked");
            }
        }
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        self.stop_stream();
    }
}

struct Delivery {
    shared: Arc<Shared>,
    stop: Arc<AtomicBool>,
    callback: Arc<dyn SampleCallback>,
    format: VideoFormat,
    pattern: TestPattern,
    interval: Duration,
}

impl Delivery {
    fn run(self) {
        let mut payload = Vec::new();
        while !self.stop.load(Ordering::Acquire) {
            let (silent, size) = {
                let controls = self.shared.controls();
                (
                    controls.disconnected || controls.stalled,
                    controls
                        .payload_override
                        .unwrap_or(self.format.total_bytes as usize),
                )
            };
            if !silent {
                if payload.len() != size {
                    payload = vec![0; size];
                    fill_pattern(&mut payload, &self.format, self.pattern);
                }
                self.callback.on_sample(&payload);
                self.shared.delivered.fetch_add(1, Ordering::AcqRel);
            }
            thread::sleep(self.interval);
        }
    }
}

impl FormatSource for SimulatedDevice {
    fn capability_count(&self) -> Result<usize> {
        self.ensure_connected()?;
        Ok(self.formats.len())
    }

    fn capability(&self, index: usize) -> Result<VideoFormat> {
        self.formats
            .get(index)
            .cloned()
            .ok_or(CaptureError::FormatIndex {
                index,
                len: self.formats.len(),
            })
    }
}

impl PropertyControl for SimulatedDevice {
    fn property_range(&self, kind: PropertyKind) -> Result<Option<PropertyRange>> {
        self.ensure_connected()?;
        Ok(self.properties.get(&kind).map(|property| property.range))
    }

    fn property_value(&self, kind: PropertyKind) -> Result<PropertyValue> {
        self.ensure_connected()?;
        self.properties
            .get(&kind)
            .map(|property| property.value)
            .ok_or_else(|| PropertyError::Unsupported { kind }.into())
    }

    fn write_property(&mut self, kind: PropertyKind, value: i32, auto: bool) -> Result<()> {
        self.ensure_connected()?;
        let property = self
            .properties
            .get_mut(&kind)
            .ok_or(PropertyError::Unsupported { kind })?;
        property.value = PropertyValue { value, auto };
        Ok(())
    }
}

impl CaptureBackend for SimulatedDevice {
    fn name(&self) -> &str {
        "simulated"
    }

    fn format_source(&self) -> &dyn FormatSource {
        self
    }

    fn property_control(&self) -> &dyn PropertyControl {
        self
    }

    fn property_control_mut(&mut self) -> &mut dyn PropertyControl {
        self
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        let controls = self.shared.controls();
        if controls.disconnected {
            return Ok(Vec::new());
        }
        Ok(vec![controls.descriptor.clone()])
    }

    fn build_stage(&mut self, stage: Stage, context: &StageContext<'_>) -> Result<()> {
        {
            let controls = self.shared.controls();
            if controls.fail_stage == Some(stage) {
                return Err(CaptureError::backend("injected failure"));
            }
            if stage == Stage::Source && controls.disconnected {
                return Err(CaptureError::DeviceNotFound(
                    context.device.device_path.display().to_string(),
                ));
            }
        }
        if stage == Stage::Callback {
            self.callback = Some(Arc::clone(&context.callback));
        }
        self.record(StageEvent::Built(stage));
        Ok(())
    }

    fn release_stage(&mut self, stage: Stage) {
        match stage {
            Stage::Callback => self.callback = None,
            Stage::Grabber => {
                self.stop_stream();
                self.grabber_format = None;
            }
            Stage::Control => {
                self.state = ControlState::Stopped;
                self.pending = None;
            }
            Stage::Graph | Stage::Source | Stage::Terminal => {}
        }
        self.record(StageEvent::Released(stage));
    }

    fn current_format(&self) -> Result<VideoFormat> {
        Ok(self.current.clone())
    }

    fn apply_format(&mut self, format: &VideoFormat) -> Result<()> {
        self.ensure_connected()?;
        if std::mem::take(&mut self.shared.controls().fail_format) {
            return Err(CaptureError::backend(format!("device rejected {format}")));
        }
        let found = self
            .formats
            .iter()
            .find(|candidate| *candidate == format)
            .cloned()
            .ok_or_else(|| CaptureError::FormatNotSupported(format.clone()))?;
        self.current = found;
        Ok(())
    }

    fn configure_grabber(&mut self, format: &VideoFormat) -> Result<()> {
        self.grabber_format = Some(format.clone());
        Ok(())
    }

    fn request_state(&mut self, target: ControlState) -> Result<StateChange> {
        if target == ControlState::Running {
            self.ensure_connected()?;
        }
        let (polls, cannot_cue) = {
            let controls = self.shared.controls();
            (controls.pending_polls, controls.cannot_cue)
        };
        if polls > 0 {
            self.pending = Some((target, polls));
            return Ok(StateChange::Pending);
        }
        self.enter(target)?;
        if target == ControlState::Paused && cannot_cue {
            return Ok(StateChange::CannotCue);
        }
        Ok(StateChange::Complete)
    }

    fn poll_state(&mut self) -> Result<StateChange> {
        let Some((target, remaining)) = self.pending else {
            return Ok(StateChange::Complete);
        };
        if remaining > 1 {
            self.pending = Some((target, remaining - 1));
            return Ok(StateChange::Pending);
        }
        self.pending = None;
        self.enter(target)?;
        Ok(StateChange::Complete)
    }

    fn health(&self) -> Arc<dyn DeviceHealth> {
        Arc::new(SimulatedHealth {
            shared: Arc::clone(&self.shared),
        })
    }
}

// YUYV values for each bar: white, yellow, cyan, green, magenta, red, blue, black.
const BARS: [(u8, u8, u8); 8] = [
    (235, 128, 128),
    (210, 16, 146),
    (170, 166, 16),
    (145, 54, 34),
    (106, 202, 222),
    (81, 90, 240),
    (41, 240, 110),
    (16, 128, 128),
];

/// Fill `data` with `pattern`. Packed YUYV gets the pattern proper; any
/// other encoding gets a deterministic byte ramp.
#[allow(clippy::cast_possible_truncation)]
pub fn fill_pattern(data: &mut [u8], format: &VideoFormat, pattern: TestPattern) {
    if format.fourcc != FourCC::YUYV || format.width < 2 {
        for (index, byte) in data.iter_mut().enumerate() {
            *byte = (index % 251) as u8;
        }
        return;
    }

    let width = format.width as usize;
    let pairs_per_row = width / 2;
    let bar_width = (width / BARS.len()).max(1);

    for (pair, chunk) in data.chunks_exact_mut(4).enumerate() {
        let x = (pair % pairs_per_row) * 2;
        let (y, u, v) = match pattern {
            TestPattern::ColorBars => BARS
                .get(x / bar_width)
                .or(BARS.last())
                .copied()
                .unwrap_or((16, 128, 128)),
            TestPattern::Gradient => (((x * 255) / width) as u8, 128, 128),
            TestPattern::Solid(y, u, v) => (y, u, v),
        };
        chunk.copy_from_slice(&[y, u, y, v]);
    }
}
