//! V4L2 capture backend using the v4l crate.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::control::{Control, Description, Value};
use v4l::framesize::FrameSizeEnum;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream as V4lCaptureStream;
use v4l::video::Capture;
use v4l::Device;

use crate::descriptor::DeviceDescriptor;
use crate::error::{CaptureError, PropertyError, Result};
use crate::format::{FormatSource, FourCC, NativeFormat, VideoFormat};
use crate::pipeline::Stage;
use crate::property::{PropertyControl, PropertyKind, PropertyRange, PropertyValue};
use crate::sink::SampleCallback;
use crate::traits::{CaptureBackend, ControlState, StageContext, StateChange};
use crate::watchdog::{DeviceHealth, HealthSignal};

const ENODEV: i32 = 19;
const STREAM_TIMEOUT: Duration = Duration::from_millis(500);

// Exposure auto menu entries.
const EXPOSURE_MANUAL: i64 = 1;
const EXPOSURE_APERTURE_PRIORITY: i64 = 3;

/// Capabilities reported by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Whether the device can capture video.
    pub can_capture: bool,
    /// Whether the device supports streaming.
    pub can_stream: bool,
}

impl DeviceCapabilities {
    fn query(device: &Device) -> Result<Self> {
        let caps = device.query_caps()?;
        Ok(Self {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            can_capture: caps
                .capabilities
                .contains(v4l::capability::Flags::VIDEO_CAPTURE),
            can_stream: caps.capabilities.contains(v4l::capability::Flags::STREAMING),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct ControlIds {
    value: u32,
    auto: Option<u32>,
}

const fn control_ids(kind: PropertyKind) -> Option<ControlIds> {
    let (value, auto) = match kind {
        PropertyKind::Brightness => (0x0098_0900, None),
        PropertyKind::Contrast => (0x0098_0901, None),
        PropertyKind::Saturation => (0x0098_0902, None),
        PropertyKind::Hue => (0x0098_0903, Some(0x0098_0919)),
        PropertyKind::Gamma => (0x0098_0910, None),
        PropertyKind::Gain => (0x0098_0913, Some(0x0098_0912)),
        PropertyKind::WhiteBalance => (0x0098_091a, Some(0x0098_090c)),
        PropertyKind::Sharpness => (0x0098_091b, None),
        PropertyKind::BacklightCompensation => (0x0098_091c, None),
        PropertyKind::Exposure => (0x009a_0902, Some(0x009a_0901)),
        PropertyKind::Pan => (0x009a_0908, None),
        PropertyKind::Tilt => (0x009a_0909, None),
        PropertyKind::Focus => (0x009a_090a, Some(0x009a_090c)),
        PropertyKind::Zoom => (0x009a_090d, None),
        PropertyKind::Iris => (0x009a_0911, None),
        PropertyKind::ColorEnable | PropertyKind::Roll => return None,
    };
    Some(ControlIds { value, auto })
}

fn saturate(value: i64) -> i32 {
    i32::try_from(value).unwrap_or(if value < 0 { i32::MIN } else { i32::MAX })
}

fn video_format(width: u32, height: u32, fourcc: v4l::FourCC) -> VideoFormat {
    VideoFormat::new(width, height, FourCC::from(fourcc))
}

/// Format the driver settled on, sized by its `sizeimage`. Padded lines and
/// compressed encodings make this differ from the nominal size.
fn negotiated(native: &v4l::Format) -> VideoFormat {
    let format = video_format(native.width, native.height, native.fourcc);
    if native.size > 0 && !format.is_empty() {
        format.with_total_bytes(native.size)
    } else {
        format
    }
}

/// Every (encoding, frame size) pair the device reports. Stepwise ranges
/// contribute their smallest and largest size.
///
/// With `probe`, each entry is tried on the device so the catalog carries the
/// size the driver will actually deliver; the original format is restored
/// afterwards. Without it entries keep their nominal size.
fn enumerate_formats(device: &Device, probe: bool) -> Result<Vec<VideoFormat>> {
    let original = device.format()?;
    let mut formats = Vec::new();
    for description in device.enum_formats()? {
        let sizes = match device.enum_framesizes(description.fourcc) {
            Ok(sizes) => sizes,
            Err(err) => {
                warn!(fourcc = %FourCC::from(description.fourcc), error = %err, "frame sizes unavailable");
                continue;
            }
        };
        for (size_index, size) in sizes.into_iter().enumerate() {
            let token = (u64::from(description.index) << 32) | size_index as u64;
            let candidates = match size.size {
                FrameSizeEnum::Discrete(discrete) => vec![(discrete.width, discrete.height)],
                FrameSizeEnum::Stepwise(stepwise) => vec![
                    (stepwise.min_width, stepwise.min_height),
                    (stepwise.max_width, stepwise.max_height),
                ],
            };
            for (width, height) in candidates {
                let format = if probe {
                    probe_format(device, width, height, description.fourcc)
                } else {
                    video_format(width, height, description.fourcc)
                };
                if format.is_empty() {
                    continue;
                }
                let native = NativeFormat::new(formats.len(), token);
                formats.push(format.with_native(native));
            }
        }
    }
    if probe {
        if let Err(err) = device.set_format(&original) {
            warn!(error = %err, "could not restore the original format");
        }
    }
    Ok(formats)
}

fn probe_format(device: &Device, width: u32, height: u32, fourcc: v4l::FourCC) -> VideoFormat {
    match device.set_format(&v4l::Format::new(width, height, fourcc)) {
        Ok(actual) if actual.fourcc == fourcc => negotiated(&actual),
        Ok(_) => video_format(width, height, fourcc),
        Err(err) => {
            debug!(width, height, error = %err, "format probe refused");
            video_format(width, height, fourcc)
        }
    }
}

struct V4L2Health {
    path: PathBuf,
    lost: Arc<AtomicBool>,
}

impl DeviceHealth for V4L2Health {
    fn check(&self) -> HealthSignal {
        if self.lost.load(Ordering::Acquire) || !self.path.exists() {
            HealthSignal::Lost
        } else {
            HealthSignal::Healthy
        }
    }
}

struct Streamer {
    stop: Arc<AtomicBool>,
    ready: Receiver<std::result::Result<(), String>>,
    started: bool,
    thread: JoinHandle<()>,
}

/// V4L2 capture backend.
///
/// The source stage opens the device node; streaming runs on a dedicated
/// thread with its own handle and mmap buffers.
pub struct V4L2Device {
    buffer_count: u32,
    path: Option<PathBuf>,
    device: Option<Device>,
    capabilities: Option<DeviceCapabilities>,
    formats: Vec<VideoFormat>,
    controls: BTreeMap<u32, Description>,
    callback: Option<Arc<dyn SampleCallback>>,
    state: ControlState,
    streamer: Option<Streamer>,
    lost: Arc<AtomicBool>,
}

impl Default for V4L2Device {
    fn default() -> Self {
        Self::new()
    }
}

impl V4L2Device {
    /// Create an unopened backend.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer_count: 4,
            path: None,
            device: None,
            capabilities: None,
            formats: Vec::new(),
            controls: BTreeMap::new(),
            callback: None,
            state: ControlState::Stopped,
            streamer: None,
            lost: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Number of mmap buffers used while streaming.
    #[must_use]
    pub fn with_buffer_count(mut self, buffer_count: u32) -> Self {
        self.buffer_count = buffer_count.max(2);
        self
    }

    /// Driver capabilities of the open device.
    pub const fn capabilities(&self) -> Option<&DeviceCapabilities> {
        self.capabilities.as_ref()
    }

    fn device(&self) -> Result<&Device> {
        self.device.as_ref().ok_or(CaptureError::NotOpen)
    }

    fn open_source(&mut self, path: &Path) -> Result<()> {
        let device = Device::with_path(path)
            .map_err(|err| CaptureError::DeviceNotFound(format!("{}: {err}", path.display())))?;
        let capabilities = DeviceCapabilities::query(&device)?;
        if !capabilities.can_capture || !capabilities.can_stream {
            return Err(CaptureError::backend(format!(
                "{} cannot stream video capture",
                capabilities.card
            )));
        }

        self.formats = enumerate_formats(&device, true)?;
        self.controls = device
            .query_controls()
            .unwrap_or_default()
            .into_iter()
            .map(|description| (description.id, description))
            .collect();
        info!(
            device = %path.display(),
            driver = %capabilities.driver,
            card = %capabilities.card,
            formats = self.formats.len(),
            controls = self.controls.len(),
            "V4L2 device opened"
        );

        self.lost.store(false, Ordering::Release);
        self.path = Some(path.to_path_buf());
        self.capabilities = Some(capabilities);
        self.device = Some(device);
        Ok(())
    }

    fn close_source(&mut self) {
        self.device = None;
        self.capabilities = None;
        self.formats.clear();
        self.controls.clear();
    }

    fn read_control(&self, id: u32) -> Result<i64> {
        match self.device()?.control(id)?.value {
            Value::Integer(value) => Ok(value),
            Value::Boolean(value) => Ok(i64::from(value)),
            other => Err(CaptureError::backend(format!(
                "control {id:#x} has unexpected value {other:?}"
            ))),
        }
    }

    fn write_control(&self, id: u32, value: i64) -> Result<()> {
        let boolean = matches!(
            self.controls.get(&id).map(|description| &description.typ),
            Some(v4l::control::Type::Boolean)
        );
        let value = if boolean {
            Value::Boolean(value != 0)
        } else {
            Value::Integer(value)
        };
        self.device()?.set_control(Control { id, value })?;
        Ok(())
    }

    fn start_stream(&mut self) -> Result<()> {
        if self.streamer.is_some() {
            return Ok(());
        }
        let path = self.path.clone().ok_or(CaptureError::NotOpen)?;
        let callback = self
            .callback
            .clone()
            .ok_or_else(|| CaptureError::backend("frame callback not registered"))?;
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready) = mpsc::channel();
        let worker = StreamWorker {
            path,
            buffer_count: self.buffer_count,
            callback,
            stop: Arc::clone(&stop),
            lost: Arc::clone(&self.lost),
            ready: ready_tx,
        };
        let thread = thread::Builder::new()
            .name("cam-v4l2".to_owned())
            .spawn(move || worker.run())?;
        self.streamer = Some(Streamer {
            stop,
            ready,
            started: false,
            thread,
        });
        Ok(())
    }

    fn stop_stream(&mut self) {
        if let Some(streamer) = self.streamer.take() {
            streamer.stop.store(true, Ordering::Release);
            if streamer.thread.join().is_err() {
                warn!("V4L2 streaming thread panicked");
            }
            debug!("V4L2 streaming stopped");
        }
    }
}

impl Drop for V4L2Device {
    fn drop(&mut self) {
        self.stop_stream();
    }
}

struct StreamWorker {
    path: PathBuf,
    buffer_count: u32,
    callback: Arc<dyn SampleCallback>,
    stop: Arc<AtomicBool>,
    lost: Arc<AtomicBool>,
    ready: Sender<std::result::Result<(), String>>,
}

impl StreamWorker {
    fn run(self) {
        let device = match Device::with_path(&self.path) {
            Ok(device) => device,
            Err(err) => {
                let _ = self.ready.send(Err(err.to_string()));
                return;
            }
        };
        let mut stream = match Stream::with_buffers(&device, Type::VideoCapture, self.buffer_count)
        {
            Ok(stream) => stream,
            Err(err) => {
                let _ = self.ready.send(Err(err.to_string()));
                return;
            }
        };
        stream.set_timeout(STREAM_TIMEOUT);
        let _ = self.ready.send(Ok(()));

        while !self.stop.load(Ordering::Acquire) {
            match stream.next() {
                Ok((buf, meta)) => {
                    let used = usize::try_from(meta.bytesused).unwrap_or(buf.len());
                    self.callback.on_sample(buf.get(..used).unwrap_or(buf));
                }
                Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {}
                Err(err) => {
                    if err.raw_os_error() == Some(ENODEV) {
                        warn!(device = %self.path.display(), "V4L2 device vanished");
                        self.lost.store(true, Ordering::Release);
                    } else {
                        warn!(device = %self.path.display(), error = %err, "V4L2 dequeue failed");
                    }
                    break;
                }
            }
        }
    }
}

impl FormatSource for V4L2Device {
    fn capability_count(&self) -> Result<usize> {
        self.device()?;
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

impl PropertyControl for V4L2Device {
    fn property_range(&self, kind: PropertyKind) -> Result<Option<PropertyRange>> {
        self.device()?;
        let Some(ids) = control_ids(kind) else {
            return Ok(None);
        };
        let Some(description) = self.controls.get(&ids.value) else {
            return Ok(None);
        };
        Ok(Some(PropertyRange {
            min: saturate(description.minimum),
            max: saturate(description.maximum),
            step: saturate(i64::try_from(description.step).unwrap_or(i64::MAX)),
            default: saturate(description.default),
            supports_auto: ids.auto.is_some_and(|id| self.controls.contains_key(&id)),
            supports_manual: true,
        }))
    }

    fn property_value(&self, kind: PropertyKind) -> Result<PropertyValue> {
        let ids = control_ids(kind).ok_or(PropertyError::Unsupported { kind })?;
        let value = saturate(self.read_control(ids.value)?);
        let auto = match ids.auto.filter(|id| self.controls.contains_key(id)) {
            Some(id) if kind == PropertyKind::Exposure => self.read_control(id)? != EXPOSURE_MANUAL,
            Some(id) => self.read_control(id)? != 0,
            None => false,
        };
        Ok(PropertyValue { value, auto })
    }

    fn write_property(&mut self, kind: PropertyKind, value: i32, auto: bool) -> Result<()> {
        let ids = control_ids(kind).ok_or(PropertyError::Unsupported { kind })?;
        if let Some(id) = ids.auto.filter(|id| self.controls.contains_key(id)) {
            let mode = match (kind, auto) {
                (PropertyKind::Exposure, true) => EXPOSURE_APERTURE_PRIORITY,
                (PropertyKind::Exposure, false) => EXPOSURE_MANUAL,
                (_, auto) => i64::from(auto),
            };
            self.write_control(id, mode)?;
        }
        if !auto {
            self.write_control(ids.value, i64::from(value))?;
        }
        debug!(property = %kind, value, auto, "V4L2 control written");
        Ok(())
    }
}

impl CaptureBackend for V4L2Device {
    fn name(&self) -> &str {
        "v4l2"
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
        let mut devices = Vec::new();
        for node in v4l::context::enum_devices() {
            let path = node.path().to_path_buf();
            let Ok(device) = Device::with_path(&path) else {
                continue;
            };
            let Ok(capabilities) = DeviceCapabilities::query(&device) else {
                continue;
            };
            if !capabilities.can_capture {
                continue;
            }
            let formats = enumerate_formats(&device, false).unwrap_or_default();
            let name = node.name().unwrap_or_else(|| capabilities.card.clone());
            devices.push(
                DeviceDescriptor::new(name, path)
                    .with_description(format!("{} ({})", capabilities.driver, capabilities.bus_info))
                    .with_formats(formats),
            );
        }
        devices.sort_by(|a, b| a.device_path.cmp(&b.device_path));
        Ok(devices)
    }

    fn build_stage(&mut self, stage: Stage, context: &StageContext<'_>) -> Result<()> {
        match stage {
            Stage::Graph => {
                self.lost.store(false, Ordering::Release);
            }
            Stage::Control => self.state = ControlState::Stopped,
            Stage::Source => self.open_source(&context.device.device_path)?,
            Stage::Grabber => {
                if self.formats.is_empty() {
                    return Err(CaptureError::backend("device reports no capture formats"));
                }
            }
            Stage::Callback => self.callback = Some(Arc::clone(&context.callback)),
            Stage::Terminal => {
                let format = self.device()?.format()?;
                debug!(
                    width = format.width,
                    height = format.height,
                    fourcc = %FourCC::from(format.fourcc),
                    "V4L2 pipeline connected"
                );
            }
        }
        Ok(())
    }

    fn release_stage(&mut self, stage: Stage) {
        match stage {
            Stage::Terminal => {}
            Stage::Callback => {
                self.stop_stream();
                self.callback = None;
            }
            Stage::Grabber => self.stop_stream(),
            Stage::Source => self.close_source(),
            Stage::Control => self.state = ControlState::Stopped,
            Stage::Graph => self.path = None,
        }
    }

    fn current_format(&self) -> Result<VideoFormat> {
        let current = negotiated(&self.device()?.format()?);
        Ok(self
            .formats
            .iter()
            .find(|known| **known == current)
            .cloned()
            .unwrap_or(current))
    }

    fn apply_format(&mut self, format: &VideoFormat) -> Result<()> {
        let device = self.device()?;
        let mut native = device.format()?;
        native.width = format.width;
        native.height = format.height;
        native.fourcc = format.fourcc.into();

        let actual = device.set_format(&native)?;
        if actual.width != format.width
            || actual.height != format.height
            || FourCC::from(actual.fourcc) != format.fourcc
        {
            return Err(CaptureError::FormatNotSupported(format.clone()));
        }
        if actual.size != format.total_bytes {
            warn!(
                expected = format.total_bytes,
                actual = actual.size,
                "driver frame size differs from the catalog entry"
            );
        }
        Ok(())
    }

    fn configure_grabber(&mut self, format: &VideoFormat) -> Result<()> {
        let native = self.device()?.format()?;
        debug!(
            %format,
            stride = native.stride,
            size = native.size,
            "V4L2 grabber configured"
        );
        Ok(())
    }

    fn request_state(&mut self, target: ControlState) -> Result<StateChange> {
        self.state = target;
        match target {
            ControlState::Running => {
                self.start_stream()?;
                self.poll_state()
            }
            ControlState::Paused => {
                self.stop_stream();
                Ok(StateChange::CannotCue)
            }
            ControlState::Stopped => {
                self.stop_stream();
                Ok(StateChange::Complete)
            }
        }
    }

    fn poll_state(&mut self) -> Result<StateChange> {
        if self.state != ControlState::Running {
            return Ok(StateChange::Complete);
        }
        let Some(streamer) = self.streamer.as_mut() else {
            return Err(CaptureError::backend("streaming thread not running"));
        };
        if streamer.started {
            return Ok(StateChange::Complete);
        }
        match streamer.ready.try_recv() {
            Ok(Ok(())) => {
                streamer.started = true;
                Ok(StateChange::Complete)
            }
            Err(TryRecvError::Empty) => Ok(StateChange::Pending),
            Ok(Err(reason)) => {
                self.stop_stream();
                Err(CaptureError::backend(reason))
            }
            Err(TryRecvError::Disconnected) => {
                self.stop_stream();
                Err(CaptureError::backend("streaming thread exited"))
            }
        }
    }

    fn health(&self) -> Arc<dyn DeviceHealth> {
        Arc::new(V4L2Health {
            path: self.path.clone().unwrap_or_default(),
            lost: Arc::clone(&self.lost),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_ids_cover_mapped_properties() {
        let unmapped: Vec<_> = PropertyKind::ALL
            .into_iter()
            .filter(|kind| control_ids(*kind).is_none())
            .collect();
        assert_eq!(unmapped, vec![PropertyKind::ColorEnable, PropertyKind::Roll]);

        let exposure = control_ids(PropertyKind::Exposure).expect("exposure mapped");
        assert_eq!(exposure.value, 0x009a_0902);
        assert_eq!(exposure.auto, Some(0x009a_0901));
    }

    #[test]
    fn test_negotiated_format_uses_driver_size() {
        let mut padded = v4l::Format::new(640, 480, v4l::FourCC::new(b"YUYV"));
        padded.size = 704 * 480 * 2;
        let format = negotiated(&padded);
        assert_eq!(format.width, 640);
        assert_eq!(format.total_bytes, 704 * 480 * 2);

        let mut mjpeg = v4l::Format::new(640, 480, v4l::FourCC::new(b"MJPG"));
        mjpeg.size = 153_600;
        let format = negotiated(&mjpeg);
        assert_eq!(format.fourcc, FourCC::MJPG);
        assert_eq!(format.total_bytes, 153_600);

        let mut unknown = v4l::Format::new(320, 240, v4l::FourCC::new(b"YUYV"));
        unknown.size = 0;
        assert_eq!(negotiated(&unknown).total_bytes, 320 * 240 * 2);
    }

    #[test]
    fn test_saturate() {
        assert_eq!(saturate(42), 42);
        assert_eq!(saturate(i64::MAX), i32::MAX);
        assert_eq!(saturate(i64::MIN), i32::MIN);
    }

    #[test]
    fn test_unopened_backend() {
        let device = V4L2Device::new();
        assert!(matches!(device.capability_count(), Err(CaptureError::NotOpen)));
        assert!(matches!(
            device.property_range(PropertyKind::Brightness),
            Err(CaptureError::NotOpen)
        ));
        assert_eq!(device.health().check(), HealthSignal::Lost);
    }
}
