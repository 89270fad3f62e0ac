//! Capture session facade.
//!
//! A [`CaptureSession`] owns one backend and drives it through
//! `Closed -> Open -> Capturing -> Open -> Closed`. Pipeline, format catalog
//! and property bank live behind one control mutex; the frame sink has its own
//! lock so frame delivery never waits on control operations.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;

use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::descriptor::{DeviceDescriptor, DeviceSelector};
use crate::error::{CaptureError, Result};
use crate::format::{FormatCatalog, FourCC, VideoFormat};
use crate::pipeline::Pipeline;
use crate::platform::{Platform, PlatformLease};
use crate::property::{PropertyBank, PropertyDescriptor, PropertyKind};
use crate::sink::{Frame, FrameMetadata, FrameSink, PayloadSize, SampleCallback};
use crate::traits::{CaptureBackend, ControlState, StageContext, StateChange};
use crate::watchdog::{ConnectionWatchdog, DeviceHealth, WatchTarget};

/// Externally visible session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No device open.
    Closed,
    /// Device open, not streaming.
    Open,
    /// Frames are being delivered.
    Capturing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::Capturing => "capturing",
        })
    }
}

struct Control {
    pipeline: Pipeline,
    device: Option<DeviceDescriptor>,
    catalog: FormatCatalog,
    properties: PropertyBank,
    format: VideoFormat,
    format_index: Option<usize>,
}

impl Control {
    fn reset(&mut self) {
        self.pipeline.teardown();
        self.device = None;
        self.catalog.clear();
        self.properties.clear();
        self.format = VideoFormat::empty();
        self.format_index = None;
    }
}

struct Shared {
    config: SessionConfig,
    allowed: Option<Vec<FourCC>>,
    control: Mutex<Control>,
    sink: Arc<FrameSink>,
    watchdog: ConnectionWatchdog,
    open: AtomicBool,
    capturing: AtomicBool,
    last_error: Mutex<Option<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn control(&self) -> MutexGuard<'_, Control> {
        lock(&self.control)
    }

    fn track<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            debug!(error = %err, "session operation failed");
            *lock(&self.last_error) = Some(err.to_string());
        }
        result
    }

    fn require_open(&self) -> Result<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(CaptureError::NotOpen)
        }
    }

    fn require_capturing(&self) -> Result<()> {
        self.require_open()?;
        if self.capturing.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(CaptureError::NotCapturing)
        }
    }

    /// Request `target` and poll until it settles.
    fn transition(
        &self,
        backend: &mut dyn CaptureBackend,
        target: ControlState,
        tolerate_cannot_cue: bool,
    ) -> Result<()> {
        let attempts = self.config.transition.attempts;
        let mut change = backend.request_state(target)?;
        for _ in 0..attempts {
            if change != StateChange::Pending {
                break;
            }
            thread::sleep(self.config.transition.interval());
            change = backend.poll_state()?;
        }
        match change {
            StateChange::Complete => Ok(()),
            StateChange::CannotCue if tolerate_cannot_cue => {
                debug!(state = %target, "source cannot cue data while paused");
                Ok(())
            }
            StateChange::CannotCue => Err(CaptureError::backend(format!(
                "{target} transition reported cannot cue"
            ))),
            StateChange::Pending => Err(CaptureError::TransitionTimeout {
                target: target.name(),
                attempts,
            }),
        }
    }

    /// Derive the grabber payload from the negotiated format and re-arm the
    /// sink for it.
    fn configure_grabber(&self, control: &mut Control, format: VideoFormat) -> Result<()> {
        control.pipeline.backend_mut().configure_grabber(&format)?;
        self.sink
            .arm(format.total_bytes as usize, PayloadSize::for_encoding(format.fourcc));
        control.format_index = control.catalog.index_of(&format);
        control.format = format;
        Ok(())
    }

    fn open(&self, selector: &DeviceSelector, format: Option<&VideoFormat>) -> Result<()> {
        if self.open.load(Ordering::Acquire) {
            return Err(CaptureError::AlreadyOpen);
        }
        let mut control = self.control();
        if self.open.load(Ordering::Acquire) {
            return Err(CaptureError::AlreadyOpen);
        }

        let result = self.open_locked(&mut control, selector, format);
        match &result {
            Ok(()) => {
                self.open.store(true, Ordering::Release);
                info!(
                    device = %selector,
                    format = %control.format,
                    formats = control.catalog.len(),
                    "capture session opened"
                );
            }
            Err(err) => {
                warn!(device = %selector, error = %err, "open failed; pipeline released");
                control.reset();
                self.sink.disarm();
            }
        }
        result
    }

    fn open_locked(
        &self,
        control: &mut Control,
        selector: &DeviceSelector,
        requested: Option<&VideoFormat>,
    ) -> Result<()> {
        let devices = control.pipeline.backend().enumerate()?;
        let device = selector.resolve(&devices)?;

        let context = StageContext {
            device: &device,
            callback: Arc::clone(&self.sink) as Arc<dyn SampleCallback>,
        };
        control.pipeline.assemble(&context)?;

        control
            .catalog
            .import(control.pipeline.backend().format_source(), self.allowed.as_deref())?;
        if let Err(err) = control
            .properties
            .refresh(control.pipeline.backend().property_control())
        {
            warn!(error = %err, "some properties could not be imported");
        }

        let format = match requested {
            Some(requested) => {
                let Some(entry) = control.catalog.resolve(requested).cloned() else {
                    warn!(format = %requested, "requested format not offered by the device");
                    return Err(CaptureError::FormatNotSupported(requested.clone()));
                };
                control.pipeline.backend_mut().apply_format(&entry)?;
                entry
            }
            None => control.pipeline.backend().current_format()?,
        };

        self.sink
            .set_minimum_fps(device.minimum_fps.unwrap_or(self.config.sink.minimum_fps));
        self.configure_grabber(control, format)?;
        control.device = Some(device);
        Ok(())
    }

    fn close(&self) {
        self.watchdog.stop();
        let mut control = self.control();
        if !self.open.load(Ordering::Acquire) {
            return;
        }
        if self.capturing.swap(false, Ordering::AcqRel) {
            let backend = control.pipeline.backend_mut();
            if let Err(err) = self.transition(backend, ControlState::Stopped, true) {
                warn!(error = %err, "stop during close failed");
            }
        }
        control.reset();
        self.sink.disarm();
        self.open.store(false, Ordering::Release);
        info!("capture session closed");
    }

    fn start(self: &Arc<Self>) -> Result<()> {
        let health = {
            let mut control = self.control();
            self.require_open()?;
            if self.capturing.load(Ordering::Acquire) {
                return Ok(());
            }

            let format = control.pipeline.backend().current_format()?;
            self.configure_grabber(&mut control, format)?;
            self.transition(control.pipeline.backend_mut(), ControlState::Running, false)?;
            self.capturing.store(true, Ordering::Release);
            info!(format = %control.format, "capture started");
            control.pipeline.backend().health()
        };
        self.ensure_watchdog(health)
    }

    fn stop(&self) -> Result<()> {
        let result = self.stop_locked(&mut self.control());
        self.watchdog.stop();
        result
    }

    fn stop_locked(&self, control: &mut Control) -> Result<()> {
        self.require_capturing()?;
        // Capture counts as stopped even when the device refuses.
        self.capturing.store(false, Ordering::Release);
        self.halt(control.pipeline.backend_mut())?;
        info!("capture stopped");
        Ok(())
    }

    /// Pause, then stop the control surface.
    fn halt(&self, backend: &mut dyn CaptureBackend) -> Result<()> {
        self.transition(backend, ControlState::Paused, true)?;
        self.transition(backend, ControlState::Stopped, false)
    }

    fn ensure_watchdog(self: &Arc<Self>, health: Arc<dyn DeviceHealth>) -> Result<()> {
        if !self.watchdog.has_callback() || !self.capturing.load(Ordering::Acquire) {
            return Ok(());
        }
        let session: Weak<Self> = Arc::downgrade(self);
        self.watchdog
            .ensure_running(WatchTarget {
                sink: Arc::clone(&self.sink),
                health,
                on_lost: Box::new(move || {
                    if let Some(session) = session.upgrade() {
                        let result = session.stop();
                        if let Err(err) = session.track(result) {
                            warn!(error = %err, "stop after device loss failed");
                        }
                    }
                }),
            })
            .map(|_| ())
    }

    fn set_format(&self, format: &VideoFormat) -> Result<()> {
        let (result, halted) = self.set_format_locked(&mut self.control(), format);
        if halted {
            self.watchdog.stop();
        }
        result
    }

    /// Returns whether capture was halted without being restarted.
    fn set_format_locked(
        &self,
        control: &mut Control,
        format: &VideoFormat,
    ) -> (Result<()>, bool) {
        if let Err(err) = self.require_open() {
            return (Err(err), false);
        }
        if let Err(err) = control
            .catalog
            .import(control.pipeline.backend().format_source(), self.allowed.as_deref())
        {
            return (Err(err), false);
        }
        let Some(entry) = control.catalog.resolve(format).cloned() else {
            return (Err(CaptureError::FormatNotSupported(format.clone())), false);
        };

        let capturing = self.capturing.load(Ordering::Acquire);
        if capturing {
            if let Err(err) = self.halt(control.pipeline.backend_mut()) {
                // Capture counts as stopped even when the device refuses.
                self.capturing.store(false, Ordering::Release);
                return (Err(err), true);
            }
        }

        let result = self.reconfigure(control, entry, capturing);
        match result {
            Ok(()) => {
                info!(format = %control.format, "format changed");
                (Ok(()), false)
            }
            Err(err) if capturing => {
                // The device is stopped; capture does not resume.
                self.capturing.store(false, Ordering::Release);
                let backend = control.pipeline.backend_mut();
                if let Err(stop_err) = self.transition(backend, ControlState::Stopped, false) {
                    warn!(error = %stop_err, "stop after failed format change failed");
                }
                warn!(error = %err, "format change failed; capture stopped");
                (Err(err), true)
            }
            Err(err) => (Err(err), false),
        }
    }

    fn reconfigure(&self, control: &mut Control, entry: VideoFormat, restart: bool) -> Result<()> {
        control.pipeline.backend_mut().apply_format(&entry)?;
        self.configure_grabber(control, entry)?;
        if restart {
            self.transition(control.pipeline.backend_mut(), ControlState::Running, false)?;
        }
        Ok(())
    }

    fn set_format_index(&self, index: usize) -> Result<()> {
        let format = {
            let control = self.control();
            self.require_open()?;
            control
                .catalog
                .get(index)
                .cloned()
                .ok_or(CaptureError::FormatIndex {
                    index,
                    len: control.catalog.len(),
                })?
        };
        self.set_format(&format)
    }
}

/// One capture device session.
///
/// Every method takes `&self`; the session can be shared between the thread
/// that controls it and the threads that read frames.
pub struct CaptureSession {
    shared: Arc<Shared>,
    _platform: PlatformLease,
}

impl CaptureSession {
    /// Create a closed session over `backend`.
    pub fn new(
        platform: &Platform,
        backend: Box<dyn CaptureBackend>,
        config: SessionConfig,
    ) -> Result<Self> {
        config.validate()?;
        let allowed = config.allowed_fourccs()?;
        debug!(backend = backend.name(), "capture session created");
        Ok(Self {
            shared: Arc::new(Shared {
                allowed,
                control: Mutex::new(Control {
                    pipeline: Pipeline::new(backend),
                    device: None,
                    catalog: FormatCatalog::new(),
                    properties: PropertyBank::new(),
                    format: VideoFormat::empty(),
                    format_index: None,
                }),
                sink: Arc::new(FrameSink::new(&config.sink)),
                watchdog: ConnectionWatchdog::new(config.watchdog.clone()),
                open: AtomicBool::new(false),
                capturing: AtomicBool::new(false),
                last_error: Mutex::new(None),
                config,
            }),
            _platform: platform.lease(),
        })
    }

    /// Devices the backend can open.
    pub fn devices(&self) -> Result<Vec<DeviceDescriptor>> {
        let result = self.shared.control().pipeline.backend().enumerate();
        self.shared.track(result)
    }

    /// Open a device, optionally in a specific format.
    ///
    /// The requested format must be offered by the device; otherwise the
    /// open fails with [`CaptureError::FormatNotSupported`] and nothing stays
    /// built. Without a requested format the device's current one is used.
    pub fn open<S: Into<DeviceSelector>>(
        &self,
        selector: S,
        format: Option<&VideoFormat>,
    ) -> Result<()> {
        let selector = selector.into();
        let result = self.shared.open(&selector, format);
        self.shared.track(result)
    }

    /// Stop capture if running and release the pipeline in reverse
    /// construction order. Closing a closed session does nothing.
    ///
    /// Does not wait for the watchdog thread, but no disconnection callback
    /// is dispatched once this returns.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Start frame delivery.
    pub fn start(&self) -> Result<()> {
        let result = self.shared.start();
        self.shared.track(result)
    }

    /// Stop frame delivery.
    pub fn stop(&self) -> Result<()> {
        let result = self.shared.stop();
        self.shared.track(result)
    }

    /// Whether a device is open.
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    /// Whether frames are being delivered.
    pub fn is_capturing(&self) -> bool {
        self.shared.capturing.load(Ordering::Acquire)
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        if self.is_capturing() {
            SessionState::Capturing
        } else if self.is_open() {
            SessionState::Open
        } else {
            SessionState::Closed
        }
    }

    /// Copy the latest frame into `out`, which must hold at least
    /// [`frame_total_size`](Self::frame_total_size) bytes.
    pub fn read_frame(&self, out: &mut [u8]) -> Result<FrameMetadata> {
        let result = self
            .shared
            .require_capturing()
            .and_then(|()| self.shared.sink.read_frame(out));
        self.shared.track(result)
    }

    /// Copy the latest frame into a new allocation.
    pub fn grab_frame(&self) -> Result<Frame> {
        let result = self
            .shared
            .require_capturing()
            .map(|()| self.shared.sink.grab_frame());
        self.shared.track(result)
    }

    /// Delivery rate, 0 when stalled or not capturing.
    pub fn fps(&self) -> f64 {
        if self.is_capturing() {
            self.shared.sink.fps()
        } else {
            0.0
        }
    }

    /// Size of the frame buffer in bytes.
    pub fn frame_total_size(&self) -> usize {
        if self.is_open() {
            self.shared.sink.buffer_size()
        } else {
            0
        }
    }

    /// Pixel encoding of delivered frames.
    pub fn frame_type(&self) -> Option<FourCC> {
        let control = self.shared.control();
        (!control.format.is_empty()).then_some(control.format.fourcc)
    }

    /// Formats the open device offers, ordered by resolution.
    pub fn formats(&self) -> Vec<VideoFormat> {
        self.shared.control().catalog.as_slice().to_vec()
    }

    /// Negotiated format.
    pub fn current_format(&self) -> Option<VideoFormat> {
        let control = self.shared.control();
        (!control.format.is_empty()).then(|| control.format.clone())
    }

    /// Catalog position of the negotiated format.
    pub fn current_format_index(&self) -> Option<usize> {
        self.shared.control().format_index
    }

    /// Switch to `format`, validated against a fresh catalog import. A running
    /// capture is stopped and restarted around the change.
    pub fn set_format(&self, format: &VideoFormat) -> Result<()> {
        let result = self.shared.set_format(format);
        self.shared.track(result)
    }

    /// Switch to the catalog entry at `index`.
    pub fn set_format_index(&self, index: usize) -> Result<()> {
        let result = self.shared.set_format_index(index);
        self.shared.track(result)
    }

    /// Snapshot of the property bank.
    pub fn properties(&self) -> PropertyBank {
        self.shared.control().properties.clone()
    }

    /// Snapshot of one property.
    pub fn property(&self, kind: PropertyKind) -> PropertyDescriptor {
        self.shared.control().properties.get(kind).clone()
    }

    /// Validate and apply a property value.
    pub fn set_property(&self, kind: PropertyKind, value: i32, auto: bool) -> Result<()> {
        let result = self.shared.require_open().and_then(|()| {
            let mut control = self.shared.control();
            let control = &mut *control;
            control.properties.set(
                kind,
                Some(control.pipeline.backend_mut().property_control_mut()),
                value,
                auto,
            )
        });
        self.shared.track(result)
    }

    /// Apply every supported property's default.
    pub fn reset_properties(&self, as_auto: bool) -> Result<()> {
        let result = self.shared.require_open().and_then(|()| {
            let mut control = self.shared.control();
            let control = &mut *control;
            control.properties.reset_to_default(
                Some(control.pipeline.backend_mut().property_control_mut()),
                as_auto,
            )
        });
        self.shared.track(result)
    }

    /// Re-import every property from the device.
    pub fn refresh_properties(&self) -> Result<()> {
        let result = self.shared.require_open().and_then(|()| {
            let mut control = self.shared.control();
            let control = &mut *control;
            control
                .properties
                .refresh(control.pipeline.backend().property_control())
        });
        self.shared.track(result)
    }

    /// Install the callback run once when the device is lost during capture.
    /// Capture is stopped right after it returns.
    pub fn set_disconnection_callback<F>(&self, callback: F) -> Result<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.watchdog.set_callback(Some(Arc::new(callback)));
        if !self.is_capturing() {
            return Ok(());
        }
        let health = self.shared.control().pipeline.backend().health();
        let result = self.shared.ensure_watchdog(health);
        self.shared.track(result)
    }

    /// Remove the disconnection callback and stop watching.
    pub fn clear_disconnection_callback(&self) {
        self.shared.watchdog.stop();
        self.shared.watchdog.set_callback(None);
    }

    /// Message of the most recent failure.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.shared.last_error).clone()
    }

    /// Descriptor of the open device.
    pub fn device(&self) -> Option<DeviceDescriptor> {
        self.shared.control().device.clone()
    }

    /// Settings this session was built with.
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.shared.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedDevice;

    fn session() -> CaptureSession {
        let platform = Platform::initialize();
        CaptureSession::new(
            &platform,
            Box::new(SimulatedDevice::new()),
            SessionConfig::default(),
        )
        .expect("session")
    }

    #[test]
    fn test_operations_require_open() {
        let session = session();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(session.start(), Err(CaptureError::NotOpen)));
        assert!(matches!(session.stop(), Err(CaptureError::NotOpen)));
        assert!(matches!(
            session.set_property(PropertyKind::Brightness, 10, false),
            Err(CaptureError::NotOpen)
        ));
        assert_eq!(session.last_error().as_deref(), Some("session is not open"));
        assert_eq!(session.frame_total_size(), 0);
        assert!(session.current_format().is_none());
    }

    #[test]
    fn test_read_requires_capture() {
        let session = session();
        session.open(0, None).expect("open");
        let mut out = vec![0; session.frame_total_size()];
        assert!(matches!(
            session.read_frame(&mut out),
            Err(CaptureError::NotCapturing)
        ));
        assert!(matches!(session.stop(), Err(CaptureError::NotCapturing)));
    }

    #[test]
    fn test_open_populates_catalog_and_properties() {
        let session = session();
        session.open("Simulated Camera", None).expect("open");

        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(session.formats().len(), 3);
        assert_eq!(
            session.current_format(),
            Some(VideoFormat::new(640, 480, FourCC::YUYV))
        );
        assert!(session.current_format_index().is_some());
        assert_eq!(session.frame_total_size(), 640 * 480 * 2);
        assert_eq!(session.frame_type(), Some(FourCC::YUYV));
        assert_eq!(session.property(PropertyKind::Exposure).value(), -6);
        assert!(!session.property(PropertyKind::Zoom).is_supported());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let platform = Platform::initialize();
        let mut config = SessionConfig::default();
        config.transition.attempts = 0;
        assert!(matches!(
            CaptureSession::new(&platform, Box::new(SimulatedDevice::new()), config),
            Err(CaptureError::Config(_))
        ));
    }

    #[test]
    fn test_session_holds_platform_lease() {
        let platform = Platform::initialize();
        let session = CaptureSession::new(
            &platform,
            Box::new(SimulatedDevice::new()),
            SessionConfig::default(),
        )
        .expect("session");
        assert_eq!(platform.session_count(), 1);
        drop(session);
        assert_eq!(platform.session_count(), 0);
    }
}
