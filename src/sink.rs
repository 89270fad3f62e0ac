//! Frame sink: the target of the hardware frame callback.
//!
//! The backend's delivery thread calls [`SampleCallback::on_sample`] for every
//! payload; the consumer copies the latest frame out with
//! [`FrameSink::read_frame`] or [`FrameSink::grab_frame`]. Both sides meet
//! under a single mutex that is held only for the duration of a copy.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::SinkConfig;
use crate::error::{CaptureError, Result};
use crate::format::FourCC;

/// Receiver of raw payloads, invoked from the backend's delivery thread.
///
/// Implementations must return quickly; the delivery thread is owned by the
/// driver.
pub trait SampleCallback: Send + Sync {
    /// Handle one delivered payload.
    fn on_sample(&self, payload: &[u8]);
}

/// Lifecycle of the sink buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    /// No buffer allocated.
    Unarmed,
    /// Buffer allocated, waiting for the first accepted payload.
    Armed,
    /// At least one payload accepted.
    Receiving,
}

/// How payload sizes relate to the armed buffer size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadSize {
    /// Every payload fills the buffer exactly (uncompressed encodings).
    Exact,
    /// Payloads vary per frame up to the buffer size (compressed encodings).
    Bounded,
}

impl PayloadSize {
    /// Payload behavior of `fourcc`.
    #[must_use]
    pub const fn for_encoding(fourcc: FourCC) -> Self {
        if fourcc.is_compressed() {
            Self::Bounded
        } else {
            Self::Exact
        }
    }
}

/// Metadata for a captured frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Frame index; 0 until the first payload is accepted, then wraps to 1.
    pub index: u32,
    /// Bytes of valid frame data.
    pub bytes_used: usize,
    /// When the payload was accepted.
    pub captured_at: Option<Instant>,
}

/// A captured video frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Raw frame data, laid out per the negotiated format.
    pub data: Vec<u8>,
    /// Frame metadata.
    pub metadata: FrameMetadata,
}

/// Delivery timing as seen by the disconnection watchdog.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SinkTiming {
    /// Time since the last accepted payload, or since arming.
    pub since_last_frame: Duration,
    /// Frame rate as reported by [`FrameSink::fps`].
    pub fps: f64,
    /// Inter-frame interval implied by the smoothed rate, if any.
    pub expected_interval: Option<Duration>,
}

#[derive(Debug)]
struct FrameBuffer {
    data: Vec<u8>,
    used: usize,
    payload: PayloadSize,
    frame_index: u32,
    last_capture: Option<Instant>,
    armed_at: Instant,
    measured_fps: f64,
    smoothed_fps: f64,
    minimum_fps: f64,
    pending_size: usize,
    pending_count: u32,
}

impl FrameBuffer {
    fn resize(&mut self, size: usize) {
        self.data = vec![0; size];
        self.used = match self.payload {
            PayloadSize::Exact => size,
            PayloadSize::Bounded => 0,
        };
        self.pending_size = 0;
        self.pending_count = 0;
    }

    fn frame(&self) -> &[u8] {
        self.data.get(..self.used).unwrap_or(&self.data)
    }

    fn since_last_frame(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_capture.unwrap_or(self.armed_at))
    }

    fn accept(&mut self, payload: &[u8], now: Instant, smoothing: f64) {
        let Some(target) = self.data.get_mut(..payload.len()) else {
            return;
        };
        target.copy_from_slice(payload);
        self.used = payload.len();
        self.frame_index = if self.frame_index == u32::MAX {
            1
        } else {
            self.frame_index + 1
        };
        if let Some(last) = self.last_capture {
            let elapsed = now.saturating_duration_since(last).as_secs_f64();
            if elapsed > 0.0 {
                let measured = 1.0 / elapsed;
                self.measured_fps = measured;
                self.smoothed_fps = if self.smoothed_fps > 0.0 {
                    smoothing.mul_add(measured - self.smoothed_fps, self.smoothed_fps)
                } else {
                    measured
                };
            }
        }
        self.last_capture = Some(now);
        self.pending_size = 0;
        self.pending_count = 0;
    }

    fn inferred_fps(&self, now: Instant) -> f64 {
        self.last_capture.map_or(0.0, |last| {
            let elapsed = now.saturating_duration_since(last).as_secs_f64();
            if elapsed > 0.0 {
                1.0 / elapsed
            } else {
                f64::INFINITY
            }
        })
    }

    fn reported_fps(&self, now: Instant) -> f64 {
        if self.last_capture.is_none() {
            return 0.0;
        }
        if self.inferred_fps(now) < self.minimum_fps || self.smoothed_fps < self.minimum_fps {
            return 0.0;
        }
        self.smoothed_fps
    }
}

/// Shared frame buffer with index counter and frame-rate estimate.
#[derive(Debug)]
pub struct FrameSink {
    buffer: Mutex<FrameBuffer>,
    resize_debounce: u32,
    fps_smoothing: f64,
}

impl FrameSink {
    /// Create an unarmed sink.
    #[must_use]
    pub fn new(config: &SinkConfig) -> Self {
        Self {
            buffer: Mutex::new(FrameBuffer {
                data: Vec::new(),
                used: 0,
                payload: PayloadSize::Exact,
                frame_index: 0,
                last_capture: None,
                armed_at: Instant::now(),
                measured_fps: 0.0,
                smoothed_fps: 0.0,
                minimum_fps: config.minimum_fps,
                pending_size: 0,
                pending_count: 0,
            }),
            resize_debounce: config.resize_debounce,
            fps_smoothing: config.fps_smoothing,
        }
    }

    fn lock(&self) -> MutexGuard<'_, FrameBuffer> {
        // Every critical section is a plain copy, the data stays consistent.
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reallocate the buffer to `size` bytes, zero filled.
    pub fn set_buffer_size(&self, size: usize) {
        self.lock().resize(size);
    }

    /// Size the buffer for a new capture run and restart rate tracking.
    ///
    /// With [`PayloadSize::Bounded`], `size` is the largest payload expected;
    /// smaller payloads are accepted as they come.
    pub fn arm(&self, size: usize, payload: PayloadSize) {
        {
            let mut buffer = self.lock();
            buffer.payload = payload;
            buffer.last_capture = None;
            buffer.armed_at = Instant::now();
            buffer.measured_fps = 0.0;
            buffer.smoothed_fps = 0.0;
        }
        self.set_buffer_size(size);
        debug!(size, ?payload, "frame sink armed");
    }

    /// Release the buffer.
    pub fn disarm(&self) {
        let mut buffer = self.lock();
        buffer.resize(0);
        buffer.last_capture = None;
        buffer.measured_fps = 0.0;
        buffer.smoothed_fps = 0.0;
    }

    /// Rates below `minimum_fps` are reported as 0.
    pub fn set_minimum_fps(&self, minimum_fps: f64) {
        self.lock().minimum_fps = minimum_fps.max(0.0);
    }

    /// Handle one delivered payload.
    ///
    /// A payload of the current buffer size is copied in and advances the
    /// frame index. Payloads of any other size are dropped; once more than
    /// `resize_debounce` consecutive payloads share a new size the buffer is
    /// re-sized to it. A bounded sink accepts every payload and grows when
    /// one exceeds the buffer.
    pub fn deliver(&self, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut buffer = self.lock();

        if buffer.payload == PayloadSize::Bounded {
            if payload.len() > buffer.data.len() {
                info!(
                    from = buffer.data.len(),
                    to = payload.len(),
                    "payload exceeds bound; growing frame buffer"
                );
                buffer.resize(payload.len());
            }
            buffer.accept(payload, now, self.fps_smoothing);
            return;
        }

        if payload.len() == buffer.data.len() {
            buffer.accept(payload, now, self.fps_smoothing);
            return;
        }

        if payload.len() == buffer.pending_size {
            buffer.pending_count = buffer.pending_count.saturating_add(1);
        } else {
            buffer.pending_size = payload.len();
            buffer.pending_count = 1;
        }

        if buffer.pending_count > self.resize_debounce {
            info!(
                from = buffer.data.len(),
                to = payload.len(),
                "payload size changed; re-sizing frame buffer"
            );
            buffer.resize(payload.len());
        }
    }

    /// Copy the current frame into `out`.
    pub fn read_frame(&self, out: &mut [u8]) -> Result<FrameMetadata> {
        let buffer = self.lock();
        let frame = buffer.frame();
        let size = frame.len();
        let Some(target) = out.get_mut(..size) else {
            return Err(CaptureError::BufferTooSmall {
                required: size,
                provided: out.len(),
            });
        };
        target.copy_from_slice(frame);
        Ok(FrameMetadata {
            index: buffer.frame_index,
            bytes_used: size,
            captured_at: buffer.last_capture,
        })
    }

    /// Copy the current frame into a new allocation.
    pub fn grab_frame(&self) -> Frame {
        let buffer = self.lock();
        let data = buffer.frame().to_vec();
        Frame {
            metadata: FrameMetadata {
                index: buffer.frame_index,
                bytes_used: data.len(),
                captured_at: buffer.last_capture,
            },
            data,
        }
    }

    /// Smoothed frame rate, or 0 when either the rate implied by the time
    /// since the last frame or the smoothed rate is below the minimum.
    ///
    /// A legitimately slow device and a stalled one look the same here; the
    /// minimum is the contract that tells them apart.
    pub fn fps(&self) -> f64 {
        self.lock().reported_fps(Instant::now())
    }

    /// Rate computed from the last two accepted payloads.
    pub fn measured_fps(&self) -> f64 {
        self.lock().measured_fps
    }

    /// Index of the most recently accepted payload.
    pub fn frame_index(&self) -> u32 {
        self.lock().frame_index
    }

    /// Current buffer size in bytes; the payload bound for bounded sinks.
    pub fn buffer_size(&self) -> usize {
        self.lock().data.len()
    }

    /// Lifecycle state.
    pub fn state(&self) -> SinkState {
        let buffer = self.lock();
        if buffer.data.is_empty() {
            SinkState::Unarmed
        } else if buffer.last_capture.is_none() {
            SinkState::Armed
        } else {
            SinkState::Receiving
        }
    }

    /// Time since the last accepted payload, or since arming.
    pub fn time_since_last_frame(&self) -> Duration {
        self.lock().since_last_frame(Instant::now())
    }

    /// Timing snapshot taken under one lock.
    pub fn timing(&self) -> SinkTiming {
        let now = Instant::now();
        let buffer = self.lock();
        SinkTiming {
            since_last_frame: buffer.since_last_frame(now),
            fps: buffer.reported_fps(now),
            expected_interval: (buffer.smoothed_fps > 0.0)
                .then(|| Duration::from_secs_f64(1.0 / buffer.smoothed_fps)),
        }
    }

    #[cfg(test)]
    fn force_frame_index(&self, index: u32) {
        self.lock().frame_index = index;
    }
}

impl SampleCallback for FrameSink {
    fn on_sample(&self, payload: &[u8]) {
        self.deliver(payload);
    }
}
