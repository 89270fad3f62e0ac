//! Session configuration.
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CaptureError, Result};
use crate::format::FourCC;

/// Top-level configuration for a [`CaptureSession`](crate::CaptureSession).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Encodings the format catalog keeps. `None` keeps everything.
    #[serde(default)]
    pub allowed_encodings: Option<Vec<String>>,

    /// Frame sink tuning.
    #[serde(default)]
    pub sink: SinkConfig,

    /// Disconnection watchdog tuning.
    #[serde(default)]
    pub watchdog: WatchdogConfig,

    /// Control-surface state transition polling.
    #[serde(default)]
    pub transition: TransitionConfig,
}

/// Frame sink tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Consecutive deliveries of a new payload size tolerated before the
    /// buffer is re-sized.
    #[serde(default = "default_resize_debounce")]
    pub resize_debounce: u32,

    /// Rates below this are reported as 0 (stalled).
    #[serde(default = "default_minimum_fps")]
    pub minimum_fps: f64,

    /// Weight of the newest sample in the smoothed frame rate.
    #[serde(default = "default_fps_smoothing")]
    pub fps_smoothing: f64,
}

/// Disconnection watchdog tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Time between health checks (ms).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Time without frames after which the device is probed (ms).
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout_ms: u64,
}

/// Control-surface state transition polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionConfig {
    /// Number of polls before a pending transition is declared failed.
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Time between polls (ms).
    #[serde(default = "default_transition_interval")]
    pub interval_ms: u64,
}

// Default value functions
const fn default_resize_debounce() -> u32 {
    5
}

const fn default_minimum_fps() -> f64 {
    0.5
}

const fn default_fps_smoothing() -> f64 {
    0.1
}

const fn default_poll_interval() -> u64 {
    1_000
}

const fn default_stall_timeout() -> u64 {
    10_000
}

const fn default_attempts() -> u32 {
    20
}

const fn default_transition_interval() -> u64 {
    100
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            resize_debounce: default_resize_debounce(),
            minimum_fps: default_minimum_fps(),
            fps_smoothing: default_fps_smoothing(),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            stall_timeout_ms: default_stall_timeout(),
        }
    }
}

impl WatchdogConfig {
    /// Time between health checks.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Time without frames after which the device is probed.
    #[must_use]
    pub const fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            interval_ms: default_transition_interval(),
        }
    }
}

impl TransitionConfig {
    /// Time between polls.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl SessionConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    /// Reject values the session cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.sink.resize_debounce == 0 {
            return Err(CaptureError::Config(
                "sink.resize_debounce must be at least 1".to_owned(),
            ));
        }
        if !(self.sink.minimum_fps >= 0.0 && self.sink.minimum_fps.is_finite()) {
            return Err(CaptureError::Config(
                "sink.minimum_fps must be a finite, non-negative number".to_owned(),
            ));
        }
        if !(self.sink.fps_smoothing > 0.0 && self.sink.fps_smoothing <= 1.0) {
            return Err(CaptureError::Config(
                "sink.fps_smoothing must be in (0, 1]".to_owned(),
            ));
        }
        if self.watchdog.poll_interval_ms == 0 || self.watchdog.stall_timeout_ms == 0 {
            return Err(CaptureError::Config(
                "watchdog intervals must be non-zero".to_owned(),
            ));
        }
        if self.transition.attempts == 0 || self.transition.interval_ms == 0 {
            return Err(CaptureError::Config(
                "transition.attempts and transition.interval_ms must be non-zero".to_owned(),
            ));
        }
        self.allowed_fourccs().map(|_| ())
    }

    /// The encoding allow-list as FourCC codes.
    pub fn allowed_fourccs(&self) -> Result<Option<Vec<FourCC>>> {
        let Some(codes) = &self.allowed_encodings else {
            return Ok(None);
        };
        codes
            .iter()
            .map(|code| {
                FourCC::parse(code)
                    .ok_or_else(|| CaptureError::Config(format!("invalid encoding {code:?}")))
            })
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }
}
