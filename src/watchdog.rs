//! Disconnection watchdog.
//!
//! A detached thread polls the frame sink's timing once per interval. Stalled
//! delivery only *triggers* a device-health probe; the probe *confirms* loss.
//! On confirmed loss the user callback runs once, capture is stopped and the
//! thread exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, ThreadId};

use tracing::{debug, error, warn};

use crate::config::WatchdogConfig;
use crate::error::{CaptureError, Result};
use crate::sink::{FrameSink, SinkTiming};

/// Result of a device-health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthSignal {
    /// Device still present.
    Healthy,
    /// Device removed or unusable.
    Lost,
}

/// Out-of-band device-health probe, callable from the watchdog thread.
pub trait DeviceHealth: Send + Sync {
    /// Check whether the device is still present.
    fn check(&self) -> HealthSignal;
}

/// User disconnection callback.
pub type DisconnectCallback = Arc<dyn Fn() + Send + Sync>;

/// Action taken after the user callback when loss is confirmed.
pub type StopAction = Box<dyn FnOnce() + Send>;

/// Everything a watchdog run needs.
pub struct WatchTarget {
    /// Sink whose timing is observed.
    pub sink: Arc<FrameSink>,
    /// Confirmation probe.
    pub health: Arc<dyn DeviceHealth>,
    /// Runs after the user callback on confirmed loss.
    pub on_lost: StopAction,
}

// Per-run flags; a stopped run never resumes.
#[derive(Debug, Default)]
struct Run {
    stop: AtomicBool,
    running: AtomicBool,
    thread: OnceLock<ThreadId>,
}

impl Run {
    fn is_active(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.stop.load(Ordering::Acquire)
    }
}

/// Owner of the watchdog thread and the disconnection callback.
pub struct ConnectionWatchdog {
    config: WatchdogConfig,
    callback: Arc<Mutex<Option<DisconnectCallback>>>,
    gate: Arc<Mutex<()>>,
    run: Mutex<Option<Arc<Run>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Whether the timing heuristic warrants a health probe.
#[must_use]
pub fn is_suspicious(timing: &SinkTiming, config: &WatchdogConfig) -> bool {
    timing.since_last_frame > config.stall_timeout()
        || timing.fps == 0.0
        || timing
            .expected_interval
            .is_some_and(|interval| timing.since_last_frame >= interval * 2)
}

impl ConnectionWatchdog {
    /// Create an idle watchdog.
    #[must_use]
    pub fn new(config: WatchdogConfig) -> Self {
        Self {
            config,
            callback: Arc::new(Mutex::new(None)),
            gate: Arc::new(Mutex::new(())),
            run: Mutex::new(None),
        }
    }

    /// Install or clear the disconnection callback.
    pub fn set_callback(&self, callback: Option<DisconnectCallback>) {
        *lock(&self.callback) = callback;
    }

    /// Whether a disconnection callback is installed.
    pub fn has_callback(&self) -> bool {
        lock(&self.callback).is_some()
    }

    /// Whether a run is active.
    pub fn is_running(&self) -> bool {
        lock(&self.run)
            .as_ref()
            .is_some_and(|run| run.is_active())
    }

    /// Start a run unless one is already active. Returns whether a thread
    /// was spawned.
    pub fn ensure_running(&self, target: WatchTarget) -> Result<bool> {
        let mut current = lock(&self.run);
        if current.as_ref().is_some_and(|run| run.is_active()) {
            return Ok(false);
        }

        let run = Arc::new(Run::default());
        run.running.store(true, Ordering::Release);

        let worker = Worker {
            run: Arc::clone(&run),
            config: self.config.clone(),
            callback: Arc::clone(&self.callback),
            gate: Arc::clone(&self.gate),
            target,
        };
        thread::Builder::new()
            .name("cam-watchdog".to_owned())
            .spawn(move || worker.watch())
            .map_err(|err| {
                run.running.store(false, Ordering::Release);
                CaptureError::backend(format!("failed to spawn watchdog: {err}"))
            })?;

        debug!(
            poll_ms = self.config.poll_interval_ms,
            stall_ms = self.config.stall_timeout_ms,
            "watchdog started"
        );
        *current = Some(run);
        Ok(true)
    }

    /// Raise the stop flag of the active run without waiting for the thread.
    ///
    /// When called from any thread other than the watchdog's own, the flag is
    /// raised under the callback gate: once this returns no further callback
    /// is dispatched.
    pub fn stop(&self) {
        let Some(run) = lock(&self.run).take() else {
            return;
        };
        if run.thread.get() == Some(&thread::current().id()) {
            run.stop.store(true, Ordering::Release);
            return;
        }
        let _gate = lock(&self.gate);
        run.stop.store(true, Ordering::Release);
        debug!("watchdog stop requested");
    }
}

impl Drop for ConnectionWatchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    run: Arc<Run>,
    config: WatchdogConfig,
    callback: Arc<Mutex<Option<DisconnectCallback>>>,
    gate: Arc<Mutex<()>>,
    target: WatchTarget,
}

impl Worker {
    fn stopped(&self) -> bool {
        self.run.stop.load(Ordering::Acquire)
    }

    fn watch(self) {
        let run = Arc::clone(&self.run);
        let _ = run.thread.set(thread::current().id());
        let interval = self.config.poll_interval();
        let mut lost = false;

        loop {
            thread::sleep(interval);
            if self.stopped() {
                break;
            }

            let timing = self.target.sink.timing();
            if !is_suspicious(&timing, &self.config) {
                continue;
            }
            debug!(
                since_ms = timing.since_last_frame.as_millis(),
                fps = timing.fps,
                "frame delivery stalled; probing device"
            );
            if self.target.health.check() == HealthSignal::Lost {
                warn!("device loss confirmed");
                lost = true;
                break;
            }
        }

        if lost {
            self.disconnect();
        }
        run.running.store(false, Ordering::Release);
        debug!("watchdog exited");
    }

    fn disconnect(self) {
        {
            let _gate = lock(&self.gate);
            if self.stopped() {
                return;
            }
            let callback = lock(&self.callback).clone();
            if let Some(callback) = callback {
                callback();
            }
        }
        if self.stopped() {
            return;
        }
        error!("stopping capture after device loss");
        (self.target.on_lost)();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SinkConfig;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Probe(AtomicBool);

    impl DeviceHealth for Probe {
        fn check(&self) -> HealthSignal {
            if self.0.load(Ordering::SeqCst) {
                HealthSignal::Lost
            } else {
                HealthSignal::Healthy
            }
        }
    }

    fn fast_config() -> WatchdogConfig {
        WatchdogConfig {
            poll_interval_ms: 20,
            stall_timeout_ms: 100,
        }
    }

    fn target(lost: bool, stops: &Arc<AtomicUsize>) -> WatchTarget {
        let stops = Arc::clone(stops);
        WatchTarget {
            sink: Arc::new(FrameSink::new(&SinkConfig::default())),
            health: Arc::new(Probe(AtomicBool::new(lost))),
            on_lost: Box::new(move || {
                stops.fetch_add(1, Ordering::SeqCst);
            }),
        }
    }

    #[test]
    fn test_heuristic() {
        let config = WatchdogConfig::default();
        let healthy = SinkTiming {
            since_last_frame: Duration::from_millis(30),
            fps: 30.0,
            expected_interval: Some(Duration::from_millis(33)),
        };
        assert!(!is_suspicious(&healthy, &config));

        let no_rate = SinkTiming { fps: 0.0, ..healthy };
        assert!(is_suspicious(&no_rate, &config));

        let late = SinkTiming {
            since_last_frame: Duration::from_millis(70),
            ..healthy
        };
        assert!(is_suspicious(&late, &config));

        let timed_out = SinkTiming {
            since_last_frame: Duration::from_secs(11),
            expected_interval: None,
            ..healthy
        };
        assert!(is_suspicious(&timed_out, &config));
    }

    #[test]
    fn test_confirmed_loss_fires_once() {
        let watchdog = ConnectionWatchdog::new(fast_config());
        let calls = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            watchdog.set_callback(Some(Arc::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            })));
        }

        assert!(watchdog.ensure_running(target(true, &stops)).expect("spawn"));
        thread::sleep(Duration::from_millis(300));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert!(!watchdog.is_running());
    }

    #[test]
    fn test_stall_without_loss_keeps_running() {
        let watchdog = ConnectionWatchdog::new(fast_config());
        let stops = Arc::new(AtomicUsize::new(0));
        assert!(watchdog.ensure_running(target(false, &stops)).expect("spawn"));
        assert!(!watchdog.ensure_running(target(false, &stops)).expect("spawn"));

        thread::sleep(Duration::from_millis(150));
        assert!(watchdog.is_running());
        assert_eq!(stops.load(Ordering::SeqCst), 0);
        watchdog.stop();
        assert!(!watchdog.is_running());
    }

    #[test]
    fn test_no_callback_after_stop() {
        let watchdog = ConnectionWatchdog::new(fast_config());
        let calls = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            watchdog.set_callback(Some(Arc::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            })));
        }
        watchdog.ensure_running(target(true, &stops)).expect("spawn");
        watchdog.stop();

        thread::sleep(Duration::from_millis(150));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(stops.load(Ordering::SeqCst), 0);
    }
}
