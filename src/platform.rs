//! Process-wide capture platform handle.
//!
//! The application creates one [`Platform`] and passes it to every session it
//! builds. Sessions hold a [`PlatformLease`], so the handle outlives them and
//! reports how many are alive.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

#[derive(Debug)]
struct PlatformInner {
    sessions: AtomicUsize,
}

impl Drop for PlatformInner {
    fn drop(&mut self) {
        info!("capture platform released");
    }
}

/// Reference-counted platform handle. Clones share one platform.
#[derive(Debug, Clone)]
pub struct Platform {
    inner: Arc<PlatformInner>,
}

impl Platform {
    /// Initialize the platform layer.
    #[must_use]
    pub fn initialize() -> Self {
        info!("capture platform initialized");
        Self {
            inner: Arc::new(PlatformInner {
                sessions: AtomicUsize::new(0),
            }),
        }
    }

    /// Sessions currently holding a lease.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.sessions.load(Ordering::Acquire)
    }

    /// Number of live handles, leases included.
    #[must_use]
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub(crate) fn lease(&self) -> PlatformLease {
        let count = self.inner.sessions.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(sessions = count, "platform lease acquired");
        PlatformLease {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// A session's hold on the platform.
#[derive(Debug)]
pub struct PlatformLease {
    inner: Arc<PlatformInner>,
}

impl Drop for PlatformLease {
    fn drop(&mut self) {
        let count = self.inner.sessions.fetch_sub(1, Ordering::AcqRel) - 1;
        debug!(sessions = count, "platform lease released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leases_are_counted() {
        let platform = Platform::initialize();
        assert_eq!(platform.session_count(), 0);

        let first = platform.lease();
        let second = platform.clone().lease();
        assert_eq!(platform.session_count(), 2);
        assert_eq!(platform.handle_count(), 3);

        drop(first);
        assert_eq!(platform.session_count(), 1);
        drop(second);
        assert_eq!(platform.session_count(), 0);
        assert_eq!(platform.handle_count(), 1);
    }

    #[test]
    fn test_lease_outlives_application_handle() {
        let platform = Platform::initialize();
        let lease = platform.lease();
        drop(platform);
        assert_eq!(lease.inner.sessions.load(Ordering::Acquire), 1);
    }
}
