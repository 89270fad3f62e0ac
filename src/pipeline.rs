//! Ordered pipeline assembly over a capture backend.
//!
//! Stages are built in [`Stage::ORDER`] and recorded on a stack. Teardown pops
//! the stack, so release order is always the exact reverse of construction,
//! whether it runs after a failed build, on close, or on drop.

use std::fmt;

use tracing::{debug, warn};

use crate::error::{CaptureError, Result};
use crate::traits::{CaptureBackend, StageContext};

/// One step of pipeline construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Graph container holding every other stage.
    Graph,
    /// Control surface that runs, pauses and stops the graph.
    Control,
    /// Device source node.
    Source,
    /// Sample grabber node that hands payloads to application memory.
    Grabber,
    /// Registration of the frame callback on the grabber.
    Callback,
    /// Terminal sink node; connecting it completes the pipeline.
    Terminal,
}

impl Stage {
    /// Construction order.
    pub const ORDER: [Self; 6] = [
        Self::Graph,
        Self::Control,
        Self::Source,
        Self::Grabber,
        Self::Callback,
        Self::Terminal,
    ];

    /// Description used in setup error messages.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Graph => "create capture graph",
            Self::Control => "acquire media control",
            Self::Source => "open capture device",
            Self::Grabber => "create sample grabber",
            Self::Callback => "register frame callback",
            Self::Terminal => "connect terminal sink",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// A backend together with the stack of stages built on it.
pub struct Pipeline {
    backend: Box<dyn CaptureBackend>,
    built: Vec<Stage>,
}

impl Pipeline {
    /// Wrap a backend; nothing is built yet.
    #[must_use]
    pub fn new(backend: Box<dyn CaptureBackend>) -> Self {
        Self {
            backend,
            built: Vec::with_capacity(Stage::ORDER.len()),
        }
    }

    /// Build every stage in order. On the first failure everything built so
    /// far is released and the error names the failing step.
    pub fn assemble(&mut self, context: &StageContext<'_>) -> Result<()> {
        if !self.built.is_empty() {
            self.teardown();
        }
        for stage in Stage::ORDER {
            debug!(backend = self.backend.name(), %stage, "building stage");
            if let Err(err) = self.backend.build_stage(stage, context) {
                warn!(backend = self.backend.name(), %stage, error = %err, "stage failed");
                self.teardown();
                return Err(match err {
                    setup @ CaptureError::Setup { .. } => setup,
                    other => CaptureError::setup(stage.description(), other),
                });
            }
            self.built.push(stage);
        }
        Ok(())
    }

    /// Release every built stage in reverse construction order.
    pub fn teardown(&mut self) {
        while let Some(stage) = self.built.pop() {
            debug!(backend = self.backend.name(), %stage, "releasing stage");
            self.backend.release_stage(stage);
        }
    }

    /// Whether every stage is built.
    #[must_use]
    pub fn is_assembled(&self) -> bool {
        self.built.len() == Stage::ORDER.len()
    }

    /// Stages currently built, in construction order.
    #[must_use]
    pub fn built(&self) -> &[Stage] {
        &self.built
    }

    /// Shared access to the backend.
    #[must_use]
    pub fn backend(&self) -> &dyn CaptureBackend {
        self.backend.as_ref()
    }

    /// Exclusive access to the backend.
    pub fn backend_mut(&mut self) -> &mut dyn CaptureBackend {
        self.backend.as_mut()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SinkConfig;
    use crate::descriptor::DeviceDescriptor;
    use crate::simulated::SimulatedDevice;
    use crate::sink::FrameSink;
    use std::sync::Arc;

    fn context(device: &DeviceDescriptor) -> StageContext<'_> {
        StageContext {
            device,
            callback: Arc::new(FrameSink::new(&SinkConfig::default())),
        }
    }

    #[test]
    fn test_teardown_reverses_construction() {
        let simulated = SimulatedDevice::new();
        let handle = simulated.handle();
        let device = handle.descriptor();
        let mut pipeline = Pipeline::new(Box::new(simulated));

        pipeline.assemble(&context(&device)).expect("assemble failed");
        assert!(pipeline.is_assembled());
        handle.clear_events();

        pipeline.teardown();
        assert_eq!(
            handle.released_stages(),
            vec![
                Stage::Terminal,
                Stage::Callback,
                Stage::Grabber,
                Stage::Source,
                Stage::Control,
                Stage::Graph
            ]
        );
        assert!(pipeline.built().is_empty());
    }

    #[test]
    fn test_failed_stage_releases_only_built_stages() {
        let simulated = SimulatedDevice::new();
        let handle = simulated.handle();
        handle.fail_stage(Some(Stage::Grabber));
        let device = handle.descriptor();
        let mut pipeline = Pipeline::new(Box::new(simulated));

        let err = pipeline
            .assemble(&context(&device))
            .expect_err("assemble should fail");
        assert!(err.to_string().starts_with("create sample grabber: "), "{err}");
        assert_eq!(
            handle.released_stages(),
            vec![Stage::Source, Stage::Control, Stage::Graph]
        );
        assert!(pipeline.built().is_empty());
    }

    #[test]
    fn test_drop_releases_stages() {
        let simulated = SimulatedDevice::new();
        let handle = simulated.handle();
        let device = handle.descriptor();
        {
            let mut pipeline = Pipeline::new(Box::new(simulated));
            pipeline.assemble(&context(&device)).expect("assemble failed");
        }
        assert_eq!(handle.released_stages().len(), Stage::ORDER.len());
    }
}
