//! Implementation orchestrator.
//!
//! Drives each story through create-story → dev-story → code-review with a
//! bounded pool of conflict groups, a pause gate, review/fix retries and
//! escalation. The status snapshot persisted after every transition is the
//! source of truth for `status`, `health` and resume detection.

pub mod gate;
pub mod runner;
pub mod state;

pub use gate::PauseGate;
pub use runner::ImplementationOrchestrator;
pub use state::{
    DecompositionMetrics, OrchestratorState, StatusSnapshot, StoryPhase, StoryState,
};

use std::time::Duration;

/// Tunables for the implementation orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Conflict groups running at once.
    pub max_concurrency: usize,
    /// Reviews a story may consume before escalation.
    pub max_review_cycles: u32,
    /// Deadline for one dev-story dispatch.
    pub dev_story_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// A story phase without a transition for this long emits a stall.
    pub stall_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 2,
            max_review_cycles: 3,
            dev_story_timeout: Duration::from_secs(30 * 60),
            heartbeat_interval: Duration::from_secs(30),
            stall_timeout: Duration::from_secs(10 * 60),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_max_review_cycles(mut self, cycles: u32) -> Self {
        self.max_review_cycles = cycles.max(1);
        self
    }

    pub fn with_dev_story_timeout(mut self, timeout: Duration) -> Self {
        self.dev_story_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }
}
