//! Public types for the stats engine coordinator.

use crate::resilience::circuit_breaker::TierCircuitMetrics;

/// Engine lifecycle state.
///
/// Use [`super::StatsEngine::state()`] to check the current state or
/// [`super::StatsEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Backends wired, background loop not started
    Ready,
    /// Background loop running
    Running,
    /// Draining the dirty set, no new jobs accepted
    ShuttingDown,
    /// Shutdown finished
    Stopped,
}

impl EngineState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => write!(f, "Ready"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Result of a batch operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    /// Total items in the batch
    pub total: usize,
    /// Successfully processed items
    pub succeeded: usize,
    /// Failed items
    pub failed: usize,
}

impl BatchResult {
    /// Check if all items succeeded
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Point-in-time view of the engine for health endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    pub state: EngineState,
    /// Dirty set size, `None` when the fast tier could not be read
    pub dirty_products: Option<usize>,
    pub pending_jobs: usize,
    pub circuits: TierCircuitMetrics,
}

impl EngineStatus {
    /// Accepting work with a reachable fast tier.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self.state, EngineState::Ready | EngineState::Running) && self.dirty_products.is_some()
    }
}
