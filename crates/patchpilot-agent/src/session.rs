//! Per-session mutable state and cooperative cancellation.

use patchpilot_core::ToolCallRecord;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Mutable state for one active agent loop. Owned exclusively by the
/// orchestrator instance running it; never persisted or shared across loops.
pub struct AgentState {
    /// Monotonically increasing; one increment per assistant-state visit.
    pub current_round: u64,
    pub started: Instant,
    /// Append-only; insertion order is significant (recency windows).
    pub history: Vec<ToolCallRecord>,
    pub last_model_response: String,
    active: Arc<AtomicBool>,
}

impl AgentState {
    pub fn new(active: Arc<AtomicBool>) -> Self {
        Self {
            current_round: 0,
            started: Instant::now(),
            history: Vec::new(),
            last_model_response: String::new(),
            active,
        }
    }

    /// Checked before each state transition; flips to false on cancellation.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Cancels a running session from another thread. In-flight tool calls are
/// not aborted; the loop stops at its next checkpoint.
#[derive(Clone)]
pub struct CancelHandle {
    active: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self {
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn cancel(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.active)
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_clears_the_active_flag() {
        let handle = CancelHandle::new();
        let state = AgentState::new(handle.flag());
        assert!(state.is_active());
        handle.cancel();
        assert!(!state.is_active());
        assert!(!handle.is_active());
    }

    #[test]
    fn fresh_state_starts_at_round_zero() {
        let state = AgentState::new(CancelHandle::new().flag());
        assert_eq!(state.current_round, 0);
        assert!(state.history.is_empty());
        assert!(state.last_model_response.is_empty());
    }
}
