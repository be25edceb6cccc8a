//! Human approval gate for sensitive tool calls.
//!
//! A single-slot FIFO queue: at most one request is "current" at a time,
//! additional requests wait their turn, and `resolve` only ever decides the
//! current request. A user is never shown two simultaneous prompts and
//! approval order matches request order.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    RunCommand,
    ApplyPatch,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub kind: ApprovalKind,
    pub title: String,
    pub detail: String,
    pub payload: serde_json::Value,
}

impl ApprovalRequest {
    #[must_use]
    pub fn new(
        kind: ApprovalKind,
        title: impl Into<String>,
        detail: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            kind,
            title: title.into(),
            detail: detail.into(),
            payload,
        }
    }
}

struct Pending {
    request: ApprovalRequest,
    decision: Option<bool>,
}

#[derive(Default)]
struct GateState {
    queue: VecDeque<Pending>,
}

pub struct ApprovalGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl Default for ApprovalGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ApprovalGate {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            cond: Condvar::new(),
        }
    }

    /// Enqueue a request and block until a human resolves it.
    ///
    /// Requests resolve strictly in FIFO order: this call returns only once
    /// its entry has reached the front of the queue and been decided.
    pub fn request(&self, request: ApprovalRequest) -> bool {
        let id = request.id;
        {
            let mut state = self.state.lock().expect("gate lock");
            state.queue.push_back(Pending {
                request,
                decision: None,
            });
            self.cond.notify_all();
        }

        let mut state = self.state.lock().expect("gate lock");
        loop {
            let front_decided = state
                .queue
                .front()
                .is_some_and(|p| p.request.id == id && p.decision.is_some());
            if front_decided {
                let decided = state.queue.pop_front().expect("front exists");
                // Promote the next queued request.
                self.cond.notify_all();
                return decided.decision.unwrap_or(false);
            }
            state = self.cond.wait(state).expect("gate wait");
        }
    }

    /// The request a user should currently be shown, if any.
    #[must_use]
    pub fn current(&self) -> Option<ApprovalRequest> {
        let state = self.state.lock().expect("gate lock");
        state
            .queue
            .front()
            .filter(|p| p.decision.is_none())
            .map(|p| p.request.clone())
    }

    /// Block up to `timeout` for a request to become current.
    #[must_use]
    pub fn wait_current(&self, timeout: Duration) -> Option<ApprovalRequest> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().expect("gate lock");
        loop {
            if let Some(front) = state.queue.front()
                && front.decision.is_none()
            {
                return Some(front.request.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (next, _timed_out) = self
                .cond
                .wait_timeout(state, deadline - now)
                .expect("gate wait");
            state = next;
        }
    }

    /// Resolve the current request. Returns `false` when there is no
    /// undecided current request; queued requests are unaffected until they
    /// are promoted.
    pub fn resolve(&self, approved: bool) -> bool {
        let mut state = self.state.lock().expect("gate lock");
        match state.queue.front_mut() {
            Some(front) if front.decision.is_none() => {
                front.decision = Some(approved);
                self.cond.notify_all();
                true
            }
            _ => false,
        }
    }

    /// Number of requests waiting (including the current one).
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.lock().expect("gate lock").queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::thread;

    fn sample(kind: ApprovalKind, title: &str) -> ApprovalRequest {
        ApprovalRequest::new(kind, title, "detail", json!({}))
    }

    #[test]
    fn resolve_without_request_is_a_no_op() {
        let gate = ApprovalGate::new();
        assert!(!gate.resolve(true));
        assert!(gate.current().is_none());
    }

    #[test]
    fn single_request_resolves() {
        let gate = Arc::new(ApprovalGate::new());
        let worker = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.request(sample(ApprovalKind::RunCommand, "run")))
        };

        let current = gate
            .wait_current(Duration::from_secs(2))
            .expect("request shows up");
        assert_eq!(current.title, "run");
        assert!(gate.resolve(true));
        assert!(worker.join().expect("join"));
        assert_eq!(gate.pending(), 0);
    }

    #[test]
    fn requests_resolve_in_fifo_order() {
        let gate = Arc::new(ApprovalGate::new());
        let outcomes = Arc::new(Mutex::new(Vec::new()));

        let mut workers = Vec::new();
        for i in 0..3 {
            let gate_for_worker = Arc::clone(&gate);
            let outcomes = Arc::clone(&outcomes);
            workers.push(thread::spawn(move || {
                let approved =
                    gate_for_worker.request(sample(ApprovalKind::ApplyPatch, &format!("req-{i}")));
                outcomes.lock().unwrap().push((i, approved));
            }));
            // Fix the arrival order before spawning the next requester.
            while gate.pending() < i + 1 {
                thread::sleep(Duration::from_millis(2));
            }
        }

        // Deny the first, approve the second, deny the third. Distinct
        // decisions prove resolution order matched arrival order.
        for (i, expected_title) in ["req-0", "req-1", "req-2"].iter().enumerate() {
            let current = gate
                .wait_current(Duration::from_secs(2))
                .expect("a current request");
            assert_eq!(&current.title, expected_title);
            assert!(gate.resolve(i == 1));
        }

        for worker in workers {
            worker.join().expect("join");
        }
        let mut outcomes = outcomes.lock().unwrap().clone();
        outcomes.sort_by_key(|(i, _)| *i);
        assert_eq!(outcomes, vec![(0, false), (1, true), (2, false)]);
    }

    #[test]
    fn next_request_promotes_after_resolution() {
        let gate = Arc::new(ApprovalGate::new());
        let first = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.request(sample(ApprovalKind::RunCommand, "first")))
        };
        let _ = gate.wait_current(Duration::from_secs(2)).expect("first");
        let second = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.request(sample(ApprovalKind::RunCommand, "second")))
        };
        while gate.pending() < 2 {
            thread::sleep(Duration::from_millis(2));
        }
        // Second is queued behind first; current is still first.
        assert_eq!(gate.current().expect("current").title, "first");

        gate.resolve(true);
        assert!(first.join().expect("join first"));
        let promoted = gate.wait_current(Duration::from_secs(2)).expect("promoted");
        assert_eq!(promoted.title, "second");
        gate.resolve(false);
        assert!(!second.join().expect("join second"));
    }

    #[test]
    fn wait_current_times_out_when_idle() {
        let gate = ApprovalGate::new();
        assert!(gate.wait_current(Duration::from_millis(50)).is_none());
    }
}
