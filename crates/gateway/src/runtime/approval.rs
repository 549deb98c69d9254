//! Tool-call approval broker — gates execution of dangerous tools behind a
//! human decision.
//!
//! A gated call registers a pending approval keyed by `call_id` and suspends
//! until the decision arrives over the REST API, the trace is aborted, or
//! the configured timeout expires. `approve_for_session` whitelists the tool
//! name for the rest of the trace.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;

use super::cancel::AbortSignal;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The decision made by a human reviewer.
#[derive(Debug)]
pub enum ApprovalDecision {
    Approve { note: Option<String> },
    ApproveForSession { note: Option<String> },
    Reject { note: Option<String> },
}

/// What the waiting agent loop observes for a gated call.
#[derive(Debug)]
pub enum DecisionOutcome {
    Approved {
        for_session: bool,
        note: Option<String>,
    },
    Rejected {
        note: Option<String>,
    },
    /// The trace was aborted while waiting.
    Cancelled,
    TimedOut,
}

/// A pending approval waiting for human review.
struct PendingApproval {
    trace_id: String,
    tool_name: String,
    title: String,
    requested_at: DateTime<Utc>,
    respond: oneshot::Sender<ApprovalDecision>,
}

/// Serializable snapshot of a pending approval (for API introspection).
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalInfo {
    pub call_id: String,
    pub trace_id: String,
    pub tool_name: String,
    pub title: String,
    pub requested_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Broker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct ApprovalBroker {
    pending: Mutex<HashMap<String, PendingApproval>>,
    /// trace_id → tool names approved for the rest of the session.
    session: Mutex<HashMap<String, HashSet<String>>>,
}

impl ApprovalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_session_approved(&self, trace_id: &str, tool_name: &str) -> bool {
        self.session
            .lock()
            .get(trace_id)
            .is_some_and(|set| set.contains(tool_name))
    }

    /// Register a gated call and return the receiver the agent loop awaits.
    pub fn register(
        &self,
        call_id: &str,
        trace_id: &str,
        tool_name: &str,
        title: &str,
    ) -> oneshot::Receiver<ApprovalDecision> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            call_id.to_owned(),
            PendingApproval {
                trace_id: trace_id.to_owned(),
                tool_name: tool_name.to_owned(),
                title: title.to_owned(),
                requested_at: Utc::now(),
                respond: tx,
            },
        );
        rx
    }

    /// Deliver a decision from the REST API. Returns `false` when the
    /// `call_id` is unknown (expired, resolved, or never registered).
    pub fn resolve(&self, call_id: &str, decision: ApprovalDecision) -> bool {
        let entry = self.pending.lock().remove(call_id);
        match entry {
            Some(pending) => {
                if matches!(decision, ApprovalDecision::ApproveForSession { .. }) {
                    self.session
                        .lock()
                        .entry(pending.trace_id.clone())
                        .or_default()
                        .insert(pending.tool_name.clone());
                }
                let _ = pending.respond.send(decision);
                true
            }
            None => false,
        }
    }

    /// Remove a timed-out approval so a late decision gets a clean 404.
    pub fn remove_expired(&self, call_id: &str) {
        self.pending.lock().remove(call_id);
    }

    /// Unblock every pending approval of an aborted trace. Dropping the
    /// responder makes the waiting receiver observe cancellation.
    pub fn cancel_trace(&self, trace_id: &str) {
        self.pending
            .lock()
            .retain(|_, pending| pending.trace_id != trace_id);
    }

    /// Tear down session-wide approvals once the trace is finished.
    pub fn clear_trace(&self, trace_id: &str) {
        self.cancel_trace(trace_id);
        self.session.lock().remove(trace_id);
    }

    pub fn list_pending(&self, trace_id: &str) -> Vec<ApprovalInfo> {
        self.pending
            .lock()
            .iter()
            .filter(|(_, p)| p.trace_id == trace_id)
            .map(|(call_id, p)| ApprovalInfo {
                call_id: call_id.clone(),
                trace_id: p.trace_id.clone(),
                tool_name: p.tool_name.clone(),
                title: p.title.clone(),
                requested_at: p.requested_at,
            })
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Waiting
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const ABORT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Suspend until a decision arrives, the abort signal fires, or the timeout
/// expires. The abort signal is polled between decision checks.
pub async fn await_decision(
    mut rx: oneshot::Receiver<ApprovalDecision>,
    signal: &AbortSignal,
    timeout: Duration,
) -> DecisionOutcome {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if signal.is_fired() {
            return DecisionOutcome::Cancelled;
        }
        tokio::select! {
            decision = &mut rx => {
                return match decision {
                    Ok(ApprovalDecision::Approve { note }) => DecisionOutcome::Approved {
                        for_session: false,
                        note,
                    },
                    Ok(ApprovalDecision::ApproveForSession { note }) => DecisionOutcome::Approved {
                        for_session: true,
                        note,
                    },
                    Ok(ApprovalDecision::Reject { note }) => DecisionOutcome::Rejected { note },
                    // Responder dropped: the trace was cancelled.
                    Err(_) => DecisionOutcome::Cancelled,
                };
            }
            _ = tokio::time::sleep(ABORT_POLL_INTERVAL) => {
                if tokio::time::Instant::now() >= deadline {
                    return DecisionOutcome::TimedOut;
                }
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn approve_resolves_waiter() {
        let broker = ApprovalBroker::new();
        let signal = AbortSignal::new();
        let rx = broker.register("c1", "tr1", "run_command", "Running ls");

        assert!(broker.resolve("c1", ApprovalDecision::Approve { note: None }));
        let outcome = await_decision(rx, &signal, Duration::from_secs(5)).await;
        assert!(matches!(
            outcome,
            DecisionOutcome::Approved { for_session: false, .. }
        ));
    }

    #[tokio::test]
    async fn approve_for_session_memoizes_tool() {
        let broker = ApprovalBroker::new();
        let rx = broker.register("c1", "tr1", "run_command", "Running ls");

        broker.resolve(
            "c1",
            ApprovalDecision::ApproveForSession {
                note: Some("fine for this one".into()),
            },
        );
        drop(rx);

        assert!(broker.is_session_approved("tr1", "run_command"));
        assert!(!broker.is_session_approved("tr2", "run_command"));
        assert!(!broker.is_session_approved("tr1", "other_tool"));

        broker.clear_trace("tr1");
        assert!(!broker.is_session_approved("tr1", "run_command"));
    }

    #[tokio::test]
    async fn reject_carries_note() {
        let broker = ApprovalBroker::new();
        let signal = AbortSignal::new();
        let rx = broker.register("c1", "tr1", "run_command", "Running rm");

        broker.resolve(
            "c1",
            ApprovalDecision::Reject {
                note: Some("too dangerous".into()),
            },
        );
        match await_decision(rx, &signal, Duration::from_secs(5)).await {
            DecisionOutcome::Rejected { note } => {
                assert_eq!(note.as_deref(), Some("too dangerous"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_trace_unblocks_waiters() {
        let broker = ApprovalBroker::new();
        let signal = AbortSignal::new();
        let rx = broker.register("c1", "tr1", "run_command", "Running ls");

        broker.cancel_trace("tr1");
        let outcome = await_decision(rx, &signal, Duration::from_secs(5)).await;
        assert!(matches!(outcome, DecisionOutcome::Cancelled));
        assert!(broker.list_pending("tr1").is_empty());
    }

    #[tokio::test]
    async fn abort_signal_unblocks_waiter() {
        let broker = ApprovalBroker::new();
        let signal = AbortSignal::new();
        let rx = broker.register("c1", "tr1", "run_command", "Running ls");

        signal.fire();
        let outcome = await_decision(rx, &signal, Duration::from_secs(5)).await;
        assert!(matches!(outcome, DecisionOutcome::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_expires() {
        let broker = ApprovalBroker::new();
        let signal = AbortSignal::new();
        let rx = broker.register("c1", "tr1", "run_command", "Running ls");

        let outcome = await_decision(rx, &signal, Duration::from_secs(1)).await;
        assert!(matches!(outcome, DecisionOutcome::TimedOut));
    }

    #[test]
    fn resolve_unknown_call_returns_false() {
        let broker = ApprovalBroker::new();
        assert!(!broker.resolve("ghost", ApprovalDecision::Approve { note: None }));
    }

    #[test]
    fn list_pending_scopes_by_trace() {
        let broker = ApprovalBroker::new();
        let _rx1 = broker.register("c1", "tr1", "run_command", "Running ls");
        let _rx2 = broker.register("c2", "tr2", "run_command", "Running ps");

        let pending = broker.list_pending("tr1");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].call_id, "c1");
    }
}
