//! Per-trace abort signals.
//!
//! Each investigation gets one single-shot [`AbortSignal`]. Every await
//! point in the agent loop, the approval broker, and the supervisor observes
//! it cooperatively. The process-wide registry keyed by `trace_id` lives at
//! the HTTP boundary: created on investigation start, removed after `done`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// A single-shot cancellation flag shared by all components of one trace.
#[derive(Clone, Default)]
pub struct AbortSignal {
    fired: Arc<AtomicBool>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn fire(&self) {
        self.fired.store(true, Ordering::Release);
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

/// Active abort signals, keyed by `trace_id`.
#[derive(Default)]
pub struct AbortRegistry {
    signals: Mutex<HashMap<String, AbortSignal>>,
}

impl AbortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and track the signal for a new trace.
    pub fn register(&self, trace_id: &str) -> AbortSignal {
        let signal = AbortSignal::new();
        self.signals
            .lock()
            .insert(trace_id.to_owned(), signal.clone());
        signal
    }

    pub fn get(&self, trace_id: &str) -> Option<AbortSignal> {
        self.signals.lock().get(trace_id).cloned()
    }

    /// Fire the signal for a trace. Returns false when the trace is unknown
    /// (already torn down or never started).
    pub fn fire(&self, trace_id: &str) -> bool {
        match self.signals.lock().get(trace_id) {
            Some(signal) => {
                signal.fire();
                true
            }
            None => false,
        }
    }

    /// Drop the signal once the trace has emitted `done`.
    pub fn remove(&self, trace_id: &str) {
        self.signals.lock().remove(trace_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_fires_once_and_stays_fired() {
        let signal = AbortSignal::new();
        assert!(!signal.is_fired());
        signal.fire();
        signal.fire();
        assert!(signal.is_fired());
    }

    #[test]
    fn clones_share_state() {
        let signal = AbortSignal::new();
        let clone = signal.clone();
        signal.fire();
        assert!(clone.is_fired());
    }

    #[test]
    fn registry_lifecycle() {
        let registry = AbortRegistry::new();
        let signal = registry.register("tr1");

        assert!(registry.fire("tr1"));
        assert!(signal.is_fired());

        registry.remove("tr1");
        assert!(!registry.fire("tr1"));
        assert!(registry.get("tr1").is_none());
    }

    #[test]
    fn fire_unknown_trace_is_false() {
        let registry = AbortRegistry::new();
        assert!(!registry.fire("ghost"));
    }
}
