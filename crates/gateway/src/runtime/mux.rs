//! The stream multiplexer — the single serialization point for every event
//! an investigation produces.
//!
//! `emit` assigns the next dense `step_index` under a per-trace lock,
//! persists the event, then publishes it to the live subscriber channel.
//! Duplicate-step results from the store are success-equivalent. A store
//! write failure is surfaced as an `error` event on the live channel but
//! never aborts the stream.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use ps_domain::event::{ErrorKind, EventPayload, TaskEvent, UiComponent};
use ps_store::{EventStore, StoreError};

use super::registry::ToolOutcome;

/// Capacity of each live subscriber channel. Slow subscribers lag and are
/// recovered by the replay path.
const CHANNEL_CAPACITY: usize = 256;

struct TraceChannel {
    tx: broadcast::Sender<TaskEvent>,
    next_step: Mutex<u64>,
}

pub struct EventMux {
    store: Arc<EventStore>,
    channels: RwLock<HashMap<String, Arc<TraceChannel>>>,
}

impl EventMux {
    pub fn new(store: Arc<EventStore>) -> Self {
        Self {
            store,
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Open the live channel for a task, reconciling the step counter with
    /// the persisted tail (relevant when a daemon restart interrupted a
    /// task and a new trace resumes emitting).
    pub fn open(&self, task_id: &str) -> Result<(), StoreError> {
        let next = match self.store.last_step_index(task_id)? {
            Some(last) => last + 1,
            None => 0,
        };
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        self.channels.write().insert(
            task_id.to_owned(),
            Arc::new(TraceChannel {
                tx,
                next_step: Mutex::new(next),
            }),
        );
        Ok(())
    }

    pub fn is_open(&self, task_id: &str) -> bool {
        self.channels.read().contains_key(task_id)
    }

    /// Subscribe to the live stream of a task, if it is still producing.
    pub fn subscribe(&self, task_id: &str) -> Option<broadcast::Receiver<TaskEvent>> {
        self.channels.read().get(task_id).map(|c| c.tx.subscribe())
    }

    /// Emit one event: assign the step index, persist, publish. Returns the
    /// assigned index, or `None` when the task has no open channel.
    pub fn emit(&self, task_id: &str, payload: EventPayload) -> Option<u64> {
        let channel = self.channels.read().get(task_id).cloned()?;

        // The counter lock is held across persist + publish so subscribers
        // observe the exact serialization order.
        let mut next = channel.next_step.lock();
        let event = TaskEvent::new(*next, payload);
        *next += 1;

        match self.store.append_event(task_id, &event) {
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(task_id, step = event.step_index, error = %e, "event persist failed");
                // Publish the original event regardless, then surface the
                // store failure on the stream.
                let _ = channel.tx.send(event.clone());
                let error_event = TaskEvent::new(
                    *next,
                    EventPayload::Error {
                        error_kind: ErrorKind::StoreError,
                        message: format!("event {} not persisted: {e}", event.step_index),
                        call_id: None,
                    },
                );
                *next += 1;
                let _ = self.store.append_event(task_id, &error_event);
                let _ = channel.tx.send(error_event);
                return Some(event.step_index);
            }
        }

        let _ = channel.tx.send(event.clone());
        Some(event.step_index)
    }

    /// Build a `tool_call_output` payload, attaching the UI component when
    /// the descriptor carries a hint and the call succeeded.
    pub fn tool_output_payload(
        ui_component: Option<&str>,
        call_id: &str,
        outcome: &ToolOutcome,
        duration_ms: u64,
    ) -> EventPayload {
        let component = match (ui_component, outcome.success) {
            (Some(name), true) => Some(UiComponent {
                name: name.to_owned(),
                props: outcome.output.clone(),
            }),
            _ => None,
        };
        EventPayload::ToolCallOutput {
            call_id: call_id.to_owned(),
            output: outcome.output.clone(),
            success: outcome.success,
            duration_ms,
            component,
        }
    }

    /// Drop the live channel once the trace has emitted `done`.
    pub fn close(&self, task_id: &str) {
        self.channels.write().remove(task_id);
    }
}
