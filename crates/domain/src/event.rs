//! Typed events on the investigation timeline.
//!
//! Every observable moment of an investigation is one [`TaskEvent`] with a
//! dense, per-task `step_index`. On the SSE wire each event serializes to a
//! flat object `{step_index, kind, timestamp, ...payload}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::SubTask;
use crate::todo::Todo;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error taxonomy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Closed set of surface-level error kinds carried by `error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    ToolNotFound,
    ToolTimeout,
    ToolFailed,
    ApprovalRejected,
    Cancelled,
    LlmError,
    StoreError,
    MaxTurnsExceeded,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Which channel a `text_delta` belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextRole {
    Assistant,
    Reasoning,
}

/// Structured result attached to a `tool_call_output` event when the tool's
/// descriptor carries a UI component hint and the call succeeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiComponent {
    pub name: String,
    pub props: serde_json::Value,
}

/// The kind-specific payload of an event (closed set).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    TraceStarted {
        trace_id: String,
    },
    AgentStarted {
        agent_name: String,
    },
    AgentCompleted {
        agent_name: String,
        duration_ms: u64,
    },
    TextDelta {
        text: String,
        role: TextRole,
    },
    ToolCallRequested {
        call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
        /// Human-readable one-liner, e.g. "Listing pods in prod".
        title: String,
        approval_required: bool,
    },
    ToolCallApproved {
        call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_note: Option<String>,
    },
    ToolCallRejected {
        call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_note: Option<String>,
    },
    ToolCallOutput {
        call_id: String,
        output: serde_json::Value,
        success: bool,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        component: Option<UiComponent>,
    },
    /// Full todo list snapshot — replace, not merge.
    TodoUpdated {
        todos: Vec<Todo>,
    },
    SubtaskAdded {
        subtask: SubTask,
    },
    InvestigationCompleted {
        summary: String,
        remediation: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tags: Option<Vec<String>>,
    },
    Error {
        error_kind: ErrorKind,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
    },
    /// Terminal sentinel. No events follow.
    Done,
}

impl EventPayload {
    /// Stable kind tag, as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TraceStarted { .. } => "trace_started",
            Self::AgentStarted { .. } => "agent_started",
            Self::AgentCompleted { .. } => "agent_completed",
            Self::TextDelta { .. } => "text_delta",
            Self::ToolCallRequested { .. } => "tool_call_requested",
            Self::ToolCallApproved { .. } => "tool_call_approved",
            Self::ToolCallRejected { .. } => "tool_call_rejected",
            Self::ToolCallOutput { .. } => "tool_call_output",
            Self::TodoUpdated { .. } => "todo_updated",
            Self::SubtaskAdded { .. } => "subtask_added",
            Self::InvestigationCompleted { .. } => "investigation_completed",
            Self::Error { .. } => "error",
            Self::Done => "done",
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A single point on the investigation timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub step_index: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl TaskEvent {
    pub fn new(step_index: u64, payload: EventPayload) -> Self {
        Self {
            step_index,
            timestamp: Utc::now(),
            payload,
        }
    }
}
