//! The durable investigation record and its sub-structures.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::TaskEvent;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status & severity
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Processing,
    Completed,
    Cancelled,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Processing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A named opaque blob attached to an investigation request — resource YAML
/// or raw log content supplied by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedBlob {
    pub name: String,
    pub content: String,
}

/// The top-level investigation record, owned by the event store.
///
/// `task_id` is immutable after creation. `events` is append-only, ordered
/// by a dense, monotonically increasing `step_index`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub title: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    /// The original user request.
    pub prompt: String,
    #[serde(default)]
    pub resource_context: Vec<NamedBlob>,
    #[serde(default)]
    pub log_context: Vec<NamedBlob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
    /// User-set flag: the underlying issue was marked resolved.
    #[serde(default)]
    pub resolved: bool,
    #[serde(default)]
    pub sub_tasks: Vec<SubTask>,
    #[serde(default)]
    pub events: Vec<TaskEvent>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields of a fresh task at creation time. The store fills in timestamps,
/// status `processing`, and the empty event/subtask lists.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_id: String,
    pub title: String,
    pub prompt: String,
    pub resource_context: Vec<NamedBlob>,
    pub log_context: Vec<NamedBlob>,
}

/// A partial update applied via the store's `update_task`.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub title: Option<String>,
    pub tags: Option<Vec<String>>,
    pub severity: Option<Severity>,
    pub summary: Option<String>,
    pub remediation: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SubTask
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One tool invocation recorded in a specialist's plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub output_excerpt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

/// A specialist agent's structured contribution to the investigation.
///
/// `status` carries the number of issues the specialist found.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    pub id: String,
    pub subject: String,
    pub status: u32,
    pub reason: String,
    pub goal: String,
    #[serde(default)]
    pub plan: Vec<PlanStep>,
    pub discovery: String,
    pub created_at: DateTime<Utc>,
}

/// Lightweight task row for list views and past-investigation lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub title: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
    #[serde(default)]
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }

    #[test]
    fn status_round_trip() {
        for s in [
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Cancelled,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(TaskStatus::parse("bogus"), None);
    }
}
