//! Planner todo entries — the per-investigation plan maintained by the
//! supervisor through the `write_todos` / `read_todos` tools.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TodoPriority {
    High,
    #[default]
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Todo {
    pub id: String,
    pub content: String,
    pub status: TodoStatus,
    #[serde(default)]
    pub priority: TodoPriority,
    /// Specialist agent tag the item is assigned to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Validate a full replacement list: non-empty content per item and at most
/// one `in_progress` across the list. Returns a human-readable rejection
/// message suitable for feeding back to the model.
pub fn validate_todo_list(todos: &[Todo]) -> Result<(), String> {
    let mut in_progress = 0usize;
    for (i, todo) in todos.iter().enumerate() {
        if todo.content.trim().is_empty() {
            return Err(format!("todo at index {i} has empty content"));
        }
        if todo.status == TodoStatus::InProgress {
            in_progress += 1;
        }
    }
    if in_progress > 1 {
        return Err(format!(
            "{in_progress} todos are marked in_progress; at most one is allowed"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn todo(content: &str, status: TodoStatus) -> Todo {
        Todo {
            id: "t1".into(),
            content: content.into(),
            status,
            priority: TodoPriority::Medium,
            assigned_to: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn accepts_single_in_progress() {
        let list = vec![
            todo("check events", TodoStatus::Completed),
            todo("read logs", TodoStatus::InProgress),
            todo("query metrics", TodoStatus::Pending),
        ];
        assert!(validate_todo_list(&list).is_ok());
    }

    #[test]
    fn rejects_two_in_progress() {
        let list = vec![
            todo("a", TodoStatus::InProgress),
            todo("b", TodoStatus::InProgress),
        ];
        assert!(validate_todo_list(&list).is_err());
    }

    #[test]
    fn rejects_empty_content() {
        let list = vec![todo("   ", TodoStatus::Pending)];
        assert!(validate_todo_list(&list).is_err());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&TodoStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }
}
