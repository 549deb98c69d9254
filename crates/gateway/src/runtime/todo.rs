//! The per-investigation todo board.
//!
//! `write_todos` replaces the whole list atomically after validation and
//! mirrors the snapshot to disk as one JSON document per task, so a restart
//! can reload the plan lazily. Every accepted write emits a `todo_updated`
//! event carrying the full snapshot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use ps_domain::event::EventPayload;
use ps_domain::todo::{validate_todo_list, Todo, TodoPriority, TodoStatus};

use super::registry::{SafetyClass, ToolContext, ToolInvoker, ToolOutcome, ToolSpec};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Board
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One incoming item of a full-replacement write.
#[derive(Debug, Clone, Deserialize)]
pub struct TodoInput {
    pub content: String,
    pub status: TodoStatus,
    #[serde(default)]
    pub priority: Option<TodoPriority>,
    #[serde(default)]
    pub assigned_to: Option<String>,
    /// When present and matching an existing item, its creation time is kept.
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    todos: Vec<Todo>,
}

pub struct TodoBoard {
    dir: PathBuf,
    snapshots: RwLock<HashMap<String, Vec<Todo>>>,
}

impl TodoBoard {
    pub fn new(dir: PathBuf) -> Self {
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::warn!(dir = %dir.display(), error = %e, "cannot create todo snapshot dir");
        }
        Self {
            dir,
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    fn snapshot_path(&self, task_id: &str) -> PathBuf {
        // Keep filenames safe regardless of what the client sent as id.
        let safe: String = task_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        let safe = if safe.is_empty() { "default".into() } else { safe };
        self.dir.join(format!("{safe}.json"))
    }

    /// Current snapshot: memory first, then the on-disk mirror (covers a
    /// daemon restart between calls), else empty.
    pub fn read(&self, task_id: &str) -> Vec<Todo> {
        if let Some(todos) = self.snapshots.read().get(task_id) {
            return todos.clone();
        }
        let loaded = load_snapshot(&self.snapshot_path(task_id));
        if !loaded.is_empty() {
            self.snapshots
                .write()
                .insert(task_id.to_owned(), loaded.clone());
        }
        loaded
    }

    /// Validate and apply a full replacement. Returns the accepted snapshot
    /// or a rejection message for the model.
    pub fn replace(&self, task_id: &str, items: Vec<TodoInput>) -> Result<Vec<Todo>, String> {
        let existing = self.read(task_id);
        let now = Utc::now();

        let todos: Vec<Todo> = items
            .into_iter()
            .map(|item| {
                let prior = item
                    .id
                    .as_ref()
                    .and_then(|id| existing.iter().find(|t| &t.id == id));
                Todo {
                    id: item
                        .id
                        .unwrap_or_else(|| format!("TODO-{}", &uuid::Uuid::new_v4().to_string()[..8])),
                    content: item.content,
                    status: item.status,
                    priority: item.priority.unwrap_or_default(),
                    assigned_to: item.assigned_to,
                    created_at: prior.map(|t| t.created_at).unwrap_or(now),
                    updated_at: now,
                }
            })
            .collect();

        validate_todo_list(&todos)?;

        self.snapshots
            .write()
            .insert(task_id.to_owned(), todos.clone());

        let snapshot = Snapshot {
            todos: todos.clone(),
        };
        let path = self.snapshot_path(task_id);
        if let Err(e) = persist_snapshot(&path, &snapshot) {
            tracing::warn!(task_id, path = %path.display(), error = %e, "todo snapshot write failed");
        }

        Ok(todos)
    }

    /// Drop the in-memory snapshot on trace teardown. The disk mirror stays.
    pub fn forget(&self, task_id: &str) {
        self.snapshots.write().remove(task_id);
    }
}

fn load_snapshot(path: &Path) -> Vec<Todo> {
    match std::fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str::<Snapshot>(&raw)
            .map(|s| s.todos)
            .unwrap_or_default(),
        Err(_) => Vec::new(),
    }
}

fn persist_snapshot(path: &Path, snapshot: &Snapshot) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(snapshot).unwrap_or_else(|_| "{}".into());
    std::fs::write(path, json)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct WriteTodos {
    board: Arc<TodoBoard>,
}

#[async_trait::async_trait]
impl ToolInvoker for WriteTodos {
    async fn invoke(&self, args: &Value, ctx: &ToolContext) -> ToolOutcome {
        let items: Vec<TodoInput> = match args.get("todos") {
            Some(raw) => match serde_json::from_value(raw.clone()) {
                Ok(items) => items,
                Err(e) => return ToolOutcome::failure(format!("invalid todos array: {e}")),
            },
            None => return ToolOutcome::failure("missing required argument: todos"),
        };

        match self.board.replace(&ctx.task_id, items) {
            Ok(todos) => {
                let count = todos.len();
                ctx.mux
                    .emit(&ctx.task_id, EventPayload::TodoUpdated { todos });
                ToolOutcome::structured(serde_json::json!({
                    "success": true,
                    "message": format!("updated todo list with {count} items"),
                }))
            }
            Err(msg) => ToolOutcome::failure(format!("todo list rejected: {msg}")),
        }
    }
}

struct ReadTodos {
    board: Arc<TodoBoard>,
}

#[async_trait::async_trait]
impl ToolInvoker for ReadTodos {
    async fn invoke(&self, _args: &Value, ctx: &ToolContext) -> ToolOutcome {
        let todos = self.board.read(&ctx.task_id);
        let count = todos.len();
        ToolOutcome::structured(serde_json::json!({
            "todos": todos,
            "count": count,
        }))
    }
}

/// The two planner tools exposed to the supervisor.
pub fn todo_tools(board: Arc<TodoBoard>) -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "write_todos".into(),
            description: "Replace the investigation plan with a new todo list. Statuses: \
                          pending, in_progress, completed, cancelled; at most one item may \
                          be in_progress."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "todos": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "content": { "type": "string" },
                                "status": { "type": "string", "enum": ["pending", "in_progress", "completed", "cancelled"] },
                                "priority": { "type": "string", "enum": ["high", "medium", "low"] },
                                "assigned_to": { "type": "string" },
                                "id": { "type": "string" },
                            },
                            "required": ["content", "status"],
                        },
                    },
                },
                "required": ["todos"],
            }),
            safety: SafetyClass::Auto,
            ui_component: None,
            agents: vec!["supervisor".into()],
            title: Some(|args| {
                let count = args
                    .get("todos")
                    .and_then(|t| t.as_array())
                    .map(|a| a.len())
                    .unwrap_or(0);
                format!("Updating plan ({count} items)")
            }),
            invoker: Arc::new(WriteTodos {
                board: board.clone(),
            }),
        },
        ToolSpec {
            name: "read_todos".into(),
            description: "Read the current investigation plan.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {},
            }),
            safety: SafetyClass::Auto,
            ui_component: None,
            agents: vec!["supervisor".into()],
            title: Some(|_| "Reading the plan".into()),
            invoker: Arc::new(ReadTodos { board }),
        },
    ]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn board() -> (tempfile::TempDir, TodoBoard) {
        let dir = tempfile::tempdir().unwrap();
        let board = TodoBoard::new(dir.path().to_path_buf());
        (dir, board)
    }

    fn input(content: &str, status: TodoStatus) -> TodoInput {
        TodoInput {
            content: content.into(),
            status,
            priority: None,
            assigned_to: None,
            id: None,
        }
    }

    #[test]
    fn replace_persists_and_reads_back() {
        let (_dir, board) = board();
        let todos = board
            .replace(
                "t1",
                vec![
                    input("check events", TodoStatus::InProgress),
                    input("read logs", TodoStatus::Pending),
                ],
            )
            .unwrap();
        assert_eq!(todos.len(), 2);
        assert!(todos[0].id.starts_with("TODO-"));

        let read = board.read("t1");
        assert_eq!(read.len(), 2);
        assert_eq!(read[1].content, "read logs");
    }

    #[test]
    fn rejects_second_in_progress() {
        let (_dir, board) = board();
        let err = board
            .replace(
                "t1",
                vec![
                    input("a", TodoStatus::InProgress),
                    input("b", TodoStatus::InProgress),
                ],
            )
            .unwrap_err();
        assert!(err.contains("in_progress"));
        // Rejected writes leave the board untouched.
        assert!(board.read("t1").is_empty());
    }

    #[test]
    fn reloads_from_disk_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let board = TodoBoard::new(dir.path().to_path_buf());
            board
                .replace("t1", vec![input("survive restart", TodoStatus::Pending)])
                .unwrap();
        }
        let board = TodoBoard::new(dir.path().to_path_buf());
        let todos = board.read("t1");
        assert_eq!(todos.len(), 1);
        assert_eq!(todos[0].content, "survive restart");
    }

    #[test]
    fn replacement_keeps_created_at_for_matching_ids() {
        let (_dir, board) = board();
        let first = board
            .replace("t1", vec![input("step one", TodoStatus::Pending)])
            .unwrap();
        let original_created = first[0].created_at;

        let second = board
            .replace(
                "t1",
                vec![TodoInput {
                    content: "step one".into(),
                    status: TodoStatus::Completed,
                    priority: None,
                    assigned_to: None,
                    id: Some(first[0].id.clone()),
                }],
            )
            .unwrap();
        assert_eq!(second[0].created_at, original_created);
        assert_eq!(second[0].status, TodoStatus::Completed);
    }

    #[test]
    fn snapshot_filename_is_sanitized() {
        let (dir, board) = board();
        board
            .replace("../../evil", vec![input("x", TodoStatus::Pending)])
            .unwrap();
        // The snapshot lands inside the todo dir, not outside it.
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn forget_drops_memory_but_not_disk() {
        let (_dir, board) = board();
        board
            .replace("t1", vec![input("keep me on disk", TodoStatus::Pending)])
            .unwrap();
        board.forget("t1");
        // Lazy reload from the mirror.
        assert_eq!(board.read("t1").len(), 1);
    }
}
