use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use ps_domain::event::TaskEvent;
use ps_domain::task::{NamedBlob, NewTask, SubTask, Task, TaskPatch, TaskStatus, TaskSummary};

// Schema version (bump when changing table definitions).
const SCHEMA_VERSION: i32 = 1;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Errors & outcomes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("task {0} already exists")]
    Conflict(String),

    #[error("task {0} not found")]
    TaskMissing(String),

    #[error("task {0} is finalized")]
    TaskFinalized(String),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt row for task {task_id}: {message}")]
    Corrupt { task_id: String, message: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Result of an append. `DuplicateStep` is success-equivalent: the event
/// was already present and the row is unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    DuplicateStep,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct EventStore {
    conn: Mutex<Connection>,
}

impl EventStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                tags TEXT NOT NULL DEFAULT '[]',
                severity TEXT,
                status TEXT NOT NULL,
                prompt TEXT NOT NULL,
                resource_context TEXT NOT NULL DEFAULT '[]',
                log_context TEXT NOT NULL DEFAULT '[]',
                summary TEXT,
                remediation TEXT,
                resolved INTEGER NOT NULL DEFAULT 0,
                sub_tasks TEXT NOT NULL DEFAULT '[]',
                events TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_created ON tasks(created_at DESC);
            "#,
        )?;
        conn.execute(&format!("PRAGMA user_version = {SCHEMA_VERSION}"), [])?;
        Ok(())
    }

    // ── Task lifecycle ────────────────────────────────────────────────

    /// Insert a fresh task with status `processing` and empty logs.
    pub fn create_task(&self, new: &NewTask) -> Result<()> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();
        let inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO tasks
                (task_id, title, tags, status, prompt, resource_context,
                 log_context, created_at, updated_at)
            VALUES (?1, ?2, '[]', ?3, ?4, ?5, ?6, ?7, ?7)
            "#,
            params![
                new.task_id,
                new.title,
                TaskStatus::Processing.as_str(),
                new.prompt,
                to_json(&new.resource_context),
                to_json(&new.log_context),
                now,
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::Conflict(new.task_id.clone()));
        }
        Ok(())
    }

    /// Append one event, idempotently by `step_index`.
    ///
    /// The read-modify-write runs while holding the connection lock, so a
    /// concurrent writer with the same index observes the committed list and
    /// gets `DuplicateStep`. Appends after the `done` sentinel are refused.
    pub fn append_event(&self, task_id: &str, event: &TaskEvent) -> Result<AppendOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let raw: Option<String> = tx
            .query_row(
                "SELECT events FROM tasks WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()?;
        let raw = raw.ok_or_else(|| StoreError::TaskMissing(task_id.to_string()))?;

        let mut events: Vec<TaskEvent> = from_json(task_id, &raw)?;
        if events.iter().any(|e| e.step_index == event.step_index) {
            return Ok(AppendOutcome::DuplicateStep);
        }
        if events.last().is_some_and(|e| e.payload.is_done()) {
            return Err(StoreError::TaskFinalized(task_id.to_string()));
        }

        events.push(event.clone());
        events.sort_by_key(|e| e.step_index);

        tx.execute(
            "UPDATE tasks SET events = ?1, updated_at = ?2 WHERE task_id = ?3",
            params![to_json(&events), Utc::now().to_rfc3339(), task_id],
        )?;
        tx.commit()?;
        Ok(AppendOutcome::Appended)
    }

    /// Patch mutable task fields. Once the status is terminal the task is
    /// frozen; the patch that sets the first terminal status still lands.
    pub fn update_task(&self, task_id: &str, patch: &TaskPatch) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM tasks WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()?;
        let status = status.ok_or_else(|| StoreError::TaskMissing(task_id.to_string()))?;
        let status = TaskStatus::parse(&status).ok_or_else(|| StoreError::Corrupt {
            task_id: task_id.to_string(),
            message: format!("unknown status {status}"),
        })?;
        if status.is_terminal() {
            return Err(StoreError::TaskFinalized(task_id.to_string()));
        }

        if let Some(s) = patch.status {
            tx.execute(
                "UPDATE tasks SET status = ?1 WHERE task_id = ?2",
                params![s.as_str(), task_id],
            )?;
        }
        if let Some(ref title) = patch.title {
            tx.execute(
                "UPDATE tasks SET title = ?1 WHERE task_id = ?2",
                params![title, task_id],
            )?;
        }
        if let Some(ref tags) = patch.tags {
            tx.execute(
                "UPDATE tasks SET tags = ?1 WHERE task_id = ?2",
                params![to_json(tags), task_id],
            )?;
        }
        if let Some(severity) = patch.severity {
            tx.execute(
                "UPDATE tasks SET severity = ?1 WHERE task_id = ?2",
                params![json_enum_str(&severity), task_id],
            )?;
        }
        if let Some(ref summary) = patch.summary {
            tx.execute(
                "UPDATE tasks SET summary = ?1 WHERE task_id = ?2",
                params![summary, task_id],
            )?;
        }
        if let Some(ref remediation) = patch.remediation {
            tx.execute(
                "UPDATE tasks SET remediation = ?1 WHERE task_id = ?2",
                params![remediation, task_id],
            )?;
        }
        tx.execute(
            "UPDATE tasks SET updated_at = ?1 WHERE task_id = ?2",
            params![Utc::now().to_rfc3339(), task_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Append a specialist's structured contribution.
    pub fn add_subtask(&self, task_id: &str, subtask: &SubTask) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let raw: Option<String> = tx
            .query_row(
                "SELECT sub_tasks FROM tasks WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()?;
        let raw = raw.ok_or_else(|| StoreError::TaskMissing(task_id.to_string()))?;

        let mut subtasks: Vec<SubTask> = from_json(task_id, &raw)?;
        subtasks.push(subtask.clone());

        tx.execute(
            "UPDATE tasks SET sub_tasks = ?1, updated_at = ?2 WHERE task_id = ?3",
            params![to_json(&subtasks), Utc::now().to_rfc3339(), task_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// User-set resolved flag. Allowed at any time — it is not part of the
    /// investigation record proper.
    pub fn set_resolved(&self, task_id: &str, resolved: bool) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE tasks SET resolved = ?1, updated_at = ?2 WHERE task_id = ?3",
            params![resolved as i64, Utc::now().to_rfc3339(), task_id],
        )?;
        if changed == 0 {
            return Err(StoreError::TaskMissing(task_id.to_string()));
        }
        Ok(())
    }

    // ── Reads ─────────────────────────────────────────────────────────

    pub fn read_task(&self, task_id: &str) -> Result<Task> {
        let conn = self.conn.lock();
        let task = conn
            .query_row(
                "SELECT task_id, title, tags, severity, status, prompt, resource_context, \
                 log_context, summary, remediation, resolved, sub_tasks, events, created_at, \
                 updated_at FROM tasks WHERE task_id = ?1",
                params![task_id],
                row_to_task,
            )
            .optional()?;
        task.ok_or_else(|| StoreError::TaskMissing(task_id.to_string()))
    }

    /// Events with `step_index` strictly greater than `after`; `None`
    /// replays the entire log.
    pub fn read_events_since(&self, task_id: &str, after: Option<u64>) -> Result<Vec<TaskEvent>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT events FROM tasks WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()?;
        let raw = raw.ok_or_else(|| StoreError::TaskMissing(task_id.to_string()))?;
        let events: Vec<TaskEvent> = from_json(task_id, &raw)?;
        Ok(match after {
            None => events,
            Some(n) => events.into_iter().filter(|e| e.step_index > n).collect(),
        })
    }

    /// Highest persisted step index, if any. Used to reconcile the in-memory
    /// counter after a restart.
    pub fn last_step_index(&self, task_id: &str) -> Result<Option<u64>> {
        let events = self.read_events_since(task_id, None)?;
        Ok(events.last().map(|e| e.step_index))
    }

    pub fn task_status(&self, task_id: &str) -> Result<TaskStatus> {
        let conn = self.conn.lock();
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM tasks WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()?;
        let status = status.ok_or_else(|| StoreError::TaskMissing(task_id.to_string()))?;
        TaskStatus::parse(&status).ok_or_else(|| StoreError::Corrupt {
            task_id: task_id.to_string(),
            message: format!("unknown status {status}"),
        })
    }

    /// Recent tasks, newest first, without their event logs.
    pub fn list_tasks(&self, limit: usize) -> Result<Vec<TaskSummary>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT task_id, title, tags, status, summary, remediation, resolved, created_at \
             FROM tasks ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_summary)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Keyword search over title and summary for the past-investigation
    /// lookup tool. Every whitespace-separated term must match.
    pub fn search_tasks(&self, keywords: &str, limit: usize) -> Result<Vec<TaskSummary>> {
        let terms: Vec<String> = keywords
            .split_whitespace()
            .map(|t| format!("%{}%", t.replace('%', " ").replace('_', " ")))
            .collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let mut sql = String::from(
            "SELECT task_id, title, tags, status, summary, remediation, resolved, created_at \
             FROM tasks WHERE 1=1",
        );
        for i in 1..=terms.len() {
            sql.push_str(&format!(
                " AND (title LIKE ?{i} OR COALESCE(summary, '') LIKE ?{i})"
            ));
        }
        sql.push_str(&format!(" ORDER BY created_at DESC LIMIT ?{}", terms.len() + 1));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let mut params_vec: Vec<&dyn rusqlite::ToSql> =
            terms.iter().map(|t| t as &dyn rusqlite::ToSql).collect();
        let limit = limit as i64;
        params_vec.push(&limit);

        let rows = stmt.query_map(params_vec.as_slice(), row_to_summary)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Row conversion helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "[]".into())
}

fn from_json<T: serde::de::DeserializeOwned>(task_id: &str, raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
        task_id: task_id.to_string(),
        message: e.to_string(),
    })
}

/// Serialize a serde unit-variant enum to its bare string form.
fn json_enum_str<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_default()
}

fn parse_ts(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let task_id: String = row.get(0)?;
    let tags: String = row.get(2)?;
    let severity: Option<String> = row.get(3)?;
    let status: String = row.get(4)?;
    let resource_context: String = row.get(6)?;
    let log_context: String = row.get(7)?;
    let sub_tasks: String = row.get(11)?;
    let events: String = row.get(12)?;

    Ok(Task {
        task_id,
        title: row.get(1)?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Failed),
        severity: severity
            .and_then(|s| serde_json::from_value(serde_json::Value::String(s)).ok()),
        prompt: row.get(5)?,
        resource_context: serde_json::from_str::<Vec<NamedBlob>>(&resource_context)
            .unwrap_or_default(),
        log_context: serde_json::from_str::<Vec<NamedBlob>>(&log_context).unwrap_or_default(),
        summary: row.get(8)?,
        remediation: row.get(9)?,
        resolved: row.get::<_, i64>(10)? != 0,
        sub_tasks: serde_json::from_str(&sub_tasks).unwrap_or_default(),
        events: serde_json::from_str(&events).unwrap_or_default(),
        created_at: parse_ts(row.get(13)?),
        updated_at: parse_ts(row.get(14)?),
    })
}

fn row_to_summary(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskSummary> {
    let tags: String = row.get(2)?;
    let status: String = row.get(3)?;
    Ok(TaskSummary {
        task_id: row.get(0)?,
        title: row.get(1)?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Failed),
        summary: row.get(4)?,
        remediation: row.get(5)?,
        resolved: row.get::<_, i64>(6)? != 0,
        created_at: parse_ts(row.get(7)?),
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
