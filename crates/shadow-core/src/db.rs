use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;

use crate::types::{
    ChatMessage, Checkpoint, CodebaseUnderstanding, InitStatus, MessageMetadata, MessageRole,
    Task, TaskSession, TaskStatus, Todo, TodoStatus,
};

const SCHEMA_SQL: &str = include_str!("../schema.sql");

pub struct Db {
    conn: Mutex<Connection>,
}

/// A todo as supplied by the `todo_write` tool, before it has a row id.
#[derive(Debug, Clone)]
pub struct NewTodo {
    pub content: String,
    pub status: TodoStatus,
    pub sequence: i64,
}

// ── Timestamp helpers ─────────────────────────────────────────────────────

fn parse_ts(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|ndt| ndt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

fn fmt_ts(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn now_str() -> String {
    fmt_ts(Utc::now())
}

// ── Row mappers ───────────────────────────────────────────────────────────

const TASK_COLS: &str = "id, title, repo_full_name, repo_url, base_branch, shadow_branch, \
     base_commit_sha, workspace_path, status, init_status, initialization_error, \
     scheduled_cleanup_at, workspace_cleaned_up, user_id, codebase_understanding_id, \
     created_at, updated_at";

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get(8)?;
    let init_status: String = row.get(9)?;
    let cleaned: i64 = row.get(12)?;
    let created_at: String = row.get(15)?;
    let updated_at: String = row.get(16)?;
    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        repo_full_name: row.get(2)?,
        repo_url: row.get(3)?,
        base_branch: row.get(4)?,
        shadow_branch: row.get(5)?,
        base_commit_sha: row.get(6)?,
        workspace_path: row.get(7)?,
        status: TaskStatus::from_str(&status),
        init_status: InitStatus::from_str(&init_status),
        initialization_error: row.get(10)?,
        scheduled_cleanup_at: row.get(11)?,
        workspace_cleaned_up: cleaned != 0,
        user_id: row.get(13)?,
        codebase_understanding_id: row.get(14)?,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

const MESSAGE_COLS: &str =
    "id, task_id, role, sequence, content, llm_model, created_at, edited_at, metadata";

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    let role: String = row.get(2)?;
    let created_at: String = row.get(6)?;
    let edited_at: Option<String> = row.get(7)?;
    let metadata: String = row.get(8)?;
    Ok(ChatMessage {
        id: row.get(0)?,
        task_id: row.get(1)?,
        role: MessageRole::from_str(&role),
        sequence: row.get(3)?,
        content: row.get(4)?,
        llm_model: row.get(5)?,
        created_at: parse_ts(&created_at),
        edited_at: edited_at.map(|s| parse_ts(&s)),
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
    })
}

fn row_to_todo(row: &rusqlite::Row<'_>) -> rusqlite::Result<Todo> {
    let status: String = row.get(3)?;
    Ok(Todo {
        id: row.get(0)?,
        task_id: row.get(1)?,
        content: row.get(2)?,
        status: TodoStatus::from_str(&status),
        sequence: row.get(4)?,
    })
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskSession> {
    let is_active: i64 = row.get(4)?;
    let created_at: String = row.get(5)?;
    let ended_at: Option<String> = row.get(6)?;
    Ok(TaskSession {
        id: row.get(0)?,
        task_id: row.get(1)?,
        pod_name: row.get(2)?,
        pod_namespace: row.get(3)?,
        is_active: is_active != 0,
        created_at: parse_ts(&created_at),
        ended_at: ended_at.map(|s| parse_ts(&s)),
    })
}

fn row_to_understanding(row: &rusqlite::Row<'_>) -> rusqlite::Result<CodebaseUnderstanding> {
    let summary: String = row.get(2)?;
    let created_at: String = row.get(3)?;
    let updated_at: String = row.get(4)?;
    Ok(CodebaseUnderstanding {
        id: row.get(0)?,
        repo_full_name: row.get(1)?,
        summary: serde_json::from_str(&summary).unwrap_or(serde_json::Value::Null),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

// ── Db impl ───────────────────────────────────────────────────────────────

impl Db {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open SQLite database at {path:?}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("failed to set PRAGMAs")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .context("failed to set PRAGMAs")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply schema migrations")?;
        Ok(())
    }

    // ── Tasks ─────────────────────────────────────────────────────────────

    pub fn insert_task(&self, task: &Task) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO tasks \
             (id, title, repo_full_name, repo_url, base_branch, shadow_branch, \
              base_commit_sha, workspace_path, status, init_status, initialization_error, \
              scheduled_cleanup_at, workspace_cleaned_up, user_id, codebase_understanding_id, \
              created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                task.id,
                task.title,
                task.repo_full_name,
                task.repo_url,
                task.base_branch,
                task.shadow_branch,
                task.base_commit_sha,
                task.workspace_path,
                task.status.as_str(),
                task.init_status.as_str(),
                task.initialization_error,
                task.scheduled_cleanup_at,
                i64::from(task.workspace_cleaned_up),
                task.user_id,
                task.codebase_understanding_id,
                fmt_ts(task.created_at),
                fmt_ts(task.updated_at),
            ],
        )
        .context("insert_task")?;
        Ok(())
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                &format!("SELECT {TASK_COLS} FROM tasks WHERE id = ?1"),
                params![id],
                row_to_task,
            )
            .optional()
            .context("get_task")?;
        Ok(result)
    }

    pub fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now_str(), id],
        )
        .context("update_task_status")?;
        Ok(())
    }

    pub fn set_init_status(&self, id: &str, init_status: InitStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE tasks SET init_status = ?1, updated_at = ?2 WHERE id = ?3",
            params![init_status.as_str(), now_str(), id],
        )
        .context("set_init_status")?;
        Ok(())
    }

    pub fn set_initialization_error(&self, id: &str, error: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE tasks SET initialization_error = ?1, updated_at = ?2 WHERE id = ?3",
            params![error, now_str(), id],
        )
        .context("set_initialization_error")?;
        Ok(())
    }

    pub fn set_workspace_info(&self, id: &str, path: &str, base_sha: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE tasks SET workspace_path = ?1, base_commit_sha = ?2, \
             workspace_cleaned_up = 0, updated_at = ?3 WHERE id = ?4",
            params![path, base_sha, now_str(), id],
        )
        .context("set_workspace_info")?;
        Ok(())
    }

    pub fn set_workspace_cleaned_up(&self, id: &str, cleaned: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE tasks SET workspace_cleaned_up = ?1, updated_at = ?2 WHERE id = ?3",
            params![i64::from(cleaned), now_str(), id],
        )
        .context("set_workspace_cleaned_up")?;
        Ok(())
    }

    pub fn set_codebase_understanding_id(&self, id: &str, understanding_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE tasks SET codebase_understanding_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![understanding_id, now_str(), id],
        )
        .context("set_codebase_understanding_id")?;
        Ok(())
    }

    /// Bump `updated_at` to record task activity.
    pub fn touch_task(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE tasks SET updated_at = ?1 WHERE id = ?2",
            params![now_str(), id],
        )
        .context("touch_task")?;
        Ok(())
    }

    pub fn schedule_cleanup(&self, id: &str, at_epoch_s: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE tasks SET scheduled_cleanup_at = ?1, updated_at = ?2 WHERE id = ?3",
            params![at_epoch_s, now_str(), id],
        )
        .context("schedule_cleanup")?;
        Ok(())
    }

    pub fn clear_scheduled_cleanup(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE tasks SET scheduled_cleanup_at = NULL, updated_at = ?1 WHERE id = ?2",
            params![now_str(), id],
        )
        .context("clear_scheduled_cleanup")?;
        Ok(())
    }

    pub fn list_cleanup_due(&self, now_epoch_s: i64) -> Result<Vec<Task>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLS} FROM tasks \
             WHERE scheduled_cleanup_at IS NOT NULL AND scheduled_cleanup_at <= ?1 \
             ORDER BY scheduled_cleanup_at ASC"
        ))?;
        let tasks = stmt
            .query_map(params![now_epoch_s], row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_cleanup_due")?;
        Ok(tasks)
    }

    /// Atomically claim a task for cleanup. Returns false if the schedule was
    /// cleared (or moved into the future) since selection — the concurrent
    /// follow-up message wins.
    pub fn claim_cleanup(&self, id: &str, now_epoch_s: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let rows = conn
            .execute(
                "UPDATE tasks SET scheduled_cleanup_at = NULL, updated_at = ?1 \
                 WHERE id = ?2 AND scheduled_cleanup_at IS NOT NULL \
                 AND scheduled_cleanup_at <= ?3",
                params![now_str(), id, now_epoch_s],
            )
            .context("claim_cleanup")?;
        Ok(rows == 1)
    }

    // ── Chat messages ─────────────────────────────────────────────────────

    pub fn next_sequence(&self, task_id: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let max: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(sequence), 0) FROM chat_messages WHERE task_id = ?1",
                params![task_id],
                |r| r.get(0),
            )
            .context("next_sequence")?;
        Ok(max + 1)
    }

    /// Insert a message at a specific sequence. Idempotent with respect to
    /// `(task_id, sequence)`: re-inserting the same key overwrites content
    /// and metadata instead of failing.
    pub fn insert_message(
        &self,
        task_id: &str,
        role: MessageRole,
        sequence: i64,
        content: &str,
        llm_model: &str,
        metadata: &MessageMetadata,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let meta_json = serde_json::to_string(metadata).context("serialize metadata")?;
        conn.execute(
            "INSERT INTO chat_messages (task_id, role, sequence, content, llm_model, \
             created_at, metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT(task_id, sequence) DO UPDATE SET \
               content = excluded.content, \
               metadata = excluded.metadata",
            params![
                task_id,
                role.as_str(),
                sequence,
                content,
                llm_model,
                now_str(),
                meta_json
            ],
        )
        .context("insert_message")?;
        let id: i64 = conn
            .query_row(
                "SELECT id FROM chat_messages WHERE task_id = ?1 AND sequence = ?2",
                params![task_id, sequence],
                |r| r.get(0),
            )
            .context("insert_message get id")?;
        Ok(id)
    }

    /// Update the streamed content/metadata of the message at `sequence`.
    pub fn update_message(
        &self,
        task_id: &str,
        sequence: i64,
        content: &str,
        metadata: &MessageMetadata,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let meta_json = serde_json::to_string(metadata).context("serialize metadata")?;
        conn.execute(
            "UPDATE chat_messages SET content = ?1, metadata = ?2 \
             WHERE task_id = ?3 AND sequence = ?4",
            params![content, meta_json, task_id, sequence],
        )
        .context("update_message")?;
        Ok(())
    }

    /// Rewrite a user message in place during an edit.
    pub fn update_message_for_edit(
        &self,
        message_id: i64,
        content: &str,
        llm_model: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE chat_messages SET content = ?1, llm_model = ?2, edited_at = ?3 \
             WHERE id = ?4",
            params![content, llm_model, now_str(), message_id],
        )
        .context("update_message_for_edit")?;
        Ok(())
    }

    pub fn get_message(&self, message_id: i64) -> Result<Option<ChatMessage>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                &format!("SELECT {MESSAGE_COLS} FROM chat_messages WHERE id = ?1"),
                params![message_id],
                row_to_message,
            )
            .optional()
            .context("get_message")?;
        Ok(result)
    }

    pub fn get_messages(&self, task_id: &str) -> Result<Vec<ChatMessage>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLS} FROM chat_messages WHERE task_id = ?1 \
             ORDER BY sequence ASC, created_at ASC"
        ))?;
        let messages = stmt
            .query_map(params![task_id], row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("get_messages")?;
        Ok(messages)
    }

    /// Editing a user message deletes everything after it.
    pub fn delete_messages_after(&self, task_id: &str, sequence: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let rows = conn
            .execute(
                "DELETE FROM chat_messages WHERE task_id = ?1 AND sequence > ?2",
                params![task_id, sequence],
            )
            .context("delete_messages_after")?;
        Ok(rows)
    }

    /// Merge a checkpoint into the metadata of the message at `sequence`.
    pub fn set_message_checkpoint(
        &self,
        task_id: &str,
        sequence: i64,
        checkpoint: &Checkpoint,
    ) -> Result<()> {
        let messages = self.get_messages(task_id)?;
        let Some(msg) = messages.into_iter().find(|m| m.sequence == sequence) else {
            anyhow::bail!("no message at sequence {sequence} for task {task_id}");
        };
        let mut metadata = msg.metadata;
        metadata.checkpoint = Some(checkpoint.clone());
        self.update_message(task_id, sequence, &msg.content, &metadata)
    }

    /// Most recent ASSISTANT message strictly before `sequence` that carries
    /// a checkpoint.
    pub fn find_checkpoint_before(
        &self,
        task_id: &str,
        sequence: i64,
    ) -> Result<Option<(i64, Checkpoint)>> {
        let messages = self.get_messages(task_id)?;
        Ok(messages
            .into_iter()
            .rev()
            .filter(|m| m.sequence < sequence && m.role == MessageRole::Assistant)
            .find_map(|m| m.metadata.checkpoint.map(|c| (m.sequence, c))))
    }

    // ── Todos ─────────────────────────────────────────────────────────────

    pub fn list_todos(&self, task_id: &str) -> Result<Vec<Todo>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, task_id, content, status, sequence FROM todos \
             WHERE task_id = ?1 ORDER BY sequence ASC",
        )?;
        let todos = stmt
            .query_map(params![task_id], row_to_todo)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_todos")?;
        Ok(todos)
    }

    /// Replace the whole todo list for a task in one transaction.
    pub fn replace_todos(&self, task_id: &str, todos: &[NewTodo]) -> Result<Vec<Todo>> {
        {
            let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
            let tx = conn.transaction().context("replace_todos begin")?;
            tx.execute("DELETE FROM todos WHERE task_id = ?1", params![task_id])
                .context("replace_todos delete")?;
            for todo in todos {
                tx.execute(
                    "INSERT INTO todos (task_id, content, status, sequence) \
                     VALUES (?1, ?2, ?3, ?4)",
                    params![task_id, todo.content, todo.status.as_str(), todo.sequence],
                )
                .context("replace_todos insert")?;
            }
            tx.commit().context("replace_todos commit")?;
        }
        self.list_todos(task_id)
    }

    // ── Task sessions ─────────────────────────────────────────────────────

    pub fn insert_session(&self, task_id: &str, pod_name: &str, pod_namespace: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        // At most one active session per task: end any leftovers first.
        conn.execute(
            "UPDATE task_sessions SET is_active = 0, ended_at = ?1 \
             WHERE task_id = ?2 AND is_active = 1",
            params![now_str(), task_id],
        )
        .context("insert_session end previous")?;
        conn.execute(
            "INSERT INTO task_sessions (task_id, pod_name, pod_namespace, is_active, created_at) \
             VALUES (?1, ?2, ?3, 1, ?4)",
            params![task_id, pod_name, pod_namespace, now_str()],
        )
        .context("insert_session")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_active_session(&self, task_id: &str) -> Result<Option<TaskSession>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                "SELECT id, task_id, pod_name, pod_namespace, is_active, created_at, ended_at \
                 FROM task_sessions WHERE task_id = ?1 AND is_active = 1 \
                 ORDER BY id DESC LIMIT 1",
                params![task_id],
                row_to_session,
            )
            .optional()
            .context("get_active_session")?;
        Ok(result)
    }

    pub fn end_active_session(&self, task_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE task_sessions SET is_active = 0, ended_at = ?1 \
             WHERE task_id = ?2 AND is_active = 1",
            params![now_str(), task_id],
        )
        .context("end_active_session")?;
        Ok(())
    }

    // ── Codebase understanding ────────────────────────────────────────────

    pub fn upsert_codebase_understanding(
        &self,
        repo_full_name: &str,
        summary: &serde_json::Value,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let summary_json = summary.to_string();
        let now = now_str();
        conn.execute(
            "INSERT INTO codebase_understandings (repo_full_name, summary, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?3) \
             ON CONFLICT(repo_full_name) DO UPDATE SET \
               summary = excluded.summary, \
               updated_at = excluded.updated_at",
            params![repo_full_name, summary_json, now],
        )
        .context("upsert_codebase_understanding")?;
        let id: i64 = conn
            .query_row(
                "SELECT id FROM codebase_understandings WHERE repo_full_name = ?1",
                params![repo_full_name],
                |r| r.get(0),
            )
            .context("upsert_codebase_understanding get id")?;
        Ok(id)
    }

    pub fn get_codebase_understanding(
        &self,
        repo_full_name: &str,
    ) -> Result<Option<CodebaseUnderstanding>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                "SELECT id, repo_full_name, summary, created_at, updated_at \
                 FROM codebase_understandings WHERE repo_full_name = ?1",
                params![repo_full_name],
                row_to_understanding,
            )
            .optional()
            .context("get_codebase_understanding")?;
        Ok(result)
    }

    // ── Search index ──────────────────────────────────────────────────────

    pub fn save_search_index(&self, repo_full_name: &str, index: &serde_json::Value) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO search_indexes (repo_full_name, index_json, updated_at) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT(repo_full_name) DO UPDATE SET \
               index_json = excluded.index_json, \
               updated_at = excluded.updated_at",
            params![repo_full_name, index.to_string(), now_str()],
        )
        .context("save_search_index")?;
        Ok(())
    }

    pub fn get_search_index(&self, repo_full_name: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result: Option<String> = conn
            .query_row(
                "SELECT index_json FROM search_indexes WHERE repo_full_name = ?1",
                params![repo_full_name],
                |r| r.get(0),
            )
            .optional()
            .context("get_search_index")?;
        Ok(result.and_then(|s| serde_json::from_str(&s).ok()))
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn test_task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            title: "add a readme".into(),
            repo_full_name: "acme/widgets".into(),
            repo_url: "https://example.com/acme/widgets.git".into(),
            base_branch: "main".into(),
            shadow_branch: Task::shadow_branch_for(id),
            base_commit_sha: String::new(),
            workspace_path: String::new(),
            status: TaskStatus::Initializing,
            init_status: InitStatus::Inactive,
            initialization_error: String::new(),
            scheduled_cleanup_at: None,
            workspace_cleaned_up: false,
            user_id: "u1".into(),
            codebase_understanding_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn task_round_trips() {
        let db = Db::open_in_memory().unwrap();
        db.insert_task(&test_task("t1")).unwrap();
        let task = db.get_task("t1").unwrap().unwrap();
        assert_eq!(task.repo_full_name, "acme/widgets");
        assert_eq!(task.status, TaskStatus::Initializing);
        assert_eq!(task.shadow_branch, "shadow/task-t1");
        assert!(db.get_task("nope").unwrap().is_none());
    }

    #[test]
    fn sequences_are_gap_free() {
        let db = Db::open_in_memory().unwrap();
        db.insert_task(&test_task("t1")).unwrap();
        for i in 1..=5 {
            let seq = db.next_sequence("t1").unwrap();
            assert_eq!(seq, i);
            db.insert_message(
                "t1",
                MessageRole::User,
                seq,
                "hi",
                "m",
                &MessageMetadata::default(),
            )
            .unwrap();
        }
        let messages = db.get_messages("t1").unwrap();
        let seqs: Vec<i64> = messages.iter().map(|m| m.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn insert_message_is_idempotent_per_sequence() {
        let db = Db::open_in_memory().unwrap();
        db.insert_task(&test_task("t1")).unwrap();
        let id1 = db
            .insert_message("t1", MessageRole::Assistant, 1, "a", "m", &MessageMetadata::default())
            .unwrap();
        let id2 = db
            .insert_message("t1", MessageRole::Assistant, 1, "ab", "m", &MessageMetadata::default())
            .unwrap();
        assert_eq!(id1, id2);
        let messages = db.get_messages("t1").unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "ab");
    }

    #[test]
    fn delete_messages_after_truncates() {
        let db = Db::open_in_memory().unwrap();
        db.insert_task(&test_task("t1")).unwrap();
        for seq in 1..=4 {
            db.insert_message(
                "t1",
                MessageRole::User,
                seq,
                "x",
                "m",
                &MessageMetadata::default(),
            )
            .unwrap();
        }
        let deleted = db.delete_messages_after("t1", 2).unwrap();
        assert_eq!(deleted, 2);
        let seqs: Vec<i64> = db
            .get_messages("t1")
            .unwrap()
            .iter()
            .map(|m| m.sequence)
            .collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn checkpoint_lookup_finds_latest_prior_assistant() {
        let db = Db::open_in_memory().unwrap();
        db.insert_task(&test_task("t1")).unwrap();
        let ck = |sha: &str| Checkpoint {
            commit_sha: sha.into(),
            todo_snapshot: vec![],
            created_at: Utc::now(),
            workspace_state: "clean".into(),
        };
        db.insert_message("t1", MessageRole::User, 1, "u1", "m", &MessageMetadata::default())
            .unwrap();
        db.insert_message(
            "t1",
            MessageRole::Assistant,
            2,
            "a1",
            "m",
            &MessageMetadata::default(),
        )
        .unwrap();
        db.set_message_checkpoint("t1", 2, &ck("sha-a1")).unwrap();
        db.insert_message("t1", MessageRole::User, 3, "u2", "m", &MessageMetadata::default())
            .unwrap();
        db.insert_message(
            "t1",
            MessageRole::Assistant,
            4,
            "a2",
            "m",
            &MessageMetadata::default(),
        )
        .unwrap();
        db.set_message_checkpoint("t1", 4, &ck("sha-a2")).unwrap();

        let (seq, checkpoint) = db.find_checkpoint_before("t1", 3).unwrap().unwrap();
        assert_eq!(seq, 2);
        assert_eq!(checkpoint.commit_sha, "sha-a1");

        // Nothing before the first user message.
        assert!(db.find_checkpoint_before("t1", 1).unwrap().is_none());
    }

    #[test]
    fn todo_replace_is_transactional() {
        let db = Db::open_in_memory().unwrap();
        db.insert_task(&test_task("t1")).unwrap();
        let first = vec![
            NewTodo { content: "one".into(), status: TodoStatus::Pending, sequence: 1 },
            NewTodo { content: "two".into(), status: TodoStatus::InProgress, sequence: 2 },
        ];
        let todos = db.replace_todos("t1", &first).unwrap();
        assert_eq!(todos.len(), 2);

        let second = vec![NewTodo {
            content: "only".into(),
            status: TodoStatus::Completed,
            sequence: 1,
        }];
        let todos = db.replace_todos("t1", &second).unwrap();
        assert_eq!(todos.len(), 1);
        assert_eq!(todos[0].content, "only");
        assert_eq!(todos[0].status, TodoStatus::Completed);
    }

    #[test]
    fn claim_cleanup_is_guarded() {
        let db = Db::open_in_memory().unwrap();
        db.insert_task(&test_task("t1")).unwrap();
        db.schedule_cleanup("t1", 100).unwrap();

        let due = db.list_cleanup_due(150).unwrap();
        assert_eq!(due.len(), 1);

        // A follow-up message cancels the schedule between select and claim.
        db.clear_scheduled_cleanup("t1").unwrap();
        assert!(!db.claim_cleanup("t1", 150).unwrap());

        // Re-scheduled in the future: still not claimable now.
        db.schedule_cleanup("t1", 500).unwrap();
        assert!(!db.claim_cleanup("t1", 150).unwrap());

        // Due again: claim succeeds exactly once.
        assert!(db.claim_cleanup("t1", 600).unwrap());
        assert!(!db.claim_cleanup("t1", 600).unwrap());
    }

    #[test]
    fn sessions_at_most_one_active() {
        let db = Db::open_in_memory().unwrap();
        db.insert_task(&test_task("t1")).unwrap();
        db.insert_session("t1", "pod-a", "shadow").unwrap();
        db.insert_session("t1", "pod-b", "shadow").unwrap();
        let active = db.get_active_session("t1").unwrap().unwrap();
        assert_eq!(active.pod_name, "pod-b");
        db.end_active_session("t1").unwrap();
        assert!(db.get_active_session("t1").unwrap().is_none());
    }

    #[test]
    fn codebase_understanding_is_unique_per_repo() {
        let db = Db::open_in_memory().unwrap();
        let id1 = db
            .upsert_codebase_understanding("acme/widgets", &serde_json::json!({"v": 1}))
            .unwrap();
        let id2 = db
            .upsert_codebase_understanding("acme/widgets", &serde_json::json!({"v": 2}))
            .unwrap();
        assert_eq!(id1, id2);
        let cu = db.get_codebase_understanding("acme/widgets").unwrap().unwrap();
        assert_eq!(cu.summary["v"], 2);
    }
}
