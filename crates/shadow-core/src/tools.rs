use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use crate::db::{Db, NewTodo};
use crate::events::EventBus;
use crate::executor::{CommandOptions, ExecError, Executor, GrepOptions, ReadOptions};
use crate::llm::StreamChunk;
use crate::types::TodoStatus;

/// Names of every tool the LLM loop may call.
pub const TOOL_NAMES: &[&str] = &[
    "read_file",
    "write_file",
    "search_replace",
    "delete_file",
    "list_directory",
    "search_files",
    "grep_search",
    "codebase_search",
    "execute_command",
    "todo_write",
];

/// At most this many index-ranked directories are handed to codebase search.
const MAX_INDEX_DIRS: usize = 10;

/// Dispatch target for LLM tool calls: routes each call into the task's
/// executor (or the todo table) and wraps the outcome in a JSON envelope the
/// model can read back. Tool misuse is a result, not a failure — the loop
/// continues.
pub struct ToolRouter {
    task_id: String,
    executor: Arc<dyn Executor>,
    db: Arc<Db>,
    bus: Arc<EventBus>,
}

impl ToolRouter {
    pub fn new(
        task_id: impl Into<String>,
        executor: Arc<dyn Executor>,
        db: Arc<Db>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            executor,
            db,
            bus,
        }
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    pub async fn dispatch(&self, name: &str, args: &Value) -> Value {
        debug!(task_id = %self.task_id, tool = name, "dispatching tool call");
        let result = match name {
            "read_file" => self.read_file(args).await,
            "write_file" => self.write_file(args).await,
            "search_replace" => self.search_replace(args).await,
            "delete_file" => self.delete_file(args).await,
            "list_directory" => self.list_directory(args).await,
            "search_files" => self.search_files(args).await,
            "grep_search" => self.grep_search(args).await,
            "codebase_search" => self.codebase_search(args).await,
            "execute_command" => self.execute_command(args).await,
            "todo_write" => self.todo_write(args).await,
            other => Err(ExecError::NotFound(format!("unknown tool: {other}"))),
        };
        match result {
            Ok(value) => success(value),
            Err(e) => json!({
                "success": false,
                "error": e.message(),
                "kind": e.kind(),
            }),
        }
    }

    async fn read_file(&self, args: &Value) -> Result<Value, ExecError> {
        let path = str_arg(args, "path")?;
        let opts = ReadOptions {
            entire: args["entire"].as_bool().unwrap_or(false),
            start: args["start"].as_u64().map(|n| n as usize),
            end: args["end"].as_u64().map(|n| n as usize),
        };
        let result = self.executor.read_file(&path, opts).await?;
        Ok(to_value(&result))
    }

    async fn write_file(&self, args: &Value) -> Result<Value, ExecError> {
        let path = str_arg(args, "path")?;
        let content = str_arg(args, "content")?;
        let instructions = args["instructions"].as_str().unwrap_or_default();
        let result = self
            .executor
            .write_file(&path, &content, instructions)
            .await?;
        Ok(to_value(&result))
    }

    async fn search_replace(&self, args: &Value) -> Result<Value, ExecError> {
        let path = str_arg(args, "path")?;
        let old = str_arg(args, "old_string")?;
        let new = str_arg(args, "new_string")?;
        let result = self.executor.search_replace(&path, &old, &new).await?;
        Ok(to_value(&result))
    }

    async fn delete_file(&self, args: &Value) -> Result<Value, ExecError> {
        let path = str_arg(args, "path")?;
        let result = self.executor.delete_file(&path).await?;
        Ok(to_value(&result))
    }

    async fn list_directory(&self, args: &Value) -> Result<Value, ExecError> {
        let path = args["path"].as_str().unwrap_or(".").to_string();
        let entries = if args["recursive"].as_bool().unwrap_or(false) {
            self.executor.list_directory_recursive(&path).await?
        } else {
            self.executor.list_directory(&path).await?
        };
        Ok(json!({ "entries": entries }))
    }

    async fn search_files(&self, args: &Value) -> Result<Value, ExecError> {
        let query = str_arg(args, "query")?;
        let files = self.executor.search_files(&query).await?;
        Ok(json!({ "files": files }))
    }

    async fn grep_search(&self, args: &Value) -> Result<Value, ExecError> {
        let query = str_arg(args, "query")?;
        let opts = GrepOptions {
            include: args["include"].as_str().map(str::to_string),
            exclude: args["exclude"].as_str().map(str::to_string),
            case_sensitive: args["case_sensitive"].as_bool().unwrap_or(true),
        };
        let result = self.executor.grep_search(&query, opts).await?;
        Ok(to_value(&result))
    }

    async fn codebase_search(&self, args: &Value) -> Result<Value, ExecError> {
        let query = str_arg(args, "query")?;
        let mut dirs: Vec<String> = args["dirs"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        if dirs.is_empty() {
            dirs = self.index_candidate_dirs(&query);
        }
        let snippets = self.executor.codebase_search(&query, &dirs).await?;
        Ok(json!({ "snippets": snippets }))
    }

    /// When the indexing service has built a token index for this repo, rank
    /// its files against the query and search only their directories.
    fn index_candidate_dirs(&self, query: &str) -> Vec<String> {
        let Ok(Some(task)) = self.db.get_task(&self.task_id) else {
            return Vec::new();
        };
        let Ok(Some(index)) = self.db.get_search_index(&task.repo_full_name) else {
            return Vec::new();
        };
        let Some(files) = index["files"].as_object() else {
            return Vec::new();
        };
        let tokens: HashSet<String> = query
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() >= 2)
            .map(|t| t.to_lowercase())
            .collect();

        let mut scored: Vec<(usize, &String)> = files
            .iter()
            .filter_map(|(path, terms)| {
                let terms = terms.as_array()?;
                let hits = terms
                    .iter()
                    .filter_map(|t| t.as_str())
                    .filter(|t| tokens.contains(*t))
                    .count();
                (hits > 0).then_some((hits, path))
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));

        let mut dirs = Vec::new();
        let mut seen = HashSet::new();
        for (_, path) in scored {
            let dir = match path.rsplit_once('/') {
                Some((dir, _)) => dir.to_string(),
                None => ".".to_string(),
            };
            if seen.insert(dir.clone()) {
                dirs.push(dir);
            }
            if dirs.len() >= MAX_INDEX_DIRS {
                break;
            }
        }
        dirs
    }

    async fn execute_command(&self, args: &Value) -> Result<Value, ExecError> {
        let cmd = str_arg(args, "command")?;
        let opts = CommandOptions {
            timeout_s: args["timeout"].as_u64().unwrap_or(30),
            background: args["background"].as_bool().unwrap_or(false),
            network_allowed: args["network_allowed"].as_bool().unwrap_or(false),
        };
        let result = self.executor.execute_command(&cmd, opts).await?;
        Ok(to_value(&result))
    }

    /// Replace (or merge into) the task's todo list and broadcast the update.
    async fn todo_write(&self, args: &Value) -> Result<Value, ExecError> {
        let items = args["todos"]
            .as_array()
            .ok_or_else(|| ExecError::InvalidRange("todo_write requires a todos array".into()))?;
        let merge = args["merge"].as_bool().unwrap_or(false);

        let mut incoming = Vec::new();
        for (i, item) in items.iter().enumerate() {
            let content = item["content"]
                .as_str()
                .ok_or_else(|| ExecError::InvalidRange("todo item missing content".into()))?;
            incoming.push(NewTodo {
                content: content.to_string(),
                status: TodoStatus::from_str(item["status"].as_str().unwrap_or("PENDING")),
                sequence: item["sequence"].as_i64().unwrap_or(i as i64 + 1),
            });
        }

        let (todos, action) = if merge {
            let existing = self
                .db
                .list_todos(&self.task_id)
                .map_err(|e| ExecError::Failed(e.to_string()))?;
            let mut merged: Vec<NewTodo> = existing
                .into_iter()
                .map(|t| NewTodo {
                    content: t.content,
                    status: t.status,
                    sequence: t.sequence,
                })
                .collect();
            for item in incoming {
                match merged.iter_mut().find(|t| t.sequence == item.sequence) {
                    Some(slot) => *slot = item,
                    None => merged.push(item),
                }
            }
            merged.sort_by_key(|t| t.sequence);
            let todos = self
                .db
                .replace_todos(&self.task_id, &merged)
                .map_err(|e| ExecError::Failed(e.to_string()))?;
            (todos, "updated")
        } else {
            let todos = self
                .db
                .replace_todos(&self.task_id, &incoming)
                .map_err(|e| ExecError::Failed(e.to_string()))?;
            (todos, "replaced")
        };

        let completed = todos
            .iter()
            .filter(|t| t.status == TodoStatus::Completed)
            .count();
        self.bus
            .publish(
                &self.task_id,
                StreamChunk::TodoUpdate {
                    todos: todos.clone(),
                    action: action.to_string(),
                    total_count: todos.len(),
                    completed_count: completed,
                },
            )
            .await;
        Ok(json!({ "todos": todos, "action": action }))
    }
}

fn str_arg(args: &Value, key: &str) -> Result<String, ExecError> {
    args[key]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ExecError::InvalidRange(format!("missing required argument: {key}")))
}

fn to_value<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Wrap a payload object in the `success: true` envelope.
fn success(mut value: Value) -> Value {
    if let Some(obj) = value.as_object_mut() {
        obj.insert("success".into(), Value::Bool(true));
        return value;
    }
    json!({ "success": true, "result": value })
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_envelope_merges_into_objects() {
        let v = success(json!({"isNewFile": true}));
        assert_eq!(v["success"], true);
        assert_eq!(v["isNewFile"], true);
    }

    #[test]
    fn success_envelope_wraps_non_objects() {
        let v = success(json!(["a", "b"]));
        assert_eq!(v["success"], true);
        assert_eq!(v["result"][0], "a");
    }

    #[test]
    fn str_arg_errors_are_invalid_range() {
        let err = str_arg(&json!({}), "path").unwrap_err();
        assert_eq!(err.kind(), "InvalidRange");
    }
}
