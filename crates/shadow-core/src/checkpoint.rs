use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::db::{Db, NewTodo};
use crate::events::EventBus;
use crate::executor::Executor;
use crate::git::GitService;
use crate::llm::StreamChunk;
use crate::types::{Checkpoint, Todo, TodoStatus};
use crate::watcher::WatcherRegistry;
use crate::workspace::WorkspaceManager;

/// Delay after checkout for git to settle before recomputing file state.
const GIT_SETTLE: Duration = Duration::from_millis(150);
/// Delay before re-arming the watcher after the override is published.
const WATCHER_RESUME_DELAY: Duration = Duration::from_millis(200);

/// Message-level snapshots (git commit + todo list) and time-travel restore.
pub struct CheckpointService {
    db: Arc<Db>,
    bus: Arc<EventBus>,
    workspaces: Arc<WorkspaceManager>,
    watchers: Arc<WatcherRegistry>,
}

impl CheckpointService {
    pub fn new(
        db: Arc<Db>,
        bus: Arc<EventBus>,
        workspaces: Arc<WorkspaceManager>,
        watchers: Arc<WatcherRegistry>,
    ) -> Self {
        Self {
            db,
            bus,
            workspaces,
            watchers,
        }
    }

    /// Snapshot the workspace onto the assistant message at `sequence`.
    /// Requires a clean workspace; a dirty one skips silently.
    pub async fn create_checkpoint(
        &self,
        task_id: &str,
        sequence: i64,
    ) -> Result<Option<Checkpoint>> {
        let executor = self.workspaces.get_executor(task_id)?;
        let git = GitService::new(executor);
        if git.has_changes().await? {
            debug!(task_id, sequence, "workspace dirty, skipping checkpoint");
            return Ok(None);
        }
        let commit_sha = git.get_current_commit_sha().await?;
        let todo_snapshot = self.db.list_todos(task_id)?;
        let checkpoint = Checkpoint {
            commit_sha,
            todo_snapshot,
            created_at: Utc::now(),
            workspace_state: "clean".to_string(),
        };
        self.db
            .set_message_checkpoint(task_id, sequence, &checkpoint)?;
        info!(task_id, sequence, sha = %checkpoint.commit_sha, "checkpoint created");
        Ok(Some(checkpoint))
    }

    /// Time-travel to the state recorded at the most recent assistant
    /// checkpoint strictly before `target_sequence`, or to the base commit
    /// with empty todos when there is none.
    pub async fn restore_checkpoint(&self, task_id: &str, target_sequence: i64) -> Result<()> {
        let task = self
            .db
            .get_task(task_id)?
            .ok_or_else(|| anyhow!("task not found: {task_id}"))?;

        let (commit_sha, todo_snapshot): (String, Vec<Todo>) =
            match self.db.find_checkpoint_before(task_id, target_sequence)? {
                Some((_, checkpoint)) => (checkpoint.commit_sha, checkpoint.todo_snapshot),
                None => (task.base_commit_sha.clone(), Vec::new()),
            };
        info!(task_id, target_sequence, sha = %commit_sha, "restoring checkpoint");

        // Suppress spurious fs-change events while the tree moves under us.
        let watcher = self.watchers.get(task_id).await;
        if let Some(watcher) = &watcher {
            if let Err(e) = watcher.pause().await {
                warn!(task_id, "watcher pause failed: {e}");
            }
        }

        let executor = self.workspaces.get_executor(task_id)?;
        let git = GitService::new(Arc::clone(&executor));
        if !commit_sha.is_empty() {
            match git.safe_checkout_commit(&commit_sha).await {
                Ok(true) => {}
                Ok(false) => warn!(task_id, sha = %commit_sha, "checkout refused, continuing"),
                Err(e) => warn!(task_id, sha = %commit_sha, "checkout error, continuing: {e}"),
            }
        }

        let snapshot: Vec<NewTodo> = todo_snapshot
            .iter()
            .map(|t| NewTodo {
                content: t.content.clone(),
                status: t.status,
                sequence: t.sequence,
            })
            .collect();
        let todos = self.db.replace_todos(task_id, &snapshot)?;
        let completed = todos
            .iter()
            .filter(|t| t.status == TodoStatus::Completed)
            .count();
        self.bus
            .publish(
                task_id,
                StreamChunk::TodoUpdate {
                    total_count: todos.len(),
                    completed_count: completed,
                    todos,
                    action: "replaced".to_string(),
                },
            )
            .await;

        tokio::time::sleep(GIT_SETTLE).await;

        // The override is the authoritative post-restore file view; the
        // watcher stays paused so nothing races ahead of it.
        let changes = git
            .get_file_changes(&task.base_branch)
            .await
            .unwrap_or_default();
        let tree = executor
            .list_directory_recursive(".")
            .await
            .unwrap_or_default();
        self.bus
            .publish(
                task_id,
                StreamChunk::FsOverride {
                    file_changes: changes.file_changes,
                    diff_stats: changes.diff_stats,
                    codebase_tree: tree,
                    message: format!("Workspace restored to {commit_sha}"),
                },
            )
            .await;

        tokio::time::sleep(WATCHER_RESUME_DELAY).await;
        if let Some(watcher) = &watcher {
            if let Err(e) = watcher.resume().await {
                warn!(task_id, "watcher resume failed: {e}");
            }
        }
        Ok(())
    }
}
