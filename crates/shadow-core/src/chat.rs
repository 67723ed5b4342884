use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointService;
use crate::config::{AgentMode, Config};
use crate::db::Db;
use crate::events::EventBus;
use crate::git::{AutoCommitContext, GitService};
use crate::init::InitEngine;
use crate::llm::{LlmClient, LlmMessage, StreamChunk, StreamRequest};
use crate::pr::PrService;
use crate::executor::GitIdentity;
use crate::terminal::TerminalPoller;
use crate::tools::ToolRouter;
use crate::types::{
    MessageMetadata, MessagePart, MessageRole, Task, TaskStatus, ToolMeta, Usage,
};
use crate::watcher::{FsWatcher, RemoteWatcherControl, WatcherRegistry};
use crate::workspace::{sidecar_base_url, WorkspaceManager};

/// Poll interval while waiting for an interrupted stream to wind down.
const STREAM_EXIT_POLL: Duration = Duration::from_millis(100);
/// Upper bound on that wait.
const STREAM_EXIT_MAX: Duration = Duration::from_secs(10);
/// Tool message placeholder until its result lands.
const TOOL_RUNNING_CONTENT: &str = "Running...";

// ── Inputs ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ProcessInput {
    pub task_id: String,
    pub user_message: String,
    pub llm_model: String,
    pub user_api_keys: HashMap<String, String>,
    pub enable_tools: bool,
    pub skip_user_message_save: bool,
    pub workspace_path: Option<String>,
    pub queue: bool,
}

impl ProcessInput {
    pub fn new(
        task_id: impl Into<String>,
        user_message: impl Into<String>,
        llm_model: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            user_message: user_message.into(),
            llm_model: llm_model.into(),
            user_api_keys: HashMap::new(),
            enable_tools: true,
            skip_user_message_save: false,
            workspace_path: None,
            queue: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EditInput {
    pub task_id: String,
    pub message_id: i64,
    pub new_content: String,
    pub new_model: String,
    pub user_api_keys: HashMap<String, String>,
}

// ── Per-task concurrency registry ─────────────────────────────────────────

#[derive(Debug, Clone)]
struct QueuedMessage {
    user_message: String,
    llm_model: String,
    user_api_keys: HashMap<String, String>,
    workspace_path: Option<String>,
}

/// Active-stream handles, stop flags and the at-most-one queued message per
/// task. All mutations go through the engine's methods under this one lock.
#[derive(Default)]
struct StreamRegistry {
    active: HashMap<String, CancellationToken>,
    stop_requested: HashSet<String>,
    queued: HashMap<String, QueuedMessage>,
}

// ── Stream run accounting ─────────────────────────────────────────────────

enum RunOutcome {
    Completed,
    Stopped,
    Errored,
}

struct StreamRun {
    outcome: RunOutcome,
    assistant_seq: Option<i64>,
    parts: Vec<MessagePart>,
    usage: Option<Usage>,
    finish_reason: Option<String>,
}

// ── Engine ────────────────────────────────────────────────────────────────

/// The core LLM loop: assembles context, drives streaming tool-calling,
/// persists messages incrementally and enforces the per-task concurrency
/// rules (queue / interrupt / edit-rewind).
pub struct ChatEngine {
    config: Arc<Config>,
    db: Arc<Db>,
    bus: Arc<EventBus>,
    llm: Arc<dyn LlmClient>,
    workspaces: Arc<WorkspaceManager>,
    checkpoints: Arc<CheckpointService>,
    watchers: Arc<WatcherRegistry>,
    init: Option<Arc<InitEngine>>,
    pr: Option<Arc<PrService>>,
    terminal: Arc<TerminalPoller>,
    registry: Mutex<StreamRegistry>,
}

impl ChatEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        db: Arc<Db>,
        bus: Arc<EventBus>,
        llm: Arc<dyn LlmClient>,
        workspaces: Arc<WorkspaceManager>,
        checkpoints: Arc<CheckpointService>,
        watchers: Arc<WatcherRegistry>,
        init: Option<Arc<InitEngine>>,
        pr: Option<Arc<PrService>>,
    ) -> Arc<Self> {
        let terminal = TerminalPoller::new(Arc::clone(&bus));
        Arc::new(Self {
            config,
            db,
            bus,
            llm,
            workspaces,
            checkpoints,
            watchers,
            init,
            pr,
            terminal,
            registry: Mutex::new(StreamRegistry::default()),
        })
    }

    // ── Entry point ───────────────────────────────────────────────────────

    pub async fn process_user_message(self: &Arc<Self>, input: ProcessInput) -> Result<()> {
        let task_id = input.task_id.clone();
        let Some(task) = self.db.get_task(&task_id)? else {
            bail!("task not found: {task_id}");
        };

        // Follow-up reconciliation for finished tasks.
        match task.status {
            TaskStatus::Archived => bail!("task {task_id} is archived"),
            TaskStatus::Completed | TaskStatus::Stopped => {
                if task.scheduled_cleanup_at.is_some() {
                    self.db.clear_scheduled_cleanup(&task_id)?;
                    self.db.update_task_status(&task_id, TaskStatus::Running)?;
                } else {
                    // Workspace already torn down: hand back to the
                    // initializer instead of racing it here.
                    self.db
                        .update_task_status(&task_id, TaskStatus::Initializing)?;
                    self.db
                        .set_init_status(&task_id, crate::types::InitStatus::Inactive)?;
                    info!(task_id = %task_id, "task needs re-initialization before processing");
                    return Ok(());
                }
            }
            _ => {}
        }

        // Remote infra check: a dead sandbox on an ACTIVE task is rebuilt
        // before the message is processed.
        if let Some(init) = &self.init {
            init.ensure_ready(&task_id).await?;
        }

        // Concurrency gating: queue behind or interrupt the active stream.
        {
            let mut registry = self.registry.lock().await;
            if let Some(token) = registry.active.get(&task_id).cloned() {
                if input.queue {
                    registry.queued.insert(
                        task_id.clone(),
                        QueuedMessage {
                            user_message: input.user_message.clone(),
                            llm_model: input.llm_model.clone(),
                            user_api_keys: input.user_api_keys.clone(),
                            workspace_path: input.workspace_path.clone(),
                        },
                    );
                    debug!(task_id = %task_id, "message queued behind active stream");
                    return Ok(());
                }
                registry.stop_requested.insert(task_id.clone());
                token.cancel();
                drop(registry);
                self.wait_for_stream_exit(&task_id).await;
                let mut registry = self.registry.lock().await;
                registry.queued.remove(&task_id);
                drop(registry);
                // The interrupted stream finalized the task as STOPPED.
                self.db.clear_scheduled_cleanup(&task_id)?;
                self.db.update_task_status(&task_id, TaskStatus::Running)?;
            }
        }

        // Persist the user message.
        let saved_seq = if input.skip_user_message_save {
            None
        } else {
            let seq = self.db.next_sequence(&task_id)?;
            self.db.insert_message(
                &task_id,
                MessageRole::User,
                seq,
                &input.user_message,
                &input.llm_model,
                &MessageMetadata::default(),
            )?;
            self.db.touch_task(&task_id)?;
            Some(seq)
        };

        let messages = self.build_context(&task_id, &input, saved_seq)?;
        let task = self
            .db
            .get_task(&task_id)?
            .ok_or_else(|| anyhow!("task vanished: {task_id}"))?;

        // Begin the stream; invariant: at most one per task.
        let cancel = CancellationToken::new();
        {
            let mut registry = self.registry.lock().await;
            if registry.active.contains_key(&task_id) {
                bail!("stream already active for task {task_id}");
            }
            registry.active.insert(task_id.clone(), cancel.clone());
            registry.stop_requested.remove(&task_id);
        }
        self.ensure_watcher(&task).await;
        self.db.update_task_status(&task_id, TaskStatus::Running)?;
        self.bus.start_stream(&task_id).await;

        let run = self.drive_stream(&task, &input, messages, cancel).await;
        let queued = self.finalize(&task, &input, run).await;

        // Close the stream before releasing the registry entry so an
        // interrupter cannot begin its own stream and then observe this
        // one's end_stream.
        self.bus.end_stream(&task_id).await;
        {
            let mut registry = self.registry.lock().await;
            registry.active.remove(&task_id);
            registry.stop_requested.remove(&task_id);
        }

        if let Some(next) = queued {
            let follow_up = ProcessInput {
                task_id: task_id.clone(),
                user_message: next.user_message,
                llm_model: next.llm_model,
                user_api_keys: next.user_api_keys,
                enable_tools: input.enable_tools,
                skip_user_message_save: false,
                workspace_path: next.workspace_path,
                queue: false,
            };
            Box::pin(self.process_user_message(follow_up)).await?;
        }
        Ok(())
    }

    // ── Stop / edit / cleanup ─────────────────────────────────────────────

    /// Request cancellation of the task's active stream. The stream loop
    /// honors the flag at the next chunk boundary.
    pub async fn stop(&self, task_id: &str) -> Result<()> {
        let mut registry = self.registry.lock().await;
        registry.stop_requested.insert(task_id.to_string());
        if let Some(token) = registry.active.get(task_id) {
            token.cancel();
        }
        drop(registry);
        self.db.update_task_status(task_id, TaskStatus::Stopped)?;
        info!(task_id, "stop requested");
        Ok(())
    }

    /// Rewrite a user message, truncate everything after it, restore the
    /// workspace to the prior checkpoint and re-drive the conversation.
    pub async fn edit_user_message(self: &Arc<Self>, input: EditInput) -> Result<()> {
        let task_id = input.task_id.clone();

        // Stop any active stream and discard the queue.
        {
            let mut registry = self.registry.lock().await;
            if let Some(token) = registry.active.get(&task_id).cloned() {
                registry.stop_requested.insert(task_id.clone());
                token.cancel();
            }
            registry.queued.remove(&task_id);
        }
        self.wait_for_stream_exit(&task_id).await;

        let message = self
            .db
            .get_message(input.message_id)?
            .ok_or_else(|| anyhow!("message not found: {}", input.message_id))?;
        if message.task_id != task_id {
            bail!("message {} does not belong to task {task_id}", input.message_id);
        }
        if message.role != MessageRole::User {
            bail!("only user messages can be edited");
        }

        self.db
            .update_message_for_edit(input.message_id, &input.new_content, &input.new_model)?;
        let deleted = self.db.delete_messages_after(&task_id, message.sequence)?;
        debug!(task_id = %task_id, deleted, "truncated history after edited message");

        self.checkpoints
            .restore_checkpoint(&task_id, message.sequence)
            .await?;

        Box::pin(self.process_user_message(ProcessInput {
            task_id,
            user_message: input.new_content,
            llm_model: input.new_model,
            user_api_keys: input.user_api_keys,
            enable_tools: true,
            skip_user_message_save: true,
            workspace_path: None,
            queue: false,
        }))
        .await
    }

    /// Drop all in-memory per-task state. Durable state is untouched.
    pub async fn cleanup_task(&self, task_id: &str) {
        {
            let mut registry = self.registry.lock().await;
            if let Some(token) = registry.active.remove(task_id) {
                token.cancel();
            }
            registry.stop_requested.remove(task_id);
            registry.queued.remove(task_id);
        }
        self.terminal.stop(task_id).await;
        self.bus.remove_task(task_id).await;
        self.watchers.remove(task_id).await;
    }

    pub async fn has_active_stream(&self, task_id: &str) -> bool {
        self.registry.lock().await.active.contains_key(task_id)
    }

    // ── Internals ─────────────────────────────────────────────────────────

    async fn wait_for_stream_exit(&self, task_id: &str) {
        let deadline = tokio::time::Instant::now() + STREAM_EXIT_MAX;
        loop {
            if !self.has_active_stream(task_id).await {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(task_id, "active stream did not exit in time");
                return;
            }
            tokio::time::sleep(STREAM_EXIT_POLL).await;
        }
    }

    async fn is_stop_requested(&self, task_id: &str) -> bool {
        self.registry.lock().await.stop_requested.contains(task_id)
    }

    /// Full history ordered by (sequence, createdAt), filtered to user and
    /// assistant roles (tool output lives as parts on assistant messages),
    /// without the trailing copy of the message being processed.
    fn build_context(
        &self,
        task_id: &str,
        input: &ProcessInput,
        saved_seq: Option<i64>,
    ) -> Result<Vec<LlmMessage>> {
        let history = self.db.get_messages(task_id)?;
        let excluded_seq = saved_seq.or_else(|| {
            history.last().and_then(|last| {
                (last.role == MessageRole::User && last.content == input.user_message)
                    .then_some(last.sequence)
            })
        });
        let mut messages: Vec<LlmMessage> = history
            .iter()
            .filter(|m| Some(m.sequence) != excluded_seq)
            .filter_map(|m| {
                let role = match m.role {
                    MessageRole::User => "user",
                    MessageRole::Assistant => "assistant",
                    MessageRole::Tool => return None,
                };
                Some(LlmMessage {
                    role: role.to_string(),
                    content: m.content.clone(),
                })
            })
            .collect();
        messages.push(LlmMessage {
            role: "user".to_string(),
            content: input.user_message.clone(),
        });
        Ok(messages)
    }

    fn build_system_prompt(&self, task: &Task) -> String {
        let mut prompt = format!(
            "You are Shadow, an autonomous coding agent working on {} \
             (base branch {}, your branch {}). Use the available tools to read, \
             edit and run code in the workspace. Keep the todo list current \
             with todo_write as you work.",
            task.repo_full_name, task.base_branch, task.shadow_branch
        );
        if let Ok(Some(understanding)) =
            self.db.get_codebase_understanding(&task.repo_full_name)
        {
            if let Some(summary) = understanding.summary["summary"].as_str() {
                prompt.push_str("\n\nRepository overview:\n");
                prompt.push_str(summary);
            }
        }
        prompt
    }

    async fn ensure_watcher(&self, task: &Task) {
        if self.watchers.get(&task.id).await.is_some() {
            return;
        }
        let control: Arc<dyn crate::watcher::WatcherControl> =
            match self.config.agent_mode {
                AgentMode::Local => {
                    FsWatcher::spawn(task.id.clone(), task.workspace_path.clone(), Arc::clone(&self.bus))
                }
                AgentMode::Remote => Arc::new(RemoteWatcherControl::new(sidecar_base_url(
                    &task.id,
                    &self.config.sandbox_namespace,
                ))),
            };
        self.watchers.register(&task.id, control).await;
    }

    // ── Stream driver ─────────────────────────────────────────────────────

    async fn drive_stream(
        &self,
        task: &Task,
        input: &ProcessInput,
        messages: Vec<LlmMessage>,
        cancel: CancellationToken,
    ) -> Result<StreamRun> {
        let task_id = task.id.clone();
        let executor = self.workspaces.get_executor(&task_id)?;
        // Remote terminals are observed by polling the sidecar; the local
        // executor publishes through the same channel.
        if self.config.agent_mode == AgentMode::Remote {
            self.terminal.start(&task_id, Arc::clone(&executor)).await;
        }
        let router = Arc::new(ToolRouter::new(
            task_id.clone(),
            executor,
            Arc::clone(&self.db),
            Arc::clone(&self.bus),
        ));
        let workspace_path = input
            .workspace_path
            .clone()
            .unwrap_or_else(|| task.workspace_path.clone());

        let mut rx = self
            .llm
            .create_message_stream(StreamRequest {
                task_id: task_id.clone(),
                system_prompt: self.build_system_prompt(task),
                messages,
                model: input.llm_model.clone(),
                user_api_keys: input.user_api_keys.clone(),
                enable_tools: input.enable_tools,
                workspace_path,
                tools: input.enable_tools.then(|| Arc::clone(&router)),
                cancel: cancel.clone(),
            })
            .await?;

        let mut run = StreamRun {
            outcome: RunOutcome::Completed,
            assistant_seq: None,
            parts: Vec::new(),
            usage: None,
            finish_reason: None,
        };
        // toolCallId → sequence of its persisted TOOL message.
        let mut tool_sequences: HashMap<String, i64> = HashMap::new();

        while let Some(chunk) = rx.recv().await {
            if self.is_stop_requested(&task_id).await {
                run.outcome = RunOutcome::Stopped;
                return Ok(run);
            }
            self.bus.publish(&task_id, chunk.clone()).await;

            match chunk {
                StreamChunk::Content { content } => {
                    match run.parts.last_mut() {
                        Some(MessagePart::Text { text }) => text.push_str(&content),
                        _ => run.parts.push(MessagePart::Text { text: content }),
                    }
                    self.upsert_assistant(&task_id, input, &mut run, true)?;
                }
                StreamChunk::ToolCall { id, name, args } => {
                    run.parts.push(MessagePart::ToolCall {
                        id: id.clone(),
                        name: name.clone(),
                        args: args.clone(),
                    });
                    self.upsert_assistant(&task_id, input, &mut run, true)?;

                    let tool_seq = self.db.next_sequence(&task_id)?;
                    self.db.insert_message(
                        &task_id,
                        MessageRole::Tool,
                        tool_seq,
                        TOOL_RUNNING_CONTENT,
                        &input.llm_model,
                        &MessageMetadata {
                            is_streaming: true,
                            tool: Some(ToolMeta {
                                name,
                                args,
                                status: "RUNNING".to_string(),
                            }),
                            ..Default::default()
                        },
                    )?;
                    tool_sequences.insert(id, tool_seq);
                }
                StreamChunk::ToolResult { id, result } => {
                    let (name, args) = run
                        .parts
                        .iter()
                        .rev()
                        .find_map(|p| match p {
                            MessagePart::ToolCall {
                                id: call_id,
                                name,
                                args,
                            } if *call_id == id => Some((name.clone(), args.clone())),
                            _ => None,
                        })
                        .unwrap_or_else(|| ("unknown".to_string(), serde_json::Value::Null));
                    run.parts.push(MessagePart::ToolResult {
                        id: id.clone(),
                        name: name.clone(),
                        result: result.clone(),
                    });
                    self.upsert_assistant(&task_id, input, &mut run, true)?;

                    if let Some(tool_seq) = tool_sequences.get(&id) {
                        self.db.update_message(
                            &task_id,
                            *tool_seq,
                            &result.to_string(),
                            &MessageMetadata {
                                is_streaming: false,
                                tool: Some(ToolMeta {
                                    name,
                                    args,
                                    status: "COMPLETED".to_string(),
                                }),
                                ..Default::default()
                            },
                        )?;
                    }
                }
                StreamChunk::Usage {
                    prompt_tokens,
                    completion_tokens,
                    total_tokens,
                } => {
                    run.usage = Some(Usage {
                        prompt_tokens,
                        completion_tokens,
                        total_tokens,
                    });
                }
                StreamChunk::Complete { finish_reason } => {
                    run.finish_reason = Some(finish_reason);
                }
                StreamChunk::Error { error, .. } => {
                    run.parts.push(MessagePart::Error {
                        message: error.clone(),
                    });
                    run.finish_reason = Some("error".to_string());
                    self.upsert_assistant(&task_id, input, &mut run, false)?;
                    self.db.update_task_status(&task_id, TaskStatus::Failed)?;
                    warn!(task_id = %task_id, "stream failed: {error}");
                    run.outcome = RunOutcome::Errored;
                    return Ok(run);
                }
                // Engine-originated chunk kinds never come from the client.
                _ => {}
            }
        }

        if self.is_stop_requested(&task_id).await {
            run.outcome = RunOutcome::Stopped;
        }
        Ok(run)
    }

    /// Create the assistant row on the first streamed event, then keep its
    /// content (concatenated text parts) and parts up to date.
    fn upsert_assistant(
        &self,
        task_id: &str,
        input: &ProcessInput,
        run: &mut StreamRun,
        streaming: bool,
    ) -> Result<()> {
        let metadata = MessageMetadata {
            parts: run.parts.clone(),
            usage: run.usage,
            finish_reason: run.finish_reason.clone(),
            is_streaming: streaming,
            checkpoint: None,
            tool: None,
        };
        let content = text_content(&run.parts);
        match run.assistant_seq {
            Some(seq) => self.db.update_message(task_id, seq, &content, &metadata)?,
            None => {
                let seq = self.db.next_sequence(task_id)?;
                self.db.insert_message(
                    task_id,
                    MessageRole::Assistant,
                    seq,
                    &content,
                    &input.llm_model,
                    &metadata,
                )?;
                run.assistant_seq = Some(seq);
            }
        }
        Ok(())
    }

    // ── Finalization ──────────────────────────────────────────────────────

    /// Close out the run: persist final message state, transition the task,
    /// schedule cleanup, and on success commit/checkpoint/PR. Returns the
    /// queued follow-up to process, if any.
    async fn finalize(
        &self,
        task: &Task,
        input: &ProcessInput,
        run: Result<StreamRun>,
    ) -> Option<QueuedMessage> {
        let task_id = &task.id;
        let run = match run {
            Ok(run) => run,
            Err(e) => {
                warn!(task_id = %task_id, "stream setup failed: {e:#}");
                self.bus
                    .publish(
                        task_id,
                        StreamChunk::Error {
                            error: e.to_string(),
                            finish_reason: "error".to_string(),
                        },
                    )
                    .await;
                let _ = self.db.update_task_status(task_id, TaskStatus::Failed);
                self.registry.lock().await.queued.remove(task_id);
                return None;
            }
        };

        match run.outcome {
            RunOutcome::Errored => {
                // Failed turn: discard any queued message.
                self.registry.lock().await.queued.remove(task_id);
                None
            }
            RunOutcome::Stopped => {
                if run.assistant_seq.is_some() {
                    let mut finalized = run;
                    finalized.finish_reason =
                        Some(finalized.finish_reason.unwrap_or_else(|| "stopped".into()));
                    let _ = self.upsert_assistant(task_id, input, &mut finalized, false);
                }
                let _ = self.db.update_task_status(task_id, TaskStatus::Stopped);
                let _ = self.schedule_cleanup(task_id);
                self.take_queued(task_id).await
            }
            RunOutcome::Completed => {
                let mut finalized = run;
                if finalized.assistant_seq.is_some() {
                    let _ = self.upsert_assistant(task_id, input, &mut finalized, false);
                }
                let _ = self.db.update_task_status(task_id, TaskStatus::Completed);
                let _ = self.schedule_cleanup(task_id);
                let _ = self.db.touch_task(task_id);

                self.commit_and_checkpoint(task, input, finalized.assistant_seq)
                    .await;
                self.take_queued(task_id).await
            }
        }
    }

    async fn take_queued(&self, task_id: &str) -> Option<QueuedMessage> {
        self.registry.lock().await.queued.remove(task_id)
    }

    fn schedule_cleanup(&self, task_id: &str) -> Result<()> {
        let at = Utc::now().timestamp() + self.config.cleanup_delay_s;
        self.db.schedule_cleanup(task_id, at)
    }

    async fn commit_and_checkpoint(
        &self,
        task: &Task,
        input: &ProcessInput,
        assistant_seq: Option<i64>,
    ) {
        let executor = match self.workspaces.get_executor(&task.id) {
            Ok(executor) => executor,
            Err(e) => {
                warn!(task_id = %task.id, "no executor for finalization: {e}");
                return;
            }
        };
        let git = GitService::new(executor);
        let committed = match git
            .commit_changes_if_any(AutoCommitContext {
                user: GitIdentity {
                    name: self.config.git_user_name.clone(),
                    email: self.config.git_user_email.clone(),
                },
                co_author: GitIdentity {
                    name: self.config.co_author_name.clone(),
                    email: self.config.co_author_email.clone(),
                },
                shadow_branch: &task.shadow_branch,
                llm: Some(self.llm.as_ref()),
                model: &self.config.small_model,
                user_api_keys: &input.user_api_keys,
            })
            .await
        {
            Ok(result) => result,
            Err(e) => {
                warn!(task_id = %task.id, "auto-commit failed (continuing): {e:#}");
                None
            }
        };

        // Checkpoints attach to the final assistant message once the
        // workspace is clean again. This includes edit-driven runs.
        if let Some(seq) = assistant_seq {
            if let Err(e) = self.checkpoints.create_checkpoint(&task.id, seq).await {
                warn!(task_id = %task.id, "checkpoint creation failed: {e:#}");
            }
        }

        if committed.is_some() && self.config.auto_pull_request {
            if let Some(pr) = &self.pr {
                if let Err(e) = pr
                    .maybe_open_pr(task, &git, true, &input.user_api_keys)
                    .await
                {
                    warn!(task_id = %task.id, "auto-PR failed (continuing): {e:#}");
                }
            }
        }
    }
}

/// Concatenation of the text parts, the message's textual projection.
fn text_content(parts: &[MessagePart]) -> String {
    parts
        .iter()
        .filter_map(|p| match p {
            MessagePart::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_content_concatenates_text_parts_only() {
        let parts = vec![
            MessagePart::Text { text: "a".into() },
            MessagePart::ToolCall {
                id: "1".into(),
                name: "read_file".into(),
                args: serde_json::Value::Null,
            },
            MessagePart::Text { text: "b".into() },
        ];
        assert_eq!(text_content(&parts), "ab");
    }

    #[test]
    fn process_input_defaults() {
        let input = ProcessInput::new("t1", "hello", "model-x");
        assert!(input.enable_tools);
        assert!(!input.skip_user_message_save);
        assert!(!input.queue);
        assert!(input.workspace_path.is_none());
    }
}
