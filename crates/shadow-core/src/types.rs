use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Task lifecycle ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Initializing,
    Running,
    Completed,
    Stopped,
    Failed,
    /// Terminal: the task can never be resumed.
    Archived,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "INITIALIZING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
            Self::Archived => "ARCHIVED",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "RUNNING" => Self::Running,
            "COMPLETED" => Self::Completed,
            "STOPPED" => Self::Stopped,
            "FAILED" => Self::Failed,
            "ARCHIVED" => Self::Archived,
            _ => Self::Initializing,
        }
    }
}

/// Initialization step the task is currently in. Doubles as the step
/// identifier for the init engine's ordered step lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InitStatus {
    Inactive,
    PrepareWorkspace,
    CreateVm,
    WaitVmReady,
    VerifyVmWorkspace,
    StartBackgroundServices,
    InstallDependencies,
    CompleteShadowWiki,
    Active,
}

impl InitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "INACTIVE",
            Self::PrepareWorkspace => "PREPARE_WORKSPACE",
            Self::CreateVm => "CREATE_VM",
            Self::WaitVmReady => "WAIT_VM_READY",
            Self::VerifyVmWorkspace => "VERIFY_VM_WORKSPACE",
            Self::StartBackgroundServices => "START_BACKGROUND_SERVICES",
            Self::InstallDependencies => "INSTALL_DEPENDENCIES",
            Self::CompleteShadowWiki => "COMPLETE_SHADOW_WIKI",
            Self::Active => "ACTIVE",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "PREPARE_WORKSPACE" => Self::PrepareWorkspace,
            "CREATE_VM" => Self::CreateVm,
            "WAIT_VM_READY" => Self::WaitVmReady,
            "VERIFY_VM_WORKSPACE" => Self::VerifyVmWorkspace,
            "START_BACKGROUND_SERVICES" => Self::StartBackgroundServices,
            "INSTALL_DEPENDENCIES" => Self::InstallDependencies,
            "COMPLETE_SHADOW_WIKI" => Self::CompleteShadowWiki,
            "ACTIVE" => Self::Active,
            _ => Self::Inactive,
        }
    }
}

/// A long-lived unit of work bound to one repository, as stored in the
/// database.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    pub repo_full_name: String,
    pub repo_url: String,
    pub base_branch: String,
    /// Branch the agent commits to (default `shadow/task-<id>`), leaving the
    /// user's base branch untouched.
    pub shadow_branch: String,
    pub base_commit_sha: String,
    /// Set iff a workspace has been materialized at least once.
    pub workspace_path: String,
    pub status: TaskStatus,
    pub init_status: InitStatus,
    pub initialization_error: String,
    /// Epoch seconds; None = no teardown scheduled.
    pub scheduled_cleanup_at: Option<i64>,
    pub workspace_cleaned_up: bool,
    pub user_id: String,
    pub codebase_understanding_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn shadow_branch_for(id: &str) -> String {
        format!("shadow/task-{id}")
    }
}

// ── Chat messages ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Assistant => "ASSISTANT",
            Self::Tool => "TOOL",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "ASSISTANT" => Self::Assistant,
            "TOOL" => Self::Tool,
            _ => Self::User,
        }
    }
}

/// One ordered piece of a streamed assistant turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessagePart {
    Text { text: String },
    ToolCall { id: String, name: String, args: Value },
    ToolResult { id: String, name: String, result: Value },
    Error { message: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Per-message snapshot enabling time-travel: a git commit plus the todo
/// list as it stood when the assistant turn finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub commit_sha: String,
    pub todo_snapshot: Vec<Todo>,
    pub created_at: DateTime<Utc>,
    /// Always "clean": checkpoints are only taken on a clean workspace.
    pub workspace_state: String,
}

/// Execution state carried on TOOL messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMeta {
    pub name: String,
    pub args: Value,
    /// "RUNNING" until the matching tool-result lands, then "COMPLETED".
    pub status: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    #[serde(default)]
    pub parts: Vec<MessagePart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub is_streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<Checkpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolMeta>,
}

/// An ordered record in a task's conversation. `sequence` is monotonic and
/// gap-free per task; TOOL messages follow the ASSISTANT message whose
/// tool-call part they result from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: i64,
    pub task_id: String,
    pub role: MessageRole,
    pub sequence: i64,
    pub content: String,
    pub llm_model: String,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub metadata: MessageMetadata,
}

// ── Todos ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

impl TodoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "IN_PROGRESS" => Self::InProgress,
            "COMPLETED" => Self::Completed,
            "CANCELLED" => Self::Cancelled,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Todo {
    pub id: i64,
    pub task_id: String,
    pub content: String,
    pub status: TodoStatus,
    pub sequence: i64,
}

// ── Sessions & understanding ─────────────────────────────────────────────

/// Record of a live remote sandbox. At most one active session per task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSession {
    pub id: i64,
    pub task_id: String,
    pub pod_name: String,
    pub pod_namespace: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Opaque JSON repo summary, unique per `repo_full_name` and shared across
/// tasks on the same repo.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodebaseUnderstanding {
    pub id: i64,
    pub repo_full_name: String,
    pub summary: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Workspace ────────────────────────────────────────────────────────────

/// Everything the workspace manager needs to materialize a workspace.
#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    pub id: String,
    pub repo_full_name: String,
    pub repo_url: String,
    pub base_branch: String,
    pub shadow_branch: String,
    pub user_id: String,
}

/// Outcome of `prepare_workspace`.
#[derive(Debug, Clone)]
pub struct PreparedWorkspace {
    pub workspace_path: String,
    pub base_commit_sha: String,
    /// Set in remote mode only.
    pub pod_name: Option<String>,
    pub pod_namespace: Option<String>,
}

// ── File change summaries ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileOp {
    Create,
    Update,
    Delete,
    Rename,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChange {
    pub path: String,
    pub op: FileOp,
    pub additions: u64,
    pub deletions: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffStats {
    pub additions: u64,
    pub deletions: u64,
    pub total_files: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChanges {
    pub file_changes: Vec<FileChange>,
    pub diff_stats: DiffStats,
}

// ── Terminal ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalEntry {
    pub id: u64,
    pub command: String,
    pub output: String,
    pub exit_code: i32,
    pub timestamp: i64,
}

// ── Tests ────────────────────────────────────────────────────────────────
