pub mod local;
pub mod remote;

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::TerminalEntry;

// ── Errors ────────────────────────────────────────────────────────────────

/// Typed failure for workspace operations. Tool misuse kinds (`InvalidRange`,
/// `Ambiguous`) flow back into the LLM loop as tool results; infrastructure
/// kinds (`Unhealthy`, `Timeout`) drive retries and re-initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    NotFound(String),
    InvalidRange(String),
    Ambiguous(String),
    Timeout(String),
    Unhealthy(String),
    AuthFailed(String),
    Failed(String),
}

impl ExecError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NotFound",
            Self::InvalidRange(_) => "InvalidRange",
            Self::Ambiguous(_) => "Ambiguous",
            Self::Timeout(_) => "Timeout",
            Self::Unhealthy(_) => "Unhealthy",
            Self::AuthFailed(_) => "AuthFailed",
            Self::Failed(_) => "Failed",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::NotFound(m)
            | Self::InvalidRange(m)
            | Self::Ambiguous(m)
            | Self::Timeout(m)
            | Self::Unhealthy(m)
            | Self::AuthFailed(m)
            | Self::Failed(m) => m,
        }
    }
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind(), self.message())
    }
}

impl std::error::Error for ExecError {}

pub type ExecResult<T> = Result<T, ExecError>;

// ── Operation inputs ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Read the whole file regardless of start/end.
    pub entire: bool,
    /// 1-based inclusive start line.
    pub start: Option<usize>,
    /// 1-based inclusive end line.
    pub end: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct GrepOptions {
    pub include: Option<String>,
    pub exclude: Option<String>,
    pub case_sensitive: bool,
}

#[derive(Debug, Clone)]
pub struct CommandOptions {
    pub timeout_s: u64,
    pub background: bool,
    pub network_allowed: bool,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            timeout_s: 30,
            background: false,
            network_allowed: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitIdentity {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRequest {
    pub user: GitIdentity,
    pub co_author: GitIdentity,
    pub message: String,
}

// ── Operation results ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReadResult {
    pub content: String,
    pub start_line: usize,
    pub end_line: usize,
    pub total_lines: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteResult {
    pub is_new_file: bool,
    pub lines_added: usize,
    pub lines_removed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchReplaceResult {
    pub replaced: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResult {
    pub was_already_deleted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Folder,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub relative_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrepMatch {
    pub path: String,
    pub line: usize,
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GrepResult {
    pub matches: Vec<GrepMatch>,
    /// True when results were capped at the match limit.
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeSnippet {
    pub path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub content: String,
    pub score: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// Set for background launches, which return once spawned.
    pub background: bool,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitResult {
    pub committed: bool,
    pub commit_sha: String,
}

// ── Limits ────────────────────────────────────────────────────────────────

/// Fuzzy filename search returns at most this many matches.
pub const MAX_FILE_SEARCH_RESULTS: usize = 10;
/// Grep returns at most this many matching lines.
pub const MAX_GREP_MATCHES: usize = 50;
/// Codebase search returns at most this many snippets.
pub const MAX_CODE_SNIPPETS: usize = 5;

// ── Path handling ─────────────────────────────────────────────────────────

/// Resolve a tool-supplied path against the workspace root. A leading `/` is
/// stripped; `..` traversal outside the workspace is rejected.
pub fn resolve_workspace_path(root: &Path, path: &str) -> ExecResult<PathBuf> {
    let trimmed = path.trim().trim_start_matches('/');
    let rel = Path::new(trimmed);
    let mut depth: i64 = 0;
    for component in rel.components() {
        match component {
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return Err(ExecError::InvalidRange(format!(
                        "path escapes the workspace: {path}"
                    )));
                }
            }
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {
                return Err(ExecError::InvalidRange(format!("invalid path: {path}")));
            }
        }
    }
    Ok(root.join(rel))
}

// ── Executor trait ────────────────────────────────────────────────────────

/// Uniform interface for file, search, command, git and terminal operations
/// against a task workspace. The local and remote variants must present
/// identical result shapes for identical inputs.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn read_file(&self, path: &str, opts: ReadOptions) -> ExecResult<FileReadResult>;
    async fn write_file(&self, path: &str, content: &str, instructions: &str)
        -> ExecResult<WriteResult>;
    async fn search_replace(&self, path: &str, old: &str, new: &str)
        -> ExecResult<SearchReplaceResult>;
    async fn delete_file(&self, path: &str) -> ExecResult<DeleteResult>;
    async fn list_directory(&self, path: &str) -> ExecResult<Vec<DirEntry>>;
    async fn list_directory_recursive(&self, path: &str) -> ExecResult<Vec<DirEntry>>;
    async fn search_files(&self, query: &str) -> ExecResult<Vec<String>>;
    async fn grep_search(&self, query: &str, opts: GrepOptions) -> ExecResult<GrepResult>;
    async fn codebase_search(&self, query: &str, dirs: &[String]) -> ExecResult<Vec<CodeSnippet>>;
    async fn execute_command(&self, cmd: &str, opts: CommandOptions) -> ExecResult<CommandResult>;

    // Git surface mapped to dedicated sidecar endpoints in remote mode.
    async fn git_status(&self) -> ExecResult<String>;
    async fn git_diff(&self, base: Option<&str>) -> ExecResult<String>;
    async fn git_commit(&self, req: &CommitRequest) -> ExecResult<CommitResult>;
    async fn git_push(&self, branch: &str, set_upstream: bool) -> ExecResult<()>;

    // Terminal history for the workspace.
    async fn terminal_history(&self, since_id: u64) -> ExecResult<Vec<TerminalEntry>>;
    async fn terminal_clear(&self) -> ExecResult<()>;

    fn workspace_path(&self) -> &str;
    fn is_remote(&self) -> bool;
    fn task_id(&self) -> &str;
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_slash_is_stripped() {
        let root = Path::new("/ws");
        let p = resolve_workspace_path(root, "/src/main.rs").unwrap();
        assert_eq!(p, Path::new("/ws/src/main.rs"));
    }

    #[test]
    fn relative_paths_resolve_under_root() {
        let root = Path::new("/ws");
        let p = resolve_workspace_path(root, "a/b.txt").unwrap();
        assert_eq!(p, Path::new("/ws/a/b.txt"));
    }

    #[test]
    fn traversal_outside_workspace_is_rejected() {
        let root = Path::new("/ws");
        assert!(resolve_workspace_path(root, "../etc/passwd").is_err());
        assert!(resolve_workspace_path(root, "a/../../etc").is_err());
        // `..` that stays inside the workspace is fine.
        assert!(resolve_workspace_path(root, "a/../b.txt").is_ok());
    }

    #[test]
    fn exec_error_display_includes_kind() {
        let e = ExecError::NotFound("missing.txt".into());
        assert_eq!(e.to_string(), "NotFound: missing.txt");
        assert_eq!(e.kind(), "NotFound");
    }

    #[test]
    fn dir_entry_serializes_kind_as_type() {
        let entry = DirEntry {
            name: "src".into(),
            kind: EntryKind::Folder,
            relative_path: "src".into(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains(r#""type":"folder""#));
    }
}
