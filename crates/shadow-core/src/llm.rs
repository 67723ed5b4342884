use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::executor::DirEntry;
use crate::tools::ToolRouter;
use crate::types::{DiffStats, FileChange, TerminalEntry, Todo};

// ── Stream chunks ─────────────────────────────────────────────────────────

/// The closed set of events that flows from the LLM loop (and the engine's
/// own services) through the per-task event bus to connected clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamChunk {
    Content {
        content: String,
    },
    ToolCall {
        id: String,
        name: String,
        args: Value,
    },
    ToolResult {
        id: String,
        result: Value,
    },
    #[serde(rename_all = "camelCase")]
    Usage {
        prompt_tokens: u64,
        completion_tokens: u64,
        total_tokens: u64,
    },
    #[serde(rename_all = "camelCase")]
    Complete {
        finish_reason: String,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        error: String,
        finish_reason: String,
    },
    InitProgress {
        /// "start" | "step-start" | "error" | "complete"
        phase: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TodoUpdate {
        todos: Vec<Todo>,
        /// "replaced" | "updated"
        action: String,
        total_count: usize,
        completed_count: usize,
    },
    #[serde(rename_all = "camelCase")]
    FsChange {
        operation: String,
        file_path: String,
        timestamp: i64,
        is_directory: bool,
    },
    #[serde(rename_all = "camelCase")]
    FsOverride {
        file_changes: Vec<FileChange>,
        diff_stats: DiffStats,
        codebase_tree: Vec<DirEntry>,
        message: String,
    },
    TerminalOutput {
        entry: TerminalEntry,
    },
}

/// Snapshot handed to late subscribers: everything streamed so far plus the
/// buffer position incremental replay can resume from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamState {
    pub content: String,
    pub is_streaming: bool,
    pub buffer_position: usize,
}

// ── Client seam ───────────────────────────────────────────────────────────

/// A message in provider wire form; tool outputs live as parts on assistant
/// messages, so only user/assistant roles appear here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: String,
}

/// Everything a backend needs to drive one streaming tool-use turn.
pub struct StreamRequest {
    pub task_id: String,
    pub system_prompt: String,
    pub messages: Vec<LlmMessage>,
    pub model: String,
    pub user_api_keys: HashMap<String, String>,
    pub enable_tools: bool,
    pub workspace_path: String,
    /// Tool dispatch target. The backend is responsible for dispatching tool
    /// calls back into the workspace through this router.
    pub tools: Option<Arc<ToolRouter>>,
    pub cancel: CancellationToken,
}

/// Streaming LLM backend. `create_message_stream` returns a lazy sequence of
/// chunks; the sender side closes when the turn is finished or cancelled.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn create_message_stream(
        &self,
        request: StreamRequest,
    ) -> Result<mpsc::Receiver<StreamChunk>>;

    /// One-shot small-model completion (commit messages, PR metadata, repo
    /// summaries).
    async fn complete(
        &self,
        prompt: &str,
        model: &str,
        user_api_keys: &HashMap<String, String>,
    ) -> Result<String>;
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_tags_are_kebab_case() {
        let cases: Vec<(StreamChunk, &str)> = vec![
            (
                StreamChunk::Content {
                    content: "hi".into(),
                },
                r#""type":"content""#,
            ),
            (
                StreamChunk::ToolCall {
                    id: "1".into(),
                    name: "read_file".into(),
                    args: serde_json::json!({}),
                },
                r#""type":"tool-call""#,
            ),
            (
                StreamChunk::Complete {
                    finish_reason: "stop".into(),
                },
                r#""type":"complete""#,
            ),
            (
                StreamChunk::InitProgress {
                    phase: "step-start".into(),
                    step: Some("PREPARE_WORKSPACE".into()),
                    message: None,
                },
                r#""type":"init-progress""#,
            ),
            (
                StreamChunk::FsChange {
                    operation: "modified".into(),
                    file_path: "src/main.rs".into(),
                    timestamp: 0,
                    is_directory: false,
                },
                r#""type":"fs-change""#,
            ),
        ];
        for (chunk, tag) in cases {
            let json = serde_json::to_string(&chunk).unwrap();
            assert!(json.contains(tag), "{json} missing {tag}");
        }
    }

    #[test]
    fn chunk_round_trips() {
        let chunk = StreamChunk::Usage {
            prompt_tokens: 10,
            completion_tokens: 20,
            total_tokens: 30,
        };
        let json = serde_json::to_string(&chunk).unwrap();
        let back: StreamChunk = serde_json::from_str(&json).unwrap();
        let StreamChunk::Usage { total_tokens, .. } = back else {
            panic!("expected Usage");
        };
        assert_eq!(total_tokens, 30);
    }
}
