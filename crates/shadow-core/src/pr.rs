use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use crate::git::GitService;
use crate::llm::LlmClient;
use crate::types::Task;

/// Diff excerpt handed to the metadata prompt.
const PR_PROMPT_DIFF_BYTES: usize = 3_000;
const RECENT_COMMITS: usize = 5;

#[derive(Debug, Clone)]
pub struct PrMetadata {
    pub title: String,
    pub description: String,
    pub is_draft: bool,
}

#[derive(Debug, Clone)]
pub struct CreatePrRequest {
    pub title: String,
    pub description: String,
    pub is_draft: bool,
    pub head_branch: String,
    pub base_branch: String,
}

/// Git-host operations the engine delegates: PR existence and creation.
#[async_trait]
pub trait GitHostClient: Send + Sync {
    async fn find_open_pr(&self, repo_full_name: &str, branch: &str) -> Result<Option<u64>>;
    async fn create_pr(&self, repo_full_name: &str, request: &CreatePrRequest) -> Result<u64>;
}

/// Decides whether a PR should be opened after a push and generates its
/// metadata with a small-model call.
pub struct PrService {
    llm: Arc<dyn LlmClient>,
    host: Arc<dyn GitHostClient>,
    small_model: String,
}

impl PrService {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        host: Arc<dyn GitHostClient>,
        small_model: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            llm,
            host,
            small_model: small_model.into(),
        })
    }

    /// Open a PR for the task's shadow branch unless one is already open.
    /// Returns the PR number when one was created.
    pub async fn maybe_open_pr(
        &self,
        task: &Task,
        git: &GitService,
        completed: bool,
        user_api_keys: &HashMap<String, String>,
    ) -> Result<Option<u64>> {
        if let Some(existing) = self
            .host
            .find_open_pr(&task.repo_full_name, &task.shadow_branch)
            .await
            .context("check for open PR")?
        {
            info!(task_id = %task.id, pr = existing, "PR already open");
            return Ok(None);
        }

        let diff = git
            .get_diff_against_base(&task.base_branch)
            .await
            .unwrap_or_default();
        let commits = git
            .get_recent_commit_messages(&task.base_branch, RECENT_COMMITS)
            .await
            .unwrap_or_default();
        let metadata = self
            .generate_metadata(task, &diff, &commits, completed, user_api_keys)
            .await;

        let number = self
            .host
            .create_pr(
                &task.repo_full_name,
                &CreatePrRequest {
                    title: metadata.title,
                    description: metadata.description,
                    is_draft: metadata.is_draft,
                    head_branch: task.shadow_branch.clone(),
                    base_branch: task.base_branch.clone(),
                },
            )
            .await
            .context("create PR")?;
        info!(task_id = %task.id, pr = number, "pull request opened");
        Ok(Some(number))
    }

    async fn generate_metadata(
        &self,
        task: &Task,
        diff: &str,
        commits: &[String],
        completed: bool,
        user_api_keys: &HashMap<String, String>,
    ) -> PrMetadata {
        let excerpt: String = diff.chars().take(PR_PROMPT_DIFF_BYTES).collect();
        let prompt = format!(
            "Write pull request metadata for this change.\n\
             Task: {}\nTask completed: {completed}\nRecent commits:\n{}\n\n\
             Diff (truncated):\n```\n{excerpt}\n```\n\n\
             Respond ONLY with JSON: \
             {{\"title\":\"...\",\"description\":\"...\",\"isDraft\":true|false}}",
            task.title,
            commits.join("\n"),
        );

        let fallback = PrMetadata {
            title: task.title.clone(),
            description: "Automated changes by the coding agent.".to_string(),
            is_draft: !completed,
        };

        let text = match self
            .llm
            .complete(&prompt, &self.small_model, user_api_keys)
            .await
        {
            Ok(text) => text,
            Err(e) => {
                warn!(task_id = %task.id, "PR metadata generation failed: {e}");
                return fallback;
            }
        };

        let parsed: Value = match serde_json::from_str(strip_fences(&text)) {
            Ok(v) => v,
            Err(_) => return fallback,
        };
        PrMetadata {
            title: parsed["title"]
                .as_str()
                .filter(|t| !t.is_empty())
                .unwrap_or(&fallback.title)
                .to_string(),
            description: parsed["description"]
                .as_str()
                .filter(|d| !d.is_empty())
                .unwrap_or(&fallback.description)
                .to_string(),
            // A task that did not complete always yields a draft.
            is_draft: !completed || parsed["isDraft"].as_bool().unwrap_or(false),
        }
    }
}

/// Strip a Markdown code fence wrapper from a model response, if present.
fn strip_fences(text: &str) -> &str {
    let t = text.trim();
    if !t.starts_with("```") {
        return t;
    }
    let nl = match t.find('\n') {
        Some(i) => i,
        None => return t,
    };
    let inner = &t[nl + 1..];
    if inner.ends_with("```") {
        inner[..inner.len() - 3].trim_end()
    } else {
        inner
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
