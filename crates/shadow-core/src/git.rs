use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::executor::{
    CommandOptions, CommitRequest, CommitResult, ExecError, Executor, GitIdentity,
};
use crate::llm::LlmClient;
use crate::types::{DiffStats, FileChange, FileChanges, FileOp};

/// Diffs shorter than this get a synthesized commit message instead of an
/// LLM call.
const SUBSTANTIAL_DIFF_BYTES: usize = 500;
/// Diff excerpt handed to the commit-message prompt.
const COMMIT_PROMPT_DIFF_BYTES: usize = 3_000;
const FALLBACK_COMMIT_MESSAGE: &str = "Update code via agent";

/// Inputs for the end-of-turn auto commit.
pub struct AutoCommitContext<'a> {
    pub user: GitIdentity,
    pub co_author: GitIdentity,
    pub shadow_branch: &'a str,
    pub llm: Option<&'a dyn LlmClient>,
    pub model: &'a str,
    pub user_api_keys: &'a HashMap<String, String>,
}

/// High-level git operations over a workspace executor. Works identically
/// against local and remote workspaces: the four wire-level git ops go
/// through the executor's dedicated git surface, everything else through
/// `execute_command`.
pub struct GitService {
    executor: Arc<dyn Executor>,
}

impl GitService {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    async fn git(&self, args: &str) -> Result<String> {
        let result = self
            .executor
            .execute_command(&format!("git {args}"), CommandOptions::default())
            .await
            .with_context(|| format!("git {args}"))?;
        if !result.success() {
            return Err(anyhow!("git {args} failed: {}", result.combined_output()));
        }
        Ok(result.stdout)
    }

    pub async fn has_changes(&self) -> Result<bool> {
        let status = self.executor.git_status().await.context("git status")?;
        Ok(!status.trim().is_empty())
    }

    pub async fn get_current_commit_sha(&self) -> Result<String> {
        let out = self.git("rev-parse HEAD").await?;
        Ok(out.trim().to_string())
    }

    pub async fn get_current_branch(&self) -> Result<String> {
        let out = self.git("rev-parse --abbrev-ref HEAD").await?;
        Ok(out.trim().to_string())
    }

    /// Create (or reset) the shadow branch off `base` and return the base
    /// commit sha.
    pub async fn create_shadow_branch(&self, base: &str, shadow: &str) -> Result<String> {
        self.git(&format!("checkout -B {shadow} {base}")).await?;
        let sha = self.git(&format!("rev-parse {base}")).await?;
        Ok(sha.trim().to_string())
    }

    pub async fn commit_changes(&self, req: &CommitRequest) -> Result<CommitResult> {
        self.executor
            .git_commit(req)
            .await
            .context("git commit via executor")
    }

    pub async fn push_branch(&self, branch: &str, set_upstream: bool) -> Result<()> {
        match self.executor.git_push(branch, set_upstream).await {
            Ok(()) => Ok(()),
            Err(ExecError::AuthFailed(m)) => Err(anyhow!("push auth failed: {m}")),
            Err(e) => Err(anyhow!("push failed: {e}")),
        }
    }

    /// Working-tree diff against HEAD.
    pub async fn get_diff(&self) -> Result<String> {
        self.executor.git_diff(None).await.context("git diff")
    }

    pub async fn get_diff_against_base(&self, base_branch: &str) -> Result<String> {
        self.executor
            .git_diff(Some(base_branch))
            .await
            .context("git diff against base")
    }

    /// Move HEAD (and the current branch, when on one) to `sha`. Returns
    /// false when the checkout is refused, e.g. dirty changes would be
    /// overwritten.
    pub async fn safe_checkout_commit(&self, sha: &str) -> Result<bool> {
        let branch = self.get_current_branch().await.unwrap_or_default();
        let args = if branch.is_empty() || branch == "HEAD" {
            format!("checkout {sha}")
        } else {
            format!("checkout -B {branch} {sha}")
        };
        match self.git(&args).await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("checkout of {sha} refused: {e}");
                Ok(false)
            }
        }
    }

    pub async fn get_recent_commit_messages(
        &self,
        base_branch: &str,
        limit: usize,
    ) -> Result<Vec<String>> {
        let out = self
            .git(&format!(
                "log --pretty=format:%s -n {limit} {base_branch}..HEAD"
            ))
            .await
            .or_else(|_| Ok::<String, anyhow::Error>(String::new()))?;
        Ok(out
            .lines()
            .map(str::to_string)
            .filter(|l| !l.is_empty())
            .collect())
    }

    /// Per-file change summary of the workspace against the base branch,
    /// including uncommitted work.
    pub async fn get_file_changes(&self, base_branch: &str) -> Result<FileChanges> {
        let numstat = self.git(&format!("diff --numstat {base_branch}")).await?;
        let name_status = self
            .git(&format!("diff --name-status -M {base_branch}"))
            .await?;

        let mut ops: HashMap<String, FileOp> = HashMap::new();
        for line in name_status.lines() {
            let mut parts = line.split('\t');
            let Some(code) = parts.next() else { continue };
            let op = match code.chars().next() {
                Some('A') => FileOp::Create,
                Some('D') => FileOp::Delete,
                Some('R') => FileOp::Rename,
                _ => FileOp::Update,
            };
            // Renames list old then new path; the new path is the one shown.
            let path = parts.last().unwrap_or_default().to_string();
            if !path.is_empty() {
                ops.insert(path, op);
            }
        }

        let now = Utc::now();
        let mut file_changes = Vec::new();
        let mut stats = DiffStats::default();
        for line in numstat.lines() {
            let mut parts = line.split('\t');
            let additions: u64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            let deletions: u64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            let Some(path) = parts.next() else { continue };
            let path = path.to_string();
            stats.additions += additions;
            stats.deletions += deletions;
            stats.total_files += 1;
            file_changes.push(FileChange {
                op: ops.get(&path).copied().unwrap_or(FileOp::Update),
                path,
                additions,
                deletions,
                created_at: now,
            });
        }

        // `git diff` never lists untracked files; fold them in as creations.
        let status = self.git("status --porcelain -uall").await?;
        for line in status.lines() {
            let Some(path) = line.strip_prefix("?? ") else { continue };
            let path = path.trim().trim_matches('"').to_string();
            if file_changes.iter().any(|c| c.path == path) {
                continue;
            }
            let additions = self
                .executor
                .read_file(&path, crate::executor::ReadOptions::default())
                .await
                .map(|r| r.total_lines as u64)
                .unwrap_or(0);
            stats.additions += additions;
            stats.total_files += 1;
            file_changes.push(FileChange {
                path,
                op: FileOp::Create,
                additions,
                deletions: 0,
                created_at: now,
            });
        }

        Ok(FileChanges {
            file_changes,
            diff_stats: stats,
        })
    }

    /// If the workspace is dirty: generate a commit message, commit with the
    /// co-author trailer and push the shadow branch. Push failure never
    /// fails the commit.
    pub async fn commit_changes_if_any(
        &self,
        ctx: AutoCommitContext<'_>,
    ) -> Result<Option<CommitResult>> {
        if !self.has_changes().await? {
            return Ok(None);
        }

        let diff = self.get_diff().await.unwrap_or_default();
        let message = self.generate_commit_message(&diff, &ctx).await;

        let result = self
            .commit_changes(&CommitRequest {
                user: ctx.user,
                co_author: ctx.co_author,
                message,
            })
            .await?;
        if !result.committed {
            return Ok(None);
        }
        info!(sha = %result.commit_sha, branch = ctx.shadow_branch, "committed agent changes");

        if let Err(e) = self.push_branch(ctx.shadow_branch, true).await {
            warn!(branch = ctx.shadow_branch, "push failed (continuing): {e}");
        }
        Ok(Some(result))
    }

    async fn generate_commit_message(&self, diff: &str, ctx: &AutoCommitContext<'_>) -> String {
        let (Some(llm), true) = (ctx.llm, diff.len() >= SUBSTANTIAL_DIFF_BYTES) else {
            return FALLBACK_COMMIT_MESSAGE.to_string();
        };
        let excerpt: String = diff.chars().take(COMMIT_PROMPT_DIFF_BYTES).collect();
        let prompt = format!(
            "Write a single-line git commit message (imperative mood, max 72 chars) \
             for this diff. Respond with the message only, no quotes.\n\n{excerpt}"
        );
        match llm.complete(&prompt, ctx.model, ctx.user_api_keys).await {
            Ok(text) => {
                let line = text.lines().next().unwrap_or("").trim().to_string();
                if line.is_empty() {
                    FALLBACK_COMMIT_MESSAGE.to_string()
                } else {
                    line
                }
            }
            Err(e) => {
                warn!("commit message generation failed: {e}");
                FALLBACK_COMMIT_MESSAGE.to_string()
            }
        }
    }
}
