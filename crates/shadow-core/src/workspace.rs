use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::{AgentMode, Config};
use crate::db::Db;
use crate::executor::local::LocalExecutor;
use crate::executor::remote::RemoteExecutor;
use crate::executor::Executor;
use crate::types::{PreparedWorkspace, WorkspaceConfig};

/// DNS-1123 label limit for pod / service names.
const MAX_RESOURCE_NAME_LEN: usize = 63;

/// Sanitize a task id for use in sandbox resource names: lowercase, map
/// anything outside `[a-z0-9-]` to `-`, collapse runs, trim edge dashes,
/// truncate to 63 chars. Stable under a second application.
pub fn sanitize_task_id(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    let mut last_dash = false;
    for c in id.to_lowercase().chars() {
        let mapped = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            c
        } else {
            '-'
        };
        if mapped == '-' {
            if last_dash || out.is_empty() {
                continue;
            }
            last_dash = true;
        } else {
            last_dash = false;
        }
        out.push(mapped);
    }
    out.truncate(MAX_RESOURCE_NAME_LEN);
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Sidecar base URL for a task's sandbox, derived from its sanitized id.
pub fn sidecar_base_url(task_id: &str, namespace: &str) -> String {
    format!(
        "http://shadow-vm-{}.{namespace}.svc.cluster.local:8080",
        sanitize_task_id(task_id)
    )
}

// ── Sandbox provisioning seam ─────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SandboxInfo {
    pub pod_name: String,
    pub pod_namespace: String,
    /// Workspace root inside the sandbox; the startup script clones there.
    pub workspace_path: String,
}

/// Creates and destroys sandbox VMs. The pod's startup script performs the
/// clone; the engine only talks to the sidecar afterwards.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn create(&self, config: &WorkspaceConfig, namespace: &str) -> Result<SandboxInfo>;
    async fn destroy(&self, pod_name: &str, pod_namespace: &str) -> Result<()>;
}

// ── Workspace status ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WorkspaceStatus {
    pub exists: bool,
    pub healthy: bool,
    pub is_remote: bool,
    pub workspace_path: String,
}

// ── Manager ───────────────────────────────────────────────────────────────

/// Allocates, verifies and tears down per-task workspaces, and hands out
/// executors bound to them.
pub struct WorkspaceManager {
    config: Arc<Config>,
    db: Arc<Db>,
    provider: Option<Arc<dyn SandboxProvider>>,
}

impl WorkspaceManager {
    pub fn new(
        config: Arc<Config>,
        db: Arc<Db>,
        provider: Option<Arc<dyn SandboxProvider>>,
    ) -> Self {
        Self {
            config,
            db,
            provider,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.config.agent_mode == AgentMode::Remote
    }

    pub async fn prepare_workspace(&self, cfg: &WorkspaceConfig) -> Result<PreparedWorkspace> {
        match self.config.agent_mode {
            AgentMode::Local => self.prepare_local(cfg).await,
            AgentMode::Remote => self.prepare_remote(cfg).await,
        }
    }

    /// Clone the repo under the workspace root and put it on the shadow
    /// branch. Reuses an existing clone: local workspaces persist between
    /// sessions.
    async fn prepare_local(&self, cfg: &WorkspaceConfig) -> Result<PreparedWorkspace> {
        let dir = Path::new(&self.config.workspace_root)
            .join(format!("task-{}", sanitize_task_id(&cfg.id)));
        let dir_str = dir.to_string_lossy().to_string();

        if !dir.join(".git").exists() {
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("create workspace dir {dir_str}"))?;
            let clone = run_git(
                Path::new(&self.config.workspace_root),
                &[
                    "clone",
                    "--branch",
                    &cfg.base_branch,
                    &cfg.repo_url,
                    &dir_str,
                ],
            )
            .await?;
            if !clone.success {
                return Err(anyhow!(
                    "git clone {} failed: {}",
                    cfg.repo_url,
                    clone.output
                ));
            }
            info!(task_id = %cfg.id, workspace = %dir_str, "cloned repository");
        }

        let base_sha = run_git(&dir, &["rev-parse", &cfg.base_branch]).await?;
        if !base_sha.success {
            return Err(anyhow!("git rev-parse {} failed: {}", cfg.base_branch, base_sha.output));
        }
        let checkout = run_git(&dir, &["checkout", "-B", &cfg.shadow_branch, &cfg.base_branch]).await?;
        if !checkout.success {
            return Err(anyhow!(
                "creating shadow branch {} failed: {}",
                cfg.shadow_branch,
                checkout.output
            ));
        }

        Ok(PreparedWorkspace {
            workspace_path: dir_str,
            base_commit_sha: base_sha.output.trim().to_string(),
            pod_name: None,
            pod_namespace: None,
        })
    }

    async fn prepare_remote(&self, cfg: &WorkspaceConfig) -> Result<PreparedWorkspace> {
        let provider = self
            .provider
            .as_ref()
            .ok_or_else(|| anyhow!("remote mode requires a sandbox provider"))?;
        let info = provider
            .create(cfg, &self.config.sandbox_namespace)
            .await
            .context("provision sandbox")?;
        self.db
            .insert_session(&cfg.id, &info.pod_name, &info.pod_namespace)
            .context("record task session")?;
        info!(task_id = %cfg.id, pod = %info.pod_name, "sandbox provisioned");
        Ok(PreparedWorkspace {
            workspace_path: info.workspace_path,
            base_commit_sha: String::new(),
            pod_name: Some(info.pod_name),
            pod_namespace: Some(info.pod_namespace),
        })
    }

    /// Build an executor for the task's workspace.
    pub fn get_executor(&self, task_id: &str) -> Result<Arc<dyn Executor>> {
        let task = self
            .db
            .get_task(task_id)?
            .ok_or_else(|| anyhow!("task not found: {task_id}"))?;
        match self.config.agent_mode {
            AgentMode::Local => Ok(Arc::new(LocalExecutor::new(task_id, task.workspace_path))),
            AgentMode::Remote => {
                let workspace = if task.workspace_path.is_empty() {
                    "/workspace".to_string()
                } else {
                    task.workspace_path
                };
                Ok(Arc::new(RemoteExecutor::new(
                    task_id,
                    sidecar_base_url(task_id, &self.config.sandbox_namespace),
                    workspace,
                )))
            }
        }
    }

    pub async fn get_workspace_status(&self, task_id: &str) -> Result<WorkspaceStatus> {
        let task = self
            .db
            .get_task(task_id)?
            .ok_or_else(|| anyhow!("task not found: {task_id}"))?;
        let exists = !task.workspace_path.is_empty() && !task.workspace_cleaned_up;
        let healthy = if exists {
            self.health_check(task_id).await.unwrap_or(false)
        } else {
            false
        };
        Ok(WorkspaceStatus {
            exists,
            healthy,
            is_remote: self.is_remote(),
            workspace_path: task.workspace_path,
        })
    }

    /// Liveness probe. Local: the directory exists and is a git repo.
    /// Remote: the sidecar can list a non-empty workspace root.
    pub async fn health_check(&self, task_id: &str) -> Result<bool> {
        match self.config.agent_mode {
            AgentMode::Local => {
                let task = self
                    .db
                    .get_task(task_id)?
                    .ok_or_else(|| anyhow!("task not found: {task_id}"))?;
                let dir = Path::new(&task.workspace_path);
                Ok(dir.is_dir() && dir.join(".git").exists())
            }
            AgentMode::Remote => {
                let executor = self.get_executor(task_id)?;
                match executor.list_directory(".").await {
                    Ok(entries) => Ok(!entries.is_empty()),
                    Err(_) => Ok(false),
                }
            }
        }
    }

    /// Tear down the task's sandbox. Local workspaces persist, so this is a
    /// no-op in local mode. Idempotent: a second call finds nothing to do.
    pub async fn cleanup_workspace(&self, task_id: &str) -> Result<()> {
        if self.config.agent_mode == AgentMode::Local {
            return Ok(());
        }
        let Some(session) = self.db.get_active_session(task_id)? else {
            return Ok(());
        };
        let provider = self
            .provider
            .as_ref()
            .ok_or_else(|| anyhow!("remote mode requires a sandbox provider"))?;
        if let Err(e) = provider
            .destroy(&session.pod_name, &session.pod_namespace)
            .await
        {
            warn!(task_id, pod = %session.pod_name, "sandbox teardown failed: {e}");
        }
        self.db.end_active_session(task_id)?;
        self.db.set_workspace_cleaned_up(task_id, true)?;
        info!(task_id, pod = %session.pod_name, "sandbox torn down");
        Ok(())
    }
}

// ── Git helper for workspace preparation ──────────────────────────────────

struct GitOutput {
    success: bool,
    output: String,
}

async fn run_git(dir: &Path, args: &[&str]) -> Result<GitOutput> {
    let output = Command::new("git")
        .current_dir(dir)
        .args(args)
        .output()
        .await
        .with_context(|| format!("failed to spawn git {}", args.join(" ")))?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    Ok(GitOutput {
        success: output.status.success(),
        output: if stderr.is_empty() {
            stdout
        } else {
            format!("{stdout}\n{stderr}")
        },
    })
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_lowercases_and_maps() {
        assert_eq!(sanitize_task_id("Task_42"), "task-42");
        assert_eq!(sanitize_task_id("clxyz123"), "clxyz123");
    }

    #[test]
    fn sanitize_collapses_and_trims() {
        assert_eq!(sanitize_task_id("--a__b--"), "a-b");
        assert_eq!(sanitize_task_id("!!!"), "");
    }

    #[test]
    fn sanitize_truncates_to_dns_label() {
        let long = "x".repeat(100);
        let out = sanitize_task_id(&long);
        assert_eq!(out.len(), 63);
    }

    #[test]
    fn sanitize_never_ends_with_dash_after_truncation() {
        let id = format!("{}-{}", "x".repeat(62), "y".repeat(30));
        let out = sanitize_task_id(&id);
        assert!(out.len() <= 63);
        assert!(!out.ends_with('-'));
    }

    #[test]
    fn sanitize_is_idempotent() {
        for id in ["Task_42", "--a__b--", "ABC!!def", "x y z", ""] {
            let once = sanitize_task_id(id);
            assert_eq!(sanitize_task_id(&once), once);
        }
    }

    #[test]
    fn sanitize_output_charset() {
        for id in ["Hello World!", "UPPER_case-123", "..//..", "éàü"] {
            let out = sanitize_task_id(id);
            assert!(
                out.is_empty()
                    || (out.chars().all(|c| c.is_ascii_lowercase()
                        || c.is_ascii_digit()
                        || c == '-')
                        && !out.starts_with('-')
                        && !out.ends_with('-'))
            );
        }
    }

    #[test]
    fn sidecar_url_uses_sanitized_id() {
        assert_eq!(
            sidecar_base_url("Task_42", "shadow"),
            "http://shadow-vm-task-42.shadow.svc.cluster.local:8080"
        );
    }
}
