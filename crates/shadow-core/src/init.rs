use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::{info, warn};

use crate::config::{AgentMode, Config};
use crate::db::Db;
use crate::events::EventBus;
use crate::executor::{CommandOptions, Executor};
use crate::git::GitService;
use crate::llm::StreamChunk;
use crate::services::BackgroundServiceManager;
use crate::types::{InitStatus, TaskStatus, WorkspaceConfig};
use crate::workspace::WorkspaceManager;

const LOCAL_STEPS: &[InitStatus] = &[
    InitStatus::PrepareWorkspace,
    InitStatus::StartBackgroundServices,
    InitStatus::InstallDependencies,
    InitStatus::CompleteShadowWiki,
];

const REMOTE_STEPS: &[InitStatus] = &[
    InitStatus::CreateVm,
    InitStatus::WaitVmReady,
    InitStatus::VerifyVmWorkspace,
    InitStatus::StartBackgroundServices,
    InitStatus::InstallDependencies,
    InitStatus::CompleteShadowWiki,
];

/// Re-initialization after infra loss skips background services and the
/// wiki wait: the summary already exists and services are per-repo.
const REMOTE_REINIT_STEPS: &[InitStatus] = &[
    InitStatus::CreateVm,
    InitStatus::WaitVmReady,
    InitStatus::VerifyVmWorkspace,
    InitStatus::InstallDependencies,
];

const VM_READY_ATTEMPTS: u32 = 5;
const VM_READY_POLL: Duration = Duration::from_secs(2);
const WIKI_WAIT_MAX: Duration = Duration::from_secs(600);
const WIKI_POLL: Duration = Duration::from_secs(2);

/// Drives a task from INACTIVE to ACTIVE through the mode's ordered step
/// list. Any step failure marks the task FAILED, records the error and
/// aborts the remaining steps.
pub struct InitEngine {
    config: Arc<Config>,
    db: Arc<Db>,
    workspaces: Arc<WorkspaceManager>,
    services: Arc<BackgroundServiceManager>,
    bus: Arc<EventBus>,
}

pub fn steps_for_mode(mode: AgentMode) -> &'static [InitStatus] {
    match mode {
        AgentMode::Local => LOCAL_STEPS,
        AgentMode::Remote => REMOTE_STEPS,
    }
}

impl InitEngine {
    pub fn new(
        config: Arc<Config>,
        db: Arc<Db>,
        workspaces: Arc<WorkspaceManager>,
        services: Arc<BackgroundServiceManager>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            db,
            workspaces,
            services,
            bus,
        }
    }

    pub async fn initialize(&self, task_id: &str) -> Result<()> {
        self.db.update_task_status(task_id, TaskStatus::Initializing)?;
        self.run_steps(task_id, steps_for_mode(self.config.agent_mode))
            .await
    }

    /// Rebuild a lost remote sandbox for an ACTIVE task before continuing.
    pub async fn reinitialize(&self, task_id: &str) -> Result<()> {
        if self.config.agent_mode != AgentMode::Remote {
            return Ok(());
        }
        info!(task_id, "re-initializing lost sandbox");
        self.run_steps(task_id, REMOTE_REINIT_STEPS).await
    }

    /// Infra check for incoming requests on an ACTIVE remote task: a missing
    /// live session or an unlistable workspace root triggers re-init.
    pub async fn ensure_ready(&self, task_id: &str) -> Result<()> {
        if self.config.agent_mode != AgentMode::Remote {
            return Ok(());
        }
        let task = self
            .db
            .get_task(task_id)?
            .ok_or_else(|| anyhow!("task not found: {task_id}"))?;
        if task.init_status != InitStatus::Active {
            return Ok(());
        }
        let session_alive = self.db.get_active_session(task_id)?.is_some();
        let workspace_alive = if session_alive {
            let executor = self.workspaces.get_executor(task_id)?;
            executor.list_directory(".").await.is_ok()
        } else {
            false
        };
        if !session_alive || !workspace_alive {
            self.reinitialize(task_id).await?;
        }
        Ok(())
    }

    async fn run_steps(&self, task_id: &str, steps: &[InitStatus]) -> Result<()> {
        self.emit(task_id, "start", None, None).await;
        for step in steps {
            self.db.set_init_status(task_id, *step)?;
            self.emit(task_id, "step-start", Some(step.as_str()), None)
                .await;
            info!(task_id, step = step.as_str(), "init step");
            if let Err(e) = self.run_step(task_id, *step).await {
                let message = format!("{} failed: {e:#}", step.as_str());
                warn!(task_id, "{message}");
                self.db.update_task_status(task_id, TaskStatus::Failed)?;
                self.db.set_initialization_error(task_id, &message)?;
                self.emit(task_id, "error", Some(step.as_str()), Some(&message))
                    .await;
                return Err(anyhow!(message));
            }
        }
        self.db.set_init_status(task_id, InitStatus::Active)?;
        self.emit(task_id, "complete", None, None).await;
        Ok(())
    }

    async fn emit(&self, task_id: &str, phase: &str, step: Option<&str>, message: Option<&str>) {
        self.bus
            .publish(
                task_id,
                StreamChunk::InitProgress {
                    phase: phase.to_string(),
                    step: step.map(str::to_string),
                    message: message.map(str::to_string),
                },
            )
            .await;
    }

    async fn run_step(&self, task_id: &str, step: InitStatus) -> Result<()> {
        match step {
            InitStatus::PrepareWorkspace | InitStatus::CreateVm => {
                self.prepare_workspace(task_id).await
            }
            InitStatus::WaitVmReady => self.wait_vm_ready(task_id).await,
            InitStatus::VerifyVmWorkspace => self.verify_vm_workspace(task_id).await,
            InitStatus::StartBackgroundServices => {
                let executor = self.workspaces.get_executor(task_id)?;
                self.services.start_for_task(task_id, executor).await;
                Ok(())
            }
            InitStatus::InstallDependencies => self.install_dependencies(task_id).await,
            InitStatus::CompleteShadowWiki => self.wait_for_blocking_services(task_id).await,
            InitStatus::Inactive | InitStatus::Active => Ok(()),
        }
    }

    async fn prepare_workspace(&self, task_id: &str) -> Result<()> {
        let task = self
            .db
            .get_task(task_id)?
            .ok_or_else(|| anyhow!("task not found: {task_id}"))?;
        let prepared = self
            .workspaces
            .prepare_workspace(&WorkspaceConfig {
                id: task.id.clone(),
                repo_full_name: task.repo_full_name.clone(),
                repo_url: task.repo_url.clone(),
                base_branch: task.base_branch.clone(),
                shadow_branch: task.shadow_branch.clone(),
                user_id: task.user_id.clone(),
            })
            .await
            .context("prepare workspace")?;
        self.db.set_workspace_info(
            task_id,
            &prepared.workspace_path,
            &prepared.base_commit_sha,
        )?;
        Ok(())
    }

    /// Poll the sidecar until it can list a non-empty workspace root.
    /// Bounded: 5 attempts, 2 s apart.
    async fn wait_vm_ready(&self, task_id: &str) -> Result<()> {
        let executor = self.workspaces.get_executor(task_id)?;
        for attempt in 1..=VM_READY_ATTEMPTS {
            match executor.list_directory(".").await {
                Ok(entries) if !entries.is_empty() => return Ok(()),
                Ok(_) => info!(task_id, attempt, "workspace still empty"),
                Err(e) => info!(task_id, attempt, "sidecar not ready: {e}"),
            }
            tokio::time::sleep(VM_READY_POLL).await;
        }
        Err(anyhow!(
            "sidecar did not become ready within {} attempts",
            VM_READY_ATTEMPTS
        ))
    }

    /// The cloned workspace must be a git repo; put it on the shadow branch
    /// and record the base commit if this is the first materialization.
    async fn verify_vm_workspace(&self, task_id: &str) -> Result<()> {
        let task = self
            .db
            .get_task(task_id)?
            .ok_or_else(|| anyhow!("task not found: {task_id}"))?;
        let executor = self.workspaces.get_executor(task_id)?;
        let entries = executor
            .list_directory(".")
            .await
            .map_err(|e| anyhow!("workspace unlistable: {e}"))?;
        if !entries.iter().any(|e| e.name == ".git") {
            return Err(anyhow!("workspace is not a git repository"));
        }
        let git = GitService::new(Arc::clone(&executor));
        let base_sha = git
            .create_shadow_branch(&task.base_branch, &task.shadow_branch)
            .await
            .context("create shadow branch")?;
        if task.base_commit_sha.is_empty() {
            self.db
                .set_workspace_info(task_id, executor.workspace_path(), &base_sha)?;
        }
        Ok(())
    }

    async fn install_dependencies(&self, task_id: &str) -> Result<()> {
        let executor = self.workspaces.get_executor(task_id)?;
        let entries = executor
            .list_directory(".")
            .await
            .map_err(|e| anyhow!("list workspace: {e}"))?;
        let names: Vec<String> = entries.into_iter().map(|e| e.name).collect();

        for cmd in detect_install_commands(&names) {
            info!(task_id, cmd = %cmd, "installing dependencies");
            let opts = CommandOptions {
                timeout_s: self.config.install_timeout_s,
                background: false,
                network_allowed: true,
            };
            match executor.execute_command(&cmd, opts).await {
                Ok(result) if result.success() => {}
                Ok(result) => warn!(
                    task_id,
                    cmd = %cmd,
                    exit_code = result.exit_code,
                    "dependency install failed (continuing)"
                ),
                Err(e) => warn!(task_id, cmd = %cmd, "dependency install error (continuing): {e}"),
            }
        }
        Ok(())
    }

    /// Wait for all blocking background services to reach a terminal state.
    /// Bounded at 10 minutes; a timeout is logged, never a failure.
    async fn wait_for_blocking_services(&self, task_id: &str) -> Result<()> {
        let deadline = tokio::time::Instant::now() + WIKI_WAIT_MAX;
        while !self.services.are_all_services_complete(task_id).await {
            if tokio::time::Instant::now() >= deadline {
                warn!(task_id, "blocking services did not finish within the wait budget");
                return Ok(());
            }
            tokio::time::sleep(WIKI_POLL).await;
        }
        Ok(())
    }
}

/// Lockfile detection. Node package managers are mutually exclusive in
/// precedence order; Python installs are layered on top.
pub fn detect_install_commands(names: &[String]) -> Vec<String> {
    let has = |n: &str| names.iter().any(|name| name == n);
    let mut commands = Vec::new();
    if has("bun.lockb") {
        commands.push("bun install".to_string());
    } else if has("pnpm-lock.yaml") {
        commands.push("pnpm install".to_string());
    } else if has("yarn.lock") {
        commands.push("yarn install".to_string());
    } else if has("package.json") {
        commands.push("npm install".to_string());
    }
    if has("requirements.txt") {
        commands.push("pip install -r requirements.txt".to_string());
    } else if has("pyproject.toml") {
        commands.push("pip install -e .".to_string());
    }
    commands
}

// ── Tests ──────────────────────────────────────────────────────────────────
