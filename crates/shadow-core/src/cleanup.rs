use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::chat::ChatEngine;
use crate::config::{AgentMode, Config};
use crate::db::Db;
use crate::services::BackgroundServiceManager;
use crate::types::InitStatus;
use crate::workspace::WorkspaceManager;

/// Periodic sweeper that tears down sandboxes for tasks idle past their
/// scheduled cleanup time. Remote mode only: local workspaces persist.
pub struct TaskCleanupService {
    config: Arc<Config>,
    db: Arc<Db>,
    workspaces: Arc<WorkspaceManager>,
    chat: Arc<ChatEngine>,
    services: Arc<BackgroundServiceManager>,
}

impl TaskCleanupService {
    pub fn new(
        config: Arc<Config>,
        db: Arc<Db>,
        workspaces: Arc<WorkspaceManager>,
        chat: Arc<ChatEngine>,
        services: Arc<BackgroundServiceManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            db,
            workspaces,
            chat,
            services,
        })
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if self.config.agent_mode != AgentMode::Remote {
            info!("cleanup sweeper disabled in local mode");
            return;
        }
        let interval = Duration::from_secs(self.config.cleanup_interval_s);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            match self.sweep().await {
                Ok(0) => {}
                Ok(n) => info!(cleaned = n, "cleanup sweep finished"),
                Err(e) => warn!("cleanup sweep failed: {e:#}"),
            }
        }
    }

    /// One sweep over due tasks. Each task is claimed with a guarded update
    /// first: a follow-up message that cleared (or re-scheduled) the cleanup
    /// between selection and claim wins, and the task is skipped.
    pub async fn sweep(&self) -> Result<usize> {
        let now = Utc::now().timestamp();
        let due = self.db.list_cleanup_due(now)?;
        let mut cleaned = 0usize;

        for task in due {
            if !self.db.claim_cleanup(&task.id, now)? {
                info!(task_id = %task.id, "cleanup claim lost, skipping");
                continue;
            }
            info!(task_id = %task.id, "tearing down idle task");

            self.chat.cleanup_task(&task.id).await;
            self.services.cleanup_task(&task.id).await;
            // The claim already cleared the schedule, so a teardown failure
            // cannot produce a retry storm.
            if let Err(e) = self.workspaces.cleanup_workspace(&task.id).await {
                warn!(task_id = %task.id, "workspace teardown failed: {e:#}");
            }
            // Status stays as-is so the user can resume the task later.
            self.db.set_init_status(&task.id, InitStatus::Inactive)?;
            cleaned += 1;
        }
        Ok(cleaned)
    }
}
