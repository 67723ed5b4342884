#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::mpsc;

use shadow_core::chat::ChatEngine;
use shadow_core::checkpoint::CheckpointService;
use shadow_core::config::Config;
use shadow_core::db::Db;
use shadow_core::events::EventBus;
use shadow_core::init::InitEngine;
use shadow_core::llm::{LlmClient, StreamChunk, StreamRequest};
use shadow_core::services::BackgroundServiceManager;
use shadow_core::types::{InitStatus, Task, TaskStatus};
use shadow_core::watcher::WatcherRegistry;
use shadow_core::workspace::WorkspaceManager;

// ── Git helpers ───────────────────────────────────────────────────────────

pub fn run_git(dir: &Path, args: &[&str]) -> String {
    let output = std::process::Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .env("GIT_AUTHOR_NAME", "tester")
        .env("GIT_AUTHOR_EMAIL", "tester@example.com")
        .env("GIT_COMMITTER_NAME", "tester")
        .env("GIT_COMMITTER_EMAIL", "tester@example.com")
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// Create a commit-ready repo with a README on branch `main`.
pub fn init_origin(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    run_git(dir, &["init"]);
    run_git(dir, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    std::fs::write(dir.join("README.md"), "# demo\n").unwrap();
    run_git(dir, &["add", "-A"]);
    run_git(dir, &["commit", "-m", "initial commit"]);
}

// ── Scripted LLM backend ──────────────────────────────────────────────────

/// One scripted action inside a fake model turn.
pub enum Step {
    Text(&'static str),
    Tool(&'static str, Value),
    Sleep(u64),
    Fail(&'static str),
}

/// Plays back pre-scripted turns: each `create_message_stream` call consumes
/// the next turn. Tool steps dispatch through the request's router exactly
/// like the real backend.
pub struct FakeLlm {
    turns: std::sync::Mutex<VecDeque<Vec<Step>>>,
}

impl FakeLlm {
    pub fn new(turns: Vec<Vec<Step>>) -> Arc<Self> {
        Arc::new(Self {
            turns: std::sync::Mutex::new(turns.into()),
        })
    }
}

#[async_trait]
impl LlmClient for FakeLlm {
    async fn create_message_stream(
        &self,
        request: StreamRequest,
    ) -> Result<mpsc::Receiver<StreamChunk>> {
        let steps = self
            .turns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_default();
        let (tx, rx) = mpsc::channel(64);
        let router = request.tools.clone();
        let cancel = request.cancel.clone();

        tokio::spawn(async move {
            let mut call_count = 0u32;
            for step in steps {
                if cancel.is_cancelled() {
                    return;
                }
                match step {
                    Step::Text(text) => {
                        if tx
                            .send(StreamChunk::Content {
                                content: text.to_string(),
                            })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Step::Tool(name, args) => {
                        call_count += 1;
                        let id = format!("call-{call_count}");
                        if tx
                            .send(StreamChunk::ToolCall {
                                id: id.clone(),
                                name: name.to_string(),
                                args: args.clone(),
                            })
                            .await
                            .is_err()
                        {
                            return;
                        }
                        if let Some(router) = &router {
                            let result = router.dispatch(name, &args).await;
                            if tx.send(StreamChunk::ToolResult { id, result }).await.is_err() {
                                return;
                            }
                        }
                    }
                    Step::Sleep(ms) => {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(std::time::Duration::from_millis(ms)) => {}
                        }
                    }
                    Step::Fail(error) => {
                        let _ = tx
                            .send(StreamChunk::Error {
                                error: error.to_string(),
                                finish_reason: "error".to_string(),
                            })
                            .await;
                        return;
                    }
                }
            }
            let _ = tx
                .send(StreamChunk::Usage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    total_tokens: 15,
                })
                .await;
            let _ = tx
                .send(StreamChunk::Complete {
                    finish_reason: "stop".to_string(),
                })
                .await;
        });
        Ok(rx)
    }

    async fn complete(
        &self,
        _prompt: &str,
        _model: &str,
        _user_api_keys: &HashMap<String, String>,
    ) -> Result<String> {
        Ok("Update workspace files".to_string())
    }
}

// ── Full local-mode fixture ───────────────────────────────────────────────

pub struct Fixture {
    pub tmp: TempDir,
    pub config: Arc<Config>,
    pub db: Arc<Db>,
    pub bus: Arc<EventBus>,
    pub workspaces: Arc<WorkspaceManager>,
    pub watchers: Arc<WatcherRegistry>,
    pub checkpoints: Arc<CheckpointService>,
    pub services: Arc<BackgroundServiceManager>,
    pub init: Arc<InitEngine>,
    pub engine: Arc<ChatEngine>,
    pub task_id: String,
}

pub fn test_task(id: &str, repo_url: &str) -> Task {
    Task {
        id: id.to_string(),
        title: "demo task".into(),
        repo_full_name: "acme/demo".into(),
        repo_url: repo_url.to_string(),
        base_branch: "main".into(),
        shadow_branch: Task::shadow_branch_for(id),
        base_commit_sha: String::new(),
        workspace_path: String::new(),
        status: TaskStatus::Initializing,
        init_status: InitStatus::Inactive,
        initialization_error: String::new(),
        scheduled_cleanup_at: None,
        workspace_cleaned_up: false,
        user_id: "u1".into(),
        codebase_understanding_id: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

impl Fixture {
    /// Build the whole local-mode stack around a scripted LLM, create task
    /// `t1` and run initialization to materialize its workspace.
    pub async fn new(llm_turns: Vec<Vec<Step>>) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let origin = tmp.path().join("origin");
        init_origin(&origin);

        let config = Arc::new(Config::for_local(
            tmp.path().join("workspaces").to_string_lossy().to_string(),
        ));
        std::fs::create_dir_all(tmp.path().join("workspaces")).unwrap();

        let db = Arc::new(Db::open_in_memory().unwrap());
        let task_id = "t1".to_string();
        db.insert_task(&test_task(&task_id, &origin.to_string_lossy()))
            .unwrap();

        let bus = EventBus::new();
        let watchers = WatcherRegistry::new();
        let llm: Arc<dyn LlmClient> = FakeLlm::new(llm_turns);
        let workspaces = Arc::new(WorkspaceManager::new(
            Arc::clone(&config),
            Arc::clone(&db),
            None,
        ));
        let services =
            BackgroundServiceManager::new(Arc::clone(&config), Arc::clone(&db), Arc::clone(&llm));
        let checkpoints = Arc::new(CheckpointService::new(
            Arc::clone(&db),
            Arc::clone(&bus),
            Arc::clone(&workspaces),
            Arc::clone(&watchers),
        ));
        let init = Arc::new(InitEngine::new(
            Arc::clone(&config),
            Arc::clone(&db),
            Arc::clone(&workspaces),
            Arc::clone(&services),
            Arc::clone(&bus),
        ));
        init.initialize(&task_id).await.unwrap();

        let engine = ChatEngine::new(
            Arc::clone(&config),
            Arc::clone(&db),
            Arc::clone(&bus),
            Arc::clone(&llm),
            Arc::clone(&workspaces),
            Arc::clone(&checkpoints),
            Arc::clone(&watchers),
            Some(Arc::clone(&init)),
            None,
        );

        Self {
            tmp,
            config,
            db,
            bus,
            workspaces,
            watchers,
            checkpoints,
            services,
            init,
            engine,
            task_id,
        }
    }

    pub fn task(&self) -> Task {
        self.db.get_task(&self.task_id).unwrap().unwrap()
    }

    pub fn workspace(&self) -> std::path::PathBuf {
        std::path::PathBuf::from(self.task().workspace_path)
    }
}
