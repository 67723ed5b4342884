use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::Db;
use crate::executor::{Executor, ReadOptions};
use crate::llm::LlmClient;

pub const SHADOW_WIKI: &str = "shadowWiki";
pub const INDEXING: &str = "indexing";

/// At most this many tree entries go into the wiki prompt.
const WIKI_TREE_ENTRIES: usize = 200;
/// Manifest/readme excerpt size for the wiki prompt.
const WIKI_FILE_EXCERPT: usize = 4_000;
/// The indexing service reads at most this many files.
const INDEX_MAX_FILES: usize = 200;
/// Top terms kept per indexed file.
const INDEX_TERMS_PER_FILE: usize = 20;

#[derive(Debug, Clone)]
pub struct ServiceRecord {
    pub name: String,
    pub blocking: bool,
    pub started: bool,
    pub completed: bool,
    pub failed: bool,
    pub error: Option<String>,
}

impl ServiceRecord {
    fn new(name: &str, blocking: bool) -> Self {
        Self {
            name: name.to_string(),
            blocking,
            started: true,
            completed: false,
            failed: false,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.completed || self.failed
    }
}

/// Runs optional long jobs per task, in parallel with initialization.
/// `shadowWiki` is blocking (init waits on it); `indexing` runs past ACTIVE.
/// Failures are recorded but never escalate to init failure.
pub struct BackgroundServiceManager {
    config: Arc<Config>,
    db: Arc<Db>,
    llm: Arc<dyn LlmClient>,
    records: Mutex<HashMap<(String, String), ServiceRecord>>,
}

impl BackgroundServiceManager {
    pub fn new(config: Arc<Config>, db: Arc<Db>, llm: Arc<dyn LlmClient>) -> Arc<Self> {
        Arc::new(Self {
            config,
            db,
            llm,
            records: Mutex::new(HashMap::new()),
        })
    }

    /// Launch the enabled services for a task. Returns once they are
    /// launched, not when they finish.
    pub async fn start_for_task(self: &Arc<Self>, task_id: &str, executor: Arc<dyn Executor>) {
        if self.config.enable_shadow_wiki {
            self.launch(task_id, SHADOW_WIKI, true, Arc::clone(&executor))
                .await;
        }
        if self.config.enable_indexing {
            self.launch(task_id, INDEXING, false, executor).await;
        }
    }

    async fn launch(
        self: &Arc<Self>,
        task_id: &str,
        name: &'static str,
        blocking: bool,
        executor: Arc<dyn Executor>,
    ) {
        {
            let mut records = self.records.lock().await;
            records.insert(
                (task_id.to_string(), name.to_string()),
                ServiceRecord::new(name, blocking),
            );
        }
        let this = Arc::clone(self);
        let task_id = task_id.to_string();
        info!(task_id = %task_id, service = name, "background service started");
        tokio::spawn(async move {
            let outcome = match name {
                SHADOW_WIKI => this.run_shadow_wiki(&task_id, executor).await,
                INDEXING => this.run_indexing(&task_id, executor).await,
                _ => Err(anyhow!("unknown background service: {name}")),
            };
            let mut records = this.records.lock().await;
            if let Some(record) = records.get_mut(&(task_id.clone(), name.to_string())) {
                match outcome {
                    Ok(()) => {
                        record.completed = true;
                        info!(task_id = %task_id, service = name, "background service completed");
                    }
                    Err(e) => {
                        record.failed = true;
                        record.error = Some(e.to_string());
                        warn!(task_id = %task_id, service = name, "background service failed: {e}");
                    }
                }
            }
        });
    }

    /// True iff every blocking service for the task has reached a terminal
    /// state. Non-blocking services are ignored.
    pub async fn are_all_services_complete(&self, task_id: &str) -> bool {
        let records = self.records.lock().await;
        records
            .iter()
            .filter(|((tid, _), r)| tid == task_id && r.blocking)
            .all(|(_, r)| r.is_terminal())
    }

    pub async fn get_records(&self, task_id: &str) -> Vec<ServiceRecord> {
        let records = self.records.lock().await;
        let mut out: Vec<ServiceRecord> = records
            .iter()
            .filter(|((tid, _), _)| tid == task_id)
            .map(|(_, r)| r.clone())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub async fn cleanup_task(&self, task_id: &str) {
        let mut records = self.records.lock().await;
        records.retain(|(tid, _), _| tid != task_id);
    }

    // ── shadowWiki ────────────────────────────────────────────────────────

    /// Generate (or reuse) the repo summary and link it to the task.
    /// Summaries are unique per repo and shared across its tasks.
    async fn run_shadow_wiki(&self, task_id: &str, executor: Arc<dyn Executor>) -> Result<()> {
        let task = self
            .db
            .get_task(task_id)?
            .ok_or_else(|| anyhow!("task not found: {task_id}"))?;

        if let Some(existing) = self.db.get_codebase_understanding(&task.repo_full_name)? {
            self.db.set_codebase_understanding_id(task_id, existing.id)?;
            return Ok(());
        }

        let tree = executor
            .list_directory_recursive(".")
            .await
            .map_err(|e| anyhow!("list workspace: {e}"))?;
        let tree_text: String = tree
            .iter()
            .take(WIKI_TREE_ENTRIES)
            .map(|e| e.relative_path.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let mut excerpts = String::new();
        for candidate in ["README.md", "package.json", "Cargo.toml", "pyproject.toml"] {
            if let Ok(read) = executor.read_file(candidate, ReadOptions::default()).await {
                let excerpt: String = read.content.chars().take(WIKI_FILE_EXCERPT).collect();
                excerpts.push_str(&format!("\n--- {candidate} ---\n{excerpt}\n"));
            }
        }

        let prompt = format!(
            "Summarize this repository for a coding agent: purpose, main components, \
             where key logic lives, build/test entry points. Be concise (under 400 words).\n\n\
             File tree:\n{tree_text}\n{excerpts}"
        );
        let summary = self
            .llm
            .complete(&prompt, &self.config.small_model, &HashMap::new())
            .await?;

        let understanding = json!({
            "repo": task.repo_full_name,
            "model": self.config.small_model,
            "generatedAt": Utc::now().to_rfc3339(),
            "summary": summary,
        });
        let id = self
            .db
            .upsert_codebase_understanding(&task.repo_full_name, &understanding)?;
        self.db.set_codebase_understanding_id(task_id, id)?;
        Ok(())
    }

    // ── indexing ──────────────────────────────────────────────────────────

    /// Build a per-repo token index used to preselect candidate files for
    /// codebase search.
    async fn run_indexing(&self, task_id: &str, executor: Arc<dyn Executor>) -> Result<()> {
        let task = self
            .db
            .get_task(task_id)?
            .ok_or_else(|| anyhow!("task not found: {task_id}"))?;

        let tree = executor
            .list_directory_recursive(".")
            .await
            .map_err(|e| anyhow!("list workspace: {e}"))?;

        let mut files = serde_json::Map::new();
        for entry in tree
            .iter()
            .filter(|e| e.kind == crate::executor::EntryKind::File)
            .take(INDEX_MAX_FILES)
        {
            let Ok(read) = executor
                .read_file(&entry.relative_path, ReadOptions::default())
                .await
            else {
                continue;
            };
            let terms = top_terms(&read.content, INDEX_TERMS_PER_FILE);
            if !terms.is_empty() {
                files.insert(entry.relative_path.clone(), json!(terms));
            }
        }

        let index = json!({
            "builtAt": Utc::now().to_rfc3339(),
            "files": files,
        });
        self.db.save_search_index(&task.repo_full_name, &index)?;
        Ok(())
    }
}

/// The `n` most frequent distinct alphanumeric terms (length ≥ 3) in a file.
fn top_terms(content: &str, n: usize) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for token in content
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 3)
    {
        *counts.entry(token.to_lowercase()).or_insert(0) += 1;
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(n).map(|(t, _)| t).collect()
}

// ── Tests ──────────────────────────────────────────────────────────────────
