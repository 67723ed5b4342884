use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use anyhow::Result;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::EventBus;
use crate::llm::StreamChunk;

/// Events are coalesced at this window: the watcher polls and diffs one
/// snapshot per window.
pub const DEBOUNCE_MS: u64 = 100;

/// Names ignored regardless of .gitignore contents.
const ALWAYS_IGNORE_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "dist",
    "build",
    ".next",
    ".venv",
    "__pycache__",
    ".idea",
    ".vscode",
];
const ALWAYS_IGNORE_FILES: &[&str] = &[".DS_Store", "Thumbs.db"];
const ALWAYS_IGNORE_SUFFIXES: &[&str] = &[".swp", ".swo", "~"];

// ── Ignore filter ─────────────────────────────────────────────────────────

/// `.gitignore`-aware path filter with the always-ignore set layered on top.
/// Supports the common pattern forms: bare names, anchored (`/x`), directory
/// (`x/`) and single-star globs (`*.log`).
#[derive(Debug, Default)]
pub struct IgnoreFilter {
    patterns: Vec<String>,
}

impl IgnoreFilter {
    pub fn load(workspace: &Path) -> Self {
        let mut patterns = Vec::new();
        if let Ok(contents) = std::fs::read_to_string(workspace.join(".gitignore")) {
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                    continue;
                }
                patterns.push(line.to_string());
            }
        }
        Self { patterns }
    }

    pub fn is_ignored(&self, rel_path: &str, is_dir: bool) -> bool {
        let name = rel_path.rsplit('/').next().unwrap_or(rel_path);
        if rel_path
            .split('/')
            .any(|seg| ALWAYS_IGNORE_DIRS.contains(&seg))
        {
            return true;
        }
        if !is_dir
            && (ALWAYS_IGNORE_FILES.contains(&name)
                || ALWAYS_IGNORE_SUFFIXES.iter().any(|s| name.ends_with(s)))
        {
            return true;
        }
        self.patterns.iter().any(|p| match_pattern(p, rel_path, name))
    }
}

fn match_pattern(pattern: &str, rel_path: &str, name: &str) -> bool {
    if let Some(dir) = pattern.strip_suffix('/') {
        let dir = dir.trim_start_matches('/');
        return rel_path == dir
            || rel_path.starts_with(&format!("{dir}/"))
            || rel_path.split('/').any(|seg| seg == dir);
    }
    if let Some(anchored) = pattern.strip_prefix('/') {
        return rel_path == anchored || rel_path.starts_with(&format!("{anchored}/"));
    }
    if let Some((prefix, suffix)) = pattern.split_once('*') {
        return name.starts_with(prefix) && name.ends_with(suffix) && !pattern.contains('/');
    }
    rel_path == pattern
        || name == pattern
        || rel_path.starts_with(&format!("{pattern}/"))
}

// ── Control seam ──────────────────────────────────────────────────────────

/// Pause/resume handle used by the checkpoint restore flow. Local mode
/// toggles the in-process watcher; remote mode calls the sidecar.
#[async_trait]
pub trait WatcherControl: Send + Sync {
    async fn pause(&self) -> Result<()>;
    async fn resume(&self) -> Result<()>;
    fn stop(&self) {}
}

/// Remote control: `/api/watcher/pause` and `/api/watcher/resume` on the
/// task's sidecar.
pub struct RemoteWatcherControl {
    base_url: String,
    client: reqwest::Client,
}

impl RemoteWatcherControl {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn post(&self, path: &str) -> Result<()> {
        self.client
            .post(format!("{}{path}", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl WatcherControl for RemoteWatcherControl {
    async fn pause(&self) -> Result<()> {
        self.post("/api/watcher/pause").await
    }

    async fn resume(&self) -> Result<()> {
        self.post("/api/watcher/resume").await
    }
}

// ── Local watcher ─────────────────────────────────────────────────────────

type Snapshot = HashMap<PathBuf, (SystemTime, u64, bool)>;

/// Debounced filesystem watcher for a local workspace. Polls one snapshot
/// per debounce window and diffs it against the previous one; `fs-change`
/// events are published relative to the workspace root. Pausing drops
/// buffered events; resuming re-arms with a clean baseline.
pub struct FsWatcher {
    task_id: String,
    workspace: PathBuf,
    bus: Arc<EventBus>,
    paused: AtomicBool,
    cancel: CancellationToken,
}

impl FsWatcher {
    /// Start watching and return the control handle.
    pub fn spawn(
        task_id: impl Into<String>,
        workspace: impl Into<PathBuf>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let watcher = Arc::new(Self {
            task_id: task_id.into(),
            workspace: workspace.into(),
            bus,
            paused: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });
        let this = Arc::clone(&watcher);
        tokio::spawn(async move { this.run().await });
        watcher
    }

    async fn run(self: Arc<Self>) {
        let filter = IgnoreFilter::load(&self.workspace);
        let mut baseline = self.snapshot(&filter);
        let mut interval = tokio::time::interval(Duration::from_millis(DEBOUNCE_MS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(task_id = %self.task_id, "watcher stopped");
                    return;
                }
                _ = interval.tick() => {}
            }
            let current = self.snapshot(&filter);
            if self.paused.load(Ordering::Acquire) {
                // Paused: keep re-baselining so buffered events are dropped,
                // not replayed on resume.
                baseline = current;
                continue;
            }
            self.diff_and_publish(&baseline, &current).await;
            baseline = current;
        }
    }

    fn snapshot(&self, filter: &IgnoreFilter) -> Snapshot {
        let mut snap = Snapshot::new();
        let mut stack = vec![self.workspace.clone()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let rel = self.rel(&path);
                let Ok(meta) = entry.metadata() else { continue };
                let is_dir = meta.is_dir();
                if filter.is_ignored(&rel, is_dir) {
                    continue;
                }
                let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                snap.insert(path.clone(), (mtime, meta.len(), is_dir));
                if is_dir {
                    stack.push(path);
                }
            }
        }
        snap
    }

    async fn diff_and_publish(&self, before: &Snapshot, after: &Snapshot) {
        let now = chrono::Utc::now().timestamp_millis();
        for (path, (mtime, len, is_dir)) in after {
            match before.get(path) {
                None => self.publish("created", path, *is_dir, now).await,
                Some((old_mtime, old_len, _)) if old_mtime != mtime || old_len != len => {
                    self.publish("modified", path, *is_dir, now).await;
                }
                Some(_) => {}
            }
        }
        for (path, (_, _, is_dir)) in before {
            if !after.contains_key(path) {
                self.publish("deleted", path, *is_dir, now).await;
            }
        }
    }

    async fn publish(&self, operation: &str, path: &Path, is_dir: bool, ts: i64) {
        self.bus
            .publish(
                &self.task_id,
                StreamChunk::FsChange {
                    operation: operation.to_string(),
                    file_path: self.rel(path),
                    timestamp: ts,
                    is_directory: is_dir,
                },
            )
            .await;
    }

    fn rel(&self, path: &Path) -> String {
        path.strip_prefix(&self.workspace)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }
}

#[async_trait]
impl WatcherControl for FsWatcher {
    async fn pause(&self) -> Result<()> {
        self.paused.store(true, Ordering::Release);
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.paused.store(false, Ordering::Release);
        Ok(())
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

// ── Registry ──────────────────────────────────────────────────────────────

/// Per-task watcher handles, looked up by the checkpoint restore flow.
pub struct WatcherRegistry {
    watchers: Mutex<HashMap<String, Arc<dyn WatcherControl>>>,
}

impl WatcherRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            watchers: Mutex::new(HashMap::new()),
        })
    }

    pub async fn register(&self, task_id: &str, control: Arc<dyn WatcherControl>) {
        let mut map = self.watchers.lock().await;
        if let Some(previous) = map.insert(task_id.to_string(), control) {
            previous.stop();
        }
    }

    pub async fn get(&self, task_id: &str) -> Option<Arc<dyn WatcherControl>> {
        let map = self.watchers.lock().await;
        map.get(task_id).cloned()
    }

    pub async fn remove(&self, task_id: &str) {
        let mut map = self.watchers.lock().await;
        if let Some(control) = map.remove(task_id) {
            control.stop();
        } else {
            warn!(task_id, "no watcher registered to remove");
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_ignored_paths() {
        let filter = IgnoreFilter::default();
        assert!(filter.is_ignored(".git/HEAD", false));
        assert!(filter.is_ignored("node_modules/pkg/index.js", false));
        assert!(filter.is_ignored("src/.DS_Store", false));
        assert!(filter.is_ignored("src/main.rs.swp", false));
        assert!(filter.is_ignored("notes~", false));
        assert!(!filter.is_ignored("src/main.rs", false));
    }

    #[test]
    fn gitignore_patterns() {
        let filter = IgnoreFilter {
            patterns: vec![
                "*.log".to_string(),
                "coverage/".to_string(),
                "/secrets.env".to_string(),
                "tmp".to_string(),
            ],
        };
        assert!(filter.is_ignored("app.log", false));
        assert!(filter.is_ignored("deep/nested/app.log", false));
        assert!(filter.is_ignored("coverage/lcov.info", false));
        assert!(filter.is_ignored("secrets.env", false));
        assert!(!filter.is_ignored("config/secrets.env", false));
        assert!(filter.is_ignored("tmp", true));
        assert!(filter.is_ignored("tmp/scratch.txt", false));
        assert!(!filter.is_ignored("src/lib.rs", false));
    }

    #[tokio::test]
    async fn watcher_emits_debounced_changes() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let watcher = FsWatcher::spawn("t1", dir.path(), Arc::clone(&bus));
        // Let the watcher take its initial baseline.
        tokio::time::sleep(Duration::from_millis(250)).await;

        let (_, mut rx) = bus.subscribe("t1").await;
        std::fs::write(dir.path().join("hello.txt"), "hi").unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        let mut created = false;
        while let Ok(chunk) = rx.try_recv() {
            if let StreamChunk::FsChange {
                operation,
                file_path,
                ..
            } = chunk
            {
                if operation == "created" && file_path == "hello.txt" {
                    created = true;
                }
            }
        }
        assert!(created, "expected a created event for hello.txt");
        watcher.stop();
    }

    #[tokio::test]
    async fn paused_watcher_drops_events() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let watcher = FsWatcher::spawn("t1", dir.path(), Arc::clone(&bus));
        tokio::time::sleep(Duration::from_millis(250)).await;

        watcher.pause().await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let (_, mut rx) = bus.subscribe("t1").await;
        std::fs::write(dir.path().join("silent.txt"), "x").unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        watcher.resume().await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        while let Ok(chunk) = rx.try_recv() {
            if let StreamChunk::FsChange { file_path, .. } = chunk {
                assert_ne!(file_path, "silent.txt", "paused event leaked through");
            }
        }
        watcher.stop();
    }
}
