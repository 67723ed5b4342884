use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{
    resolve_workspace_path, CodeSnippet, CommandOptions, CommandResult, CommitRequest,
    CommitResult, DeleteResult, DirEntry, EntryKind, ExecError, ExecResult, Executor,
    FileReadResult, GrepMatch, GrepOptions, GrepResult, ReadOptions, SearchReplaceResult,
    WriteResult, MAX_CODE_SNIPPETS, MAX_FILE_SEARCH_RESULTS, MAX_GREP_MATCHES,
};
use crate::types::TerminalEntry;

/// Directories never traversed by listing, search or scoring.
const SKIP_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "dist",
    "build",
    ".next",
    ".venv",
    "__pycache__",
];

/// Files larger than this are skipped by codebase search.
const MAX_SEARCH_FILE_BYTES: u64 = 262_144;
/// Codebase search scores fixed chunks of this many lines.
const SEARCH_CHUNK_LINES: usize = 30;
/// Terminal log keeps at most this many entries.
const MAX_TERMINAL_ENTRIES: usize = 1_000;

struct TerminalLog {
    next_id: u64,
    entries: Vec<TerminalEntry>,
}

/// Executes workspace operations directly against the host filesystem under
/// the task's workspace root.
pub struct LocalExecutor {
    task_id: String,
    root: PathBuf,
    root_str: String,
    terminal: Mutex<TerminalLog>,
}

impl LocalExecutor {
    pub fn new(task_id: impl Into<String>, workspace_path: impl Into<String>) -> Self {
        let root_str = workspace_path.into();
        Self {
            task_id: task_id.into(),
            root: PathBuf::from(&root_str),
            root_str,
            terminal: Mutex::new(TerminalLog {
                next_id: 1,
                entries: Vec::new(),
            }),
        }
    }

    fn resolve(&self, path: &str) -> ExecResult<PathBuf> {
        resolve_workspace_path(&self.root, path)
    }

    fn rel_to_root(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    async fn run_git(&self, args: &[&str]) -> ExecResult<CommandResult> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.root)
            .args(args)
            .output()
            .await
            .map_err(|e| ExecError::Failed(format!("failed to spawn git {}: {e}", args.join(" "))))?;
        Ok(CommandResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
            background: false,
        })
    }

    /// Walk the workspace yielding files and folders, pruning skip dirs.
    fn walk(&self, start: &Path) -> Vec<(PathBuf, EntryKind)> {
        let mut out = Vec::new();
        let mut stack = vec![start.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let name = entry.file_name().to_string_lossy().into_owned();
                let Ok(file_type) = entry.file_type() else {
                    continue;
                };
                if file_type.is_dir() {
                    if SKIP_DIRS.contains(&name.as_str()) {
                        continue;
                    }
                    out.push((path.clone(), EntryKind::Folder));
                    stack.push(path);
                } else if file_type.is_file() {
                    out.push((path, EntryKind::File));
                }
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    async fn record_terminal(&self, command: &str, result: &CommandResult) {
        let mut log = self.terminal.lock().await;
        let id = log.next_id;
        log.next_id += 1;
        log.entries.push(TerminalEntry {
            id,
            command: command.to_string(),
            output: result.combined_output(),
            exit_code: result.exit_code,
            timestamp: chrono::Utc::now().timestamp(),
        });
        if log.entries.len() > MAX_TERMINAL_ENTRIES {
            log.entries.remove(0);
        }
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn read_file(&self, path: &str, opts: ReadOptions) -> ExecResult<FileReadResult> {
        let full = self.resolve(path)?;
        let content = tokio::fs::read_to_string(&full).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ExecError::NotFound(format!("file not found: {path}"))
            } else {
                ExecError::Failed(format!("read {path}: {e}"))
            }
        })?;
        let lines: Vec<&str> = content.lines().collect();
        let total = lines.len();

        if opts.entire || (opts.start.is_none() && opts.end.is_none()) {
            return Ok(FileReadResult {
                content,
                start_line: 1,
                end_line: total,
                total_lines: total,
            });
        }

        let start = opts.start.unwrap_or(1);
        let end = opts.end.unwrap_or(total);
        if start == 0 || start > end || end > total {
            return Err(ExecError::InvalidRange(format!(
                "range {start}-{end} out of bounds for {path} ({total} lines)"
            )));
        }
        Ok(FileReadResult {
            content: lines[start - 1..end].join("\n"),
            start_line: start,
            end_line: end,
            total_lines: total,
        })
    }

    async fn write_file(
        &self,
        path: &str,
        content: &str,
        instructions: &str,
    ) -> ExecResult<WriteResult> {
        let full = self.resolve(path)?;
        let old = tokio::fs::read_to_string(&full).await.ok();
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ExecError::Failed(format!("create dirs for {path}: {e}")))?;
        }
        tokio::fs::write(&full, content)
            .await
            .map_err(|e| ExecError::Failed(format!("write {path}: {e}")))?;
        debug!(task_id = %self.task_id, path, instructions, "wrote file");
        Ok(WriteResult {
            is_new_file: old.is_none(),
            lines_added: content.lines().count(),
            lines_removed: old.map(|o| o.lines().count()).unwrap_or(0),
        })
    }

    async fn search_replace(
        &self,
        path: &str,
        old: &str,
        new: &str,
    ) -> ExecResult<SearchReplaceResult> {
        let full = self.resolve(path)?;
        let content = tokio::fs::read_to_string(&full).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ExecError::NotFound(format!("file not found: {path}"))
            } else {
                ExecError::Failed(format!("read {path}: {e}"))
            }
        })?;
        match content.matches(old).count() {
            0 => Err(ExecError::NotFound(format!(
                "old string not found in {path}"
            ))),
            1 => {
                let updated = content.replacen(old, new, 1);
                tokio::fs::write(&full, updated)
                    .await
                    .map_err(|e| ExecError::Failed(format!("write {path}: {e}")))?;
                Ok(SearchReplaceResult { replaced: true })
            }
            n => Err(ExecError::Ambiguous(format!(
                "old string occurs {n} times in {path}; it must be unique"
            ))),
        }
    }

    async fn delete_file(&self, path: &str) -> ExecResult<DeleteResult> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(DeleteResult {
                was_already_deleted: false,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DeleteResult {
                was_already_deleted: true,
            }),
            Err(e) => Err(ExecError::Failed(format!("delete {path}: {e}"))),
        }
    }

    async fn list_directory(&self, path: &str) -> ExecResult<Vec<DirEntry>> {
        let full = self.resolve(path)?;
        let mut read_dir = tokio::fs::read_dir(&full).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ExecError::NotFound(format!("directory not found: {path}"))
            } else {
                ExecError::Failed(format!("list {path}: {e}"))
            }
        })?;
        let mut entries = Vec::new();
        while let Ok(Some(entry)) = read_dir.next_entry().await.map_err(|e| {
            ExecError::Failed(format!("list {path}: {e}"))
        }) {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            let kind = if file_type.is_dir() {
                EntryKind::Folder
            } else {
                EntryKind::File
            };
            entries.push(DirEntry {
                relative_path: self.rel_to_root(&entry.path()),
                name,
                kind,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn list_directory_recursive(&self, path: &str) -> ExecResult<Vec<DirEntry>> {
        let full = self.resolve(path)?;
        if !full.is_dir() {
            return Err(ExecError::NotFound(format!("directory not found: {path}")));
        }
        let entries = self
            .walk(&full)
            .into_iter()
            .map(|(p, kind)| DirEntry {
                name: p
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                kind,
                relative_path: self.rel_to_root(&p),
            })
            .collect();
        Ok(entries)
    }

    async fn search_files(&self, query: &str) -> ExecResult<Vec<String>> {
        let needle = query.to_lowercase();
        let mut scored: Vec<(i64, String)> = self
            .walk(&self.root)
            .into_iter()
            .filter(|(_, kind)| *kind == EntryKind::File)
            .filter_map(|(p, _)| {
                let rel = self.rel_to_root(&p);
                let name = p
                    .file_name()
                    .map(|n| n.to_string_lossy().to_lowercase())
                    .unwrap_or_default();
                let score = if name == needle {
                    100
                } else if name.contains(&needle) {
                    50
                } else if rel.to_lowercase().contains(&needle) {
                    25
                } else if is_subsequence(&needle, &name) {
                    10
                } else {
                    return None;
                };
                Some((score, rel))
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        Ok(scored
            .into_iter()
            .take(MAX_FILE_SEARCH_RESULTS)
            .map(|(_, rel)| rel)
            .collect())
    }

    async fn grep_search(&self, query: &str, opts: GrepOptions) -> ExecResult<GrepResult> {
        let mut cmd = Command::new("grep");
        cmd.current_dir(&self.root);
        cmd.args(["-rInE", "--binary-files=without-match"]);
        for dir in SKIP_DIRS {
            cmd.arg(format!("--exclude-dir={dir}"));
        }
        if !opts.case_sensitive {
            cmd.arg("-i");
        }
        if let Some(include) = &opts.include {
            cmd.arg(format!("--include={include}"));
        }
        if let Some(exclude) = &opts.exclude {
            cmd.arg(format!("--exclude={exclude}"));
        }
        cmd.arg("--").arg(query).arg(".");

        let output = cmd
            .output()
            .await
            .map_err(|e| ExecError::Failed(format!("failed to spawn grep: {e}")))?;
        let code = output.status.code().unwrap_or(2);
        if code > 1 {
            return Err(ExecError::Failed(format!(
                "grep failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut matches = Vec::new();
        let mut truncated = false;
        for line in stdout.lines() {
            if matches.len() >= MAX_GREP_MATCHES {
                truncated = true;
                break;
            }
            let Some((path, rest)) = line.split_once(':') else {
                continue;
            };
            let Some((line_no, text)) = rest.split_once(':') else {
                continue;
            };
            let Ok(line_no) = line_no.parse::<usize>() else {
                continue;
            };
            matches.push(GrepMatch {
                path: path.trim_start_matches("./").to_string(),
                line: line_no,
                text: text.to_string(),
            });
        }
        Ok(GrepResult { matches, truncated })
    }

    async fn codebase_search(&self, query: &str, dirs: &[String]) -> ExecResult<Vec<CodeSnippet>> {
        let tokens = split_tokens(query);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let roots: Vec<PathBuf> = if dirs.is_empty() {
            vec![self.root.clone()]
        } else {
            dirs.iter()
                .filter_map(|d| self.resolve(d).ok())
                .filter(|p| p.is_dir())
                .collect()
        };

        let mut snippets: Vec<CodeSnippet> = Vec::new();
        for root in roots {
            for (path, kind) in self.walk(&root) {
                if kind != EntryKind::File {
                    continue;
                }
                if path
                    .metadata()
                    .map(|m| m.len() > MAX_SEARCH_FILE_BYTES)
                    .unwrap_or(true)
                {
                    continue;
                }
                let Ok(content) = std::fs::read_to_string(&path) else {
                    continue;
                };
                let rel = self.rel_to_root(&path);
                for (start, chunk) in chunk_lines(&content, SEARCH_CHUNK_LINES) {
                    let score = score_chunk(&tokens, &chunk);
                    if score == 0 {
                        continue;
                    }
                    let end = start + chunk.lines().count().saturating_sub(1);
                    snippets.push(CodeSnippet {
                        path: rel.clone(),
                        start_line: start,
                        end_line: end,
                        content: chunk,
                        score,
                    });
                }
            }
        }

        snippets.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| a.path.cmp(&b.path))
                .then_with(|| a.start_line.cmp(&b.start_line))
        });
        snippets.truncate(MAX_CODE_SNIPPETS);
        Ok(snippets)
    }

    async fn execute_command(&self, cmd: &str, opts: CommandOptions) -> ExecResult<CommandResult> {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(cmd)
            .current_dir(&self.root)
            .env(
                "SHADOW_NETWORK_ALLOWED",
                if opts.network_allowed { "1" } else { "0" },
            )
            .kill_on_drop(true);

        if opts.background {
            command.stdout(Stdio::null()).stderr(Stdio::null());
            command
                .spawn()
                .map_err(|e| ExecError::Failed(format!("failed to spawn command: {e}")))?;
            return Ok(CommandResult {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
                background: true,
            });
        }

        let fut = command.output();
        let output = match tokio::time::timeout(Duration::from_secs(opts.timeout_s), fut).await {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => return Err(ExecError::Failed(format!("failed to run command: {e}"))),
            Err(_elapsed) => {
                warn!(task_id = %self.task_id, cmd, timeout_s = opts.timeout_s, "command timed out");
                return Err(ExecError::Timeout(format!(
                    "command timed out after {}s",
                    opts.timeout_s
                )));
            }
        };

        let result = CommandResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
            background: false,
        };
        self.record_terminal(cmd, &result).await;
        Ok(result)
    }

    async fn git_status(&self) -> ExecResult<String> {
        let result = self.run_git(&["status", "--porcelain"]).await?;
        if !result.success() {
            return Err(ExecError::Failed(format!(
                "git status failed: {}",
                result.combined_output()
            )));
        }
        Ok(result.stdout)
    }

    async fn git_diff(&self, base: Option<&str>) -> ExecResult<String> {
        let range;
        let args: Vec<&str> = match base {
            Some(b) => {
                range = format!("{b}...HEAD");
                vec!["diff", &range]
            }
            None => vec!["diff", "HEAD"],
        };
        let result = self.run_git(&args).await?;
        if !result.success() {
            return Err(ExecError::Failed(format!(
                "git diff failed: {}",
                result.combined_output()
            )));
        }
        Ok(result.stdout)
    }

    async fn git_commit(&self, req: &CommitRequest) -> ExecResult<CommitResult> {
        let add = self.run_git(&["add", "-A"]).await?;
        if !add.success() {
            return Err(ExecError::Failed(format!(
                "git add failed: {}",
                add.combined_output()
            )));
        }
        let status = self.git_status().await?;
        if status.trim().is_empty() {
            let sha = self.run_git(&["rev-parse", "HEAD"]).await?;
            return Ok(CommitResult {
                committed: false,
                commit_sha: sha.stdout.trim().to_string(),
            });
        }

        let message = format!(
            "{}\n\nCo-authored-by: {} <{}>",
            req.message, req.co_author.name, req.co_author.email
        );
        let author = format!("{} <{}>", req.user.name, req.user.email);
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.root)
            .args(["commit", "-m", &message, "--author", &author])
            .env("GIT_COMMITTER_NAME", &req.user.name)
            .env("GIT_COMMITTER_EMAIL", &req.user.email)
            .output()
            .await
            .map_err(|e| ExecError::Failed(format!("failed to spawn git commit: {e}")))?;
        if !output.status.success() {
            return Err(ExecError::Failed(format!(
                "git commit failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        let sha = self.run_git(&["rev-parse", "HEAD"]).await?;
        Ok(CommitResult {
            committed: true,
            commit_sha: sha.stdout.trim().to_string(),
        })
    }

    async fn git_push(&self, branch: &str, set_upstream: bool) -> ExecResult<()> {
        let mut args = vec!["push"];
        if set_upstream {
            args.push("-u");
        }
        args.push("origin");
        args.push(branch);
        let result = self.run_git(&args).await?;
        if !result.success() {
            let err = result.combined_output();
            if err.contains("Authentication") || err.contains("Permission denied") {
                return Err(ExecError::AuthFailed(err));
            }
            return Err(ExecError::Failed(format!("git push {branch} failed: {err}")));
        }
        Ok(())
    }

    async fn terminal_history(&self, since_id: u64) -> ExecResult<Vec<TerminalEntry>> {
        let log = self.terminal.lock().await;
        Ok(log
            .entries
            .iter()
            .filter(|e| e.id > since_id)
            .cloned()
            .collect())
    }

    async fn terminal_clear(&self) -> ExecResult<()> {
        let mut log = self.terminal.lock().await;
        log.entries.clear();
        Ok(())
    }

    fn workspace_path(&self) -> &str {
        &self.root_str
    }

    fn is_remote(&self) -> bool {
        false
    }

    fn task_id(&self) -> &str {
        &self.task_id
    }
}

// ── Scoring helpers ───────────────────────────────────────────────────────

fn is_subsequence(needle: &str, haystack: &str) -> bool {
    let mut chars = haystack.chars();
    needle.chars().all(|n| chars.any(|h| h == n))
}

/// Lowercased alphanumeric tokens of a free-text query.
fn split_tokens(query: &str) -> Vec<String> {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 2)
        .map(|t| t.to_lowercase())
        .collect()
}

/// Non-overlapping chunks of `size` lines, tagged with their 1-based start.
fn chunk_lines(content: &str, size: usize) -> Vec<(usize, String)> {
    let lines: Vec<&str> = content.lines().collect();
    lines
        .chunks(size)
        .enumerate()
        .map(|(i, chunk)| (i * size + 1, chunk.join("\n")))
        .collect()
}

fn score_chunk(tokens: &[String], chunk: &str) -> u64 {
    let lower = chunk.to_lowercase();
    tokens
        .iter()
        .map(|t| lower.matches(t.as_str()).count() as u64)
        .sum()
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subsequence_matching() {
        assert!(is_subsequence("mrs", "main.rs"));
        assert!(is_subsequence("", "anything"));
        assert!(!is_subsequence("xyz", "main.rs"));
    }

    #[test]
    fn token_splitting_drops_short_tokens() {
        assert_eq!(
            split_tokens("find the EventBus replay_from fn"),
            vec!["find", "the", "eventbus", "replay", "from", "fn"]
        );
        assert!(split_tokens("a !").is_empty());
    }

    #[test]
    fn chunking_tags_start_lines() {
        let content = (1..=70).map(|i| format!("line{i}")).collect::<Vec<_>>().join("\n");
        let chunks = chunk_lines(&content, 30);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].0, 1);
        assert_eq!(chunks[1].0, 31);
        assert_eq!(chunks[2].0, 61);
        assert_eq!(chunks[2].1.lines().count(), 10);
    }

    #[test]
    fn chunk_scoring_counts_token_occurrences() {
        let tokens = split_tokens("event bus");
        assert_eq!(score_chunk(&tokens, "the EventBus publishes events"), 3);
        assert_eq!(score_chunk(&tokens, "nothing relevant"), 0);
    }
}
