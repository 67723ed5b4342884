use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use shadow_core::executor::local::LocalExecutor;
use shadow_core::executor::{
    CommandOptions, ExecError, Executor, GrepOptions, ReadOptions,
};

fn fixture() -> (TempDir, Arc<LocalExecutor>) {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    write(root, "README.md", "# demo\nA tiny fixture project.\n");
    write(root, "src/main.rs", "fn main() {\n    println!(\"hello\");\n}\n");
    write(
        root,
        "src/lib.rs",
        "pub fn add(a: i32, b: i32) -> i32 {\n    a + b\n}\n",
    );
    write(root, "node_modules/pkg/index.js", "ignored\n");
    let executor = Arc::new(LocalExecutor::new(
        "t1",
        root.to_string_lossy().to_string(),
    ));
    (tmp, executor)
}

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

// ── read_file ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn read_whole_file_and_ranges() {
    let (_tmp, ex) = fixture();

    let whole = ex.read_file("src/main.rs", ReadOptions::default()).await.unwrap();
    assert_eq!(whole.total_lines, 3);
    assert_eq!(whole.start_line, 1);
    assert_eq!(whole.end_line, 3);

    let range = ex
        .read_file(
            "src/main.rs",
            ReadOptions {
                entire: false,
                start: Some(2),
                end: Some(2),
            },
        )
        .await
        .unwrap();
    assert_eq!(range.content, "    println!(\"hello\");");
    assert_eq!(range.start_line, 2);

    // Leading slash is workspace-relative, not absolute.
    let slashed = ex.read_file("/README.md", ReadOptions::default()).await.unwrap();
    assert!(slashed.content.starts_with("# demo"));
}

#[tokio::test]
async fn read_errors_are_typed() {
    let (_tmp, ex) = fixture();

    let missing = ex.read_file("nope.txt", ReadOptions::default()).await;
    assert!(matches!(missing, Err(ExecError::NotFound(_))));

    let out_of_range = ex
        .read_file(
            "src/main.rs",
            ReadOptions {
                entire: false,
                start: Some(2),
                end: Some(99),
            },
        )
        .await;
    assert!(matches!(out_of_range, Err(ExecError::InvalidRange(_))));

    let escape = ex.read_file("../outside.txt", ReadOptions::default()).await;
    assert!(matches!(escape, Err(ExecError::InvalidRange(_))));
}

// ── write_file / search_replace / delete_file ─────────────────────────────

#[tokio::test]
async fn write_reports_new_file_and_line_accounting() {
    let (_tmp, ex) = fixture();

    let created = ex
        .write_file("docs/new.md", "one\ntwo\n", "add docs")
        .await
        .unwrap();
    assert!(created.is_new_file);
    assert_eq!(created.lines_added, 2);
    assert_eq!(created.lines_removed, 0);

    let overwritten = ex
        .write_file("docs/new.md", "only\n", "trim docs")
        .await
        .unwrap();
    assert!(!overwritten.is_new_file);
    assert_eq!(overwritten.lines_added, 1);
    assert_eq!(overwritten.lines_removed, 2);
}

#[tokio::test]
async fn search_replace_requires_a_unique_match() {
    let (_tmp, ex) = fixture();
    ex.write_file("notes.txt", "alpha beta alpha\n", "")
        .await
        .unwrap();

    let ambiguous = ex.search_replace("notes.txt", "alpha", "gamma").await;
    assert!(matches!(ambiguous, Err(ExecError::Ambiguous(_))));

    let missing = ex.search_replace("notes.txt", "delta", "gamma").await;
    assert!(matches!(missing, Err(ExecError::NotFound(_))));

    ex.search_replace("notes.txt", "beta", "gamma").await.unwrap();
    let content = ex.read_file("notes.txt", ReadOptions::default()).await.unwrap();
    assert_eq!(content.content, "alpha gamma alpha\n");
}

#[tokio::test]
async fn delete_is_idempotent() {
    let (_tmp, ex) = fixture();

    let first = ex.delete_file("README.md").await.unwrap();
    assert!(!first.was_already_deleted);
    let second = ex.delete_file("README.md").await.unwrap();
    assert!(second.was_already_deleted);
}

// ── Listing & search ──────────────────────────────────────────────────────

#[tokio::test]
async fn listing_flat_and_recursive() {
    let (_tmp, ex) = fixture();

    let entries = ex.list_directory(".").await.unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert!(names.contains(&"README.md"));
    assert!(names.contains(&"src"));

    let all = ex.list_directory_recursive(".").await.unwrap();
    let paths: Vec<&str> = all.iter().map(|e| e.relative_path.as_str()).collect();
    assert!(paths.contains(&"src/main.rs"));
    assert!(paths.contains(&"src/lib.rs"));
    assert!(
        !paths.iter().any(|p| p.starts_with("node_modules")),
        "recursive listing must prune dependency dirs"
    );

    let missing = ex.list_directory("no/such/dir").await;
    assert!(matches!(missing, Err(ExecError::NotFound(_))));
}

#[tokio::test]
async fn fuzzy_filename_search_ranks_name_matches_first() {
    let (_tmp, ex) = fixture();
    let hits = ex.search_files("main.rs").await.unwrap();
    assert_eq!(hits.first().map(String::as_str), Some("src/main.rs"));

    let sub = ex.search_files("librs").await.unwrap();
    assert!(sub.contains(&"src/lib.rs".to_string()));
}

#[tokio::test]
async fn grep_finds_matches_and_empty_is_success() {
    let (_tmp, ex) = fixture();

    let result = ex
        .grep_search("println", GrepOptions::default())
        .await
        .unwrap();
    assert_eq!(result.matches.len(), 1);
    assert_eq!(result.matches[0].path, "src/main.rs");
    assert_eq!(result.matches[0].line, 2);

    let none = ex
        .grep_search("nothing_matches_this", GrepOptions::default())
        .await
        .unwrap();
    assert!(none.matches.is_empty());
    assert!(!none.truncated);

    let insensitive = ex
        .grep_search(
            "PRINTLN",
            GrepOptions {
                case_sensitive: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(insensitive.matches.len(), 1);
}

#[tokio::test]
async fn codebase_search_is_deterministic() {
    let (_tmp, ex) = fixture();

    let first = ex.codebase_search("println hello", &[]).await.unwrap();
    let second = ex.codebase_search("println hello", &[]).await.unwrap();
    assert!(!first.is_empty());
    assert!(first.len() <= 5);
    assert_eq!(first[0].path, "src/main.rs");
    let key = |s: &shadow_core::executor::CodeSnippet| (s.path.clone(), s.start_line, s.score);
    assert_eq!(
        first.iter().map(key).collect::<Vec<_>>(),
        second.iter().map(key).collect::<Vec<_>>()
    );
}

// ── Commands & terminal ───────────────────────────────────────────────────

#[tokio::test]
async fn commands_capture_output_and_record_terminal_history() {
    let (_tmp, ex) = fixture();

    let result = ex
        .execute_command("echo hi && echo err 1>&2", CommandOptions::default())
        .await
        .unwrap();
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout.trim(), "hi");
    assert_eq!(result.stderr.trim(), "err");

    let failing = ex
        .execute_command("exit 3", CommandOptions::default())
        .await
        .unwrap();
    assert_eq!(failing.exit_code, 3);

    let history = ex.terminal_history(0).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].command, "echo hi && echo err 1>&2");
    let newer = ex.terminal_history(history[0].id).await.unwrap();
    assert_eq!(newer.len(), 1);

    ex.terminal_clear().await.unwrap();
    assert!(ex.terminal_history(0).await.unwrap().is_empty());
}

#[tokio::test]
async fn foreground_timeout_is_typed() {
    let (_tmp, ex) = fixture();
    let result = ex
        .execute_command(
            "sleep 5",
            CommandOptions {
                timeout_s: 1,
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(result, Err(ExecError::Timeout(_))));
}

#[tokio::test]
async fn background_commands_return_immediately() {
    let (_tmp, ex) = fixture();
    let started = std::time::Instant::now();
    let result = ex
        .execute_command(
            "sleep 5",
            CommandOptions {
                background: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(result.background);
    assert!(started.elapsed() < std::time::Duration::from_secs(2));
}
