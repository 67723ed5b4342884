mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{run_git, Fixture, Step};
use shadow_core::chat::{EditInput, ProcessInput};
use shadow_core::types::{MessagePart, MessageRole, TaskStatus};

fn input(fx: &Fixture, text: &str) -> ProcessInput {
    ProcessInput::new(fx.task_id.clone(), text, "test-model")
}

// ── Happy path ────────────────────────────────────────────────────────────

#[tokio::test]
async fn happy_path_persists_commits_and_checkpoints() {
    let fx = Fixture::new(vec![vec![
        Step::Text("Creating the file. "),
        Step::Tool(
            "write_file",
            json!({"path": "hello.md", "content": "hello\n", "instructions": "add hello file"}),
        ),
        Step::Text("Done."),
    ]])
    .await;

    fx.engine
        .process_user_message(input(&fx, "add a hello file"))
        .await
        .unwrap();

    // Messages: user, assistant, tool — gap-free sequences from 1.
    let messages = fx.db.get_messages("t1").unwrap();
    let seqs: Vec<i64> = messages.iter().map(|m| m.sequence).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[1].role, MessageRole::Assistant);
    assert_eq!(messages[2].role, MessageRole::Tool);

    // Assistant content is the concatenated text parts; the parts list
    // carries the tool call and its result in order.
    let assistant = &messages[1];
    assert_eq!(assistant.content, "Creating the file. Done.");
    assert!(!assistant.metadata.is_streaming);
    assert_eq!(assistant.metadata.finish_reason.as_deref(), Some("stop"));
    assert_eq!(assistant.metadata.usage.unwrap().total_tokens, 15);
    let kinds: Vec<&str> = assistant
        .metadata
        .parts
        .iter()
        .map(|p| match p {
            MessagePart::Text { .. } => "text",
            MessagePart::ToolCall { .. } => "tool-call",
            MessagePart::ToolResult { .. } => "tool-result",
            MessagePart::Error { .. } => "error",
        })
        .collect();
    assert_eq!(kinds, vec!["text", "tool-call", "tool-result", "text"]);

    // Tool message completed, and the write actually happened.
    let tool = &messages[2];
    let meta = tool.metadata.tool.as_ref().unwrap();
    assert_eq!(meta.name, "write_file");
    assert_eq!(meta.status, "COMPLETED");
    assert!(!tool.metadata.is_streaming);
    let workspace = fx.workspace();
    assert_eq!(
        std::fs::read_to_string(workspace.join("hello.md")).unwrap(),
        "hello\n"
    );

    // Task finalized with a scheduled teardown.
    let task = fx.task();
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.scheduled_cleanup_at.is_some());

    // The turn was committed to the shadow branch with the co-author
    // trailer and pushed to origin.
    assert_eq!(
        run_git(&workspace, &["rev-parse", "--abbrev-ref", "HEAD"]).trim(),
        "shadow/task-t1"
    );
    let log = run_git(&workspace, &["log", "-1", "--format=%B"]);
    assert!(log.starts_with("Update code via agent"));
    assert!(log.contains("Co-authored-by: Shadow <noreply@shadowrealm.ai>"));
    let origin = fx.tmp.path().join("origin");
    run_git(&origin, &["rev-parse", "shadow/task-t1"]);

    // Checkpoint attached to the assistant message at the new HEAD.
    let head = run_git(&workspace, &["rev-parse", "HEAD"]).trim().to_string();
    let refreshed = fx.db.get_messages("t1").unwrap();
    let checkpoint = refreshed[1].metadata.checkpoint.as_ref().unwrap();
    assert_eq!(checkpoint.commit_sha, head);
    assert_eq!(checkpoint.workspace_state, "clean");
}

// ── Interrupt (queue=false) ───────────────────────────────────────────────

#[tokio::test]
async fn new_message_interrupts_active_stream() {
    let fx = Fixture::new(vec![
        vec![Step::Text("started "), Step::Sleep(5_000), Step::Text("never")],
        vec![Step::Text("second answer")],
    ])
    .await;

    let engine = Arc::clone(&fx.engine);
    let first_input = input(&fx, "first ask");
    let first = tokio::spawn(async move { engine.process_user_message(first_input).await });
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(fx.engine.has_active_stream("t1").await);

    fx.engine
        .process_user_message(input(&fx, "second ask"))
        .await
        .unwrap();
    first.await.unwrap().unwrap();

    let messages = fx.db.get_messages("t1").unwrap();
    let seqs: Vec<i64> = messages.iter().map(|m| m.sequence).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4], "no duplicated sequences");

    // The interrupted assistant turn kept its partial text and was
    // finalized; the second turn completed normally.
    assert_eq!(messages[1].role, MessageRole::Assistant);
    assert_eq!(messages[1].content, "started ");
    assert!(!messages[1].metadata.is_streaming);
    assert_eq!(messages[3].content, "second answer");
    assert_eq!(fx.task().status, TaskStatus::Completed);
    assert!(!fx.engine.has_active_stream("t1").await);
}

// ── Queue overwrite (queue=true) ──────────────────────────────────────────

#[tokio::test]
async fn queued_message_is_replaced_by_newer_one() {
    let fx = Fixture::new(vec![
        vec![Step::Text("first "), Step::Sleep(1_200)],
        vec![Step::Text("reply to B")],
    ])
    .await;

    let engine = Arc::clone(&fx.engine);
    let first_input = input(&fx, "first ask");
    let first = tokio::spawn(async move { engine.process_user_message(first_input).await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut queued_a = input(&fx, "message A");
    queued_a.queue = true;
    fx.engine.process_user_message(queued_a).await.unwrap();
    let mut queued_b = input(&fx, "message B");
    queued_b.queue = true;
    fx.engine.process_user_message(queued_b).await.unwrap();

    first.await.unwrap().unwrap();

    let messages = fx.db.get_messages("t1").unwrap();
    let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
    assert!(contents.contains(&"message B"));
    assert!(
        !contents.iter().any(|c| c.contains("message A")),
        "overwritten queued message must leave no trace: {contents:?}"
    );
    assert_eq!(messages.last().unwrap().content, "reply to B");
}

// ── Edit rewind ───────────────────────────────────────────────────────────

#[tokio::test]
async fn edit_rewinds_history_workspace_and_todos() {
    let fx = Fixture::new(vec![
        vec![
            Step::Tool("write_file", json!({"path": "a.txt", "content": "one\n"})),
            Step::Tool(
                "todo_write",
                json!({"todos": [{"content": "write a", "status": "COMPLETED"}]}),
            ),
            Step::Text("done one"),
        ],
        vec![
            Step::Tool("write_file", json!({"path": "b.txt", "content": "two\n"})),
            Step::Tool(
                "todo_write",
                json!({"todos": [{"content": "write b", "status": "COMPLETED"}]}),
            ),
            Step::Text("done two"),
        ],
        vec![Step::Text("redone")],
    ])
    .await;

    fx.engine
        .process_user_message(input(&fx, "write file a"))
        .await
        .unwrap();
    fx.engine
        .process_user_message(input(&fx, "write file b"))
        .await
        .unwrap();

    let messages = fx.db.get_messages("t1").unwrap();
    let first_assistant = messages
        .iter()
        .find(|m| m.role == MessageRole::Assistant)
        .unwrap();
    let checkpoint_a = first_assistant.metadata.checkpoint.clone().unwrap();
    let second_assistant = messages
        .iter()
        .filter(|m| m.role == MessageRole::Assistant)
        .nth(1)
        .unwrap();
    let checkpoint_b = second_assistant.metadata.checkpoint.clone().unwrap();
    assert_ne!(checkpoint_a.commit_sha, checkpoint_b.commit_sha);
    let edited = messages
        .iter()
        .find(|m| m.content == "write file b")
        .unwrap()
        .clone();

    fx.engine
        .edit_user_message(EditInput {
            task_id: fx.task_id.clone(),
            message_id: edited.id,
            new_content: "different ask".to_string(),
            new_model: "test-model".to_string(),
            user_api_keys: Default::default(),
        })
        .await
        .unwrap();

    let workspace = fx.workspace();
    // HEAD is back at the first checkpoint; the second turn's work is gone
    // and its commit is no longer reachable from HEAD.
    let head = run_git(&workspace, &["rev-parse", "HEAD"]).trim().to_string();
    assert_eq!(head, checkpoint_a.commit_sha);
    assert!(workspace.join("a.txt").exists());
    assert!(!workspace.join("b.txt").exists());
    let reachable = run_git(&workspace, &["rev-list", "HEAD"]);
    assert!(!reachable.contains(&checkpoint_b.commit_sha));

    // History was truncated at the edited message and re-driven.
    let messages = fx.db.get_messages("t1").unwrap();
    let edited_row = fx.db.get_message(edited.id).unwrap().unwrap();
    assert_eq!(edited_row.content, "different ask");
    assert!(edited_row.edited_at.is_some());
    assert!(messages
        .iter()
        .all(|m| m.sequence <= edited.sequence || m.content == "redone"));
    assert_eq!(messages.last().unwrap().content, "redone");

    // Todos match the first checkpoint's snapshot.
    let todos = fx.db.list_todos("t1").unwrap();
    assert_eq!(todos.len(), 1);
    assert_eq!(todos[0].content, "write a");

    // The replacement turn checkpoints deterministically as well.
    let replacement = messages.last().unwrap();
    let replacement_ck = replacement.metadata.checkpoint.as_ref().unwrap();
    assert_eq!(replacement_ck.commit_sha, checkpoint_a.commit_sha);
}

// ── Error path ────────────────────────────────────────────────────────────

#[tokio::test]
async fn stream_error_fails_task_and_discards_queue() {
    let fx = Fixture::new(vec![vec![Step::Text("oops "), Step::Fail("boom")]]).await;

    fx.engine
        .process_user_message(input(&fx, "do something"))
        .await
        .unwrap();

    let task = fx.task();
    assert_eq!(task.status, TaskStatus::Failed);

    let messages = fx.db.get_messages("t1").unwrap();
    let assistant = messages
        .iter()
        .find(|m| m.role == MessageRole::Assistant)
        .unwrap();
    assert_eq!(assistant.metadata.finish_reason.as_deref(), Some("error"));
    assert!(!assistant.metadata.is_streaming);
    assert!(assistant
        .metadata
        .parts
        .iter()
        .any(|p| matches!(p, MessagePart::Error { message } if message == "boom")));
}

// ── Follow-up reconciliation ──────────────────────────────────────────────

#[tokio::test]
async fn follow_up_on_completed_task_resumes_when_cleanup_pending() {
    let fx = Fixture::new(vec![
        vec![Step::Text("first")],
        vec![Step::Text("second")],
    ])
    .await;

    fx.engine
        .process_user_message(input(&fx, "first ask"))
        .await
        .unwrap();
    assert_eq!(fx.task().status, TaskStatus::Completed);
    assert!(fx.task().scheduled_cleanup_at.is_some());

    fx.engine
        .process_user_message(input(&fx, "follow up"))
        .await
        .unwrap();
    let messages = fx.db.get_messages("t1").unwrap();
    assert_eq!(messages.last().unwrap().content, "second");
    assert_eq!(fx.task().status, TaskStatus::Completed);
}

#[tokio::test]
async fn follow_up_after_teardown_defers_to_initializer() {
    let fx = Fixture::new(vec![vec![Step::Text("first")]]).await;

    fx.engine
        .process_user_message(input(&fx, "first ask"))
        .await
        .unwrap();
    // Simulate the sweeper having torn the workspace down.
    fx.db.clear_scheduled_cleanup("t1").unwrap();

    fx.engine
        .process_user_message(input(&fx, "follow up"))
        .await
        .unwrap();

    let task = fx.task();
    assert_eq!(task.status, TaskStatus::Initializing);
    assert_eq!(task.init_status, shadow_core::types::InitStatus::Inactive);
    // The follow-up was not persisted: the initializer will re-drive it.
    let messages = fx.db.get_messages("t1").unwrap();
    assert!(messages.iter().all(|m| m.content != "follow up"));
}

// ── Stop ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn stop_finalizes_stream_as_stopped() {
    let fx = Fixture::new(vec![vec![
        Step::Text("working "),
        Step::Sleep(5_000),
        Step::Text("never"),
    ]])
    .await;

    let engine = Arc::clone(&fx.engine);
    let first_input = input(&fx, "long task");
    let handle = tokio::spawn(async move { engine.process_user_message(first_input).await });
    tokio::time::sleep(Duration::from_millis(300)).await;

    fx.engine.stop("t1").await.unwrap();
    handle.await.unwrap().unwrap();

    let task = fx.task();
    assert_eq!(task.status, TaskStatus::Stopped);
    assert!(task.scheduled_cleanup_at.is_some());
    assert!(!fx.engine.has_active_stream("t1").await);
}
