mod common;

use common::{Fixture, Step};
use shadow_core::llm::StreamChunk;
use shadow_core::types::{InitStatus, TaskStatus};

#[tokio::test]
async fn local_init_reaches_active_and_emits_progress() {
    // Fixture::new runs initialization; inspect the published events.
    let fx = Fixture::new(vec![vec![Step::Text("unused")]]).await;

    let task = fx.task();
    assert_eq!(task.init_status, InitStatus::Active);
    assert!(!task.workspace_path.is_empty());
    assert!(!task.base_commit_sha.is_empty());
    assert!(task.initialization_error.is_empty());
    assert!(fx.workspace().join(".git").exists());

    let chunks = fx.bus.replay_from("t1", 0).await;
    let mut phases = Vec::new();
    let mut steps = Vec::new();
    for chunk in chunks {
        if let StreamChunk::InitProgress { phase, step, .. } = chunk {
            phases.push(phase);
            if let Some(step) = step {
                steps.push(step);
            }
        }
    }
    assert_eq!(phases.first().map(String::as_str), Some("start"));
    assert_eq!(phases.last().map(String::as_str), Some("complete"));
    assert_eq!(
        steps,
        vec![
            "PREPARE_WORKSPACE",
            "START_BACKGROUND_SERVICES",
            "INSTALL_DEPENDENCIES",
            "COMPLETE_SHADOW_WIKI",
        ]
    );
}

#[tokio::test]
async fn failing_step_marks_task_failed_with_error() {
    use common::test_task;
    use shadow_core::config::Config;
    use shadow_core::db::Db;
    use shadow_core::events::EventBus;
    use shadow_core::init::InitEngine;
    use shadow_core::services::BackgroundServiceManager;
    use shadow_core::watcher::WatcherRegistry;
    use shadow_core::workspace::WorkspaceManager;
    use std::sync::Arc;

    let tmp = tempfile::tempdir().unwrap();
    let config = Arc::new(Config::for_local(
        tmp.path().join("workspaces").to_string_lossy().to_string(),
    ));
    std::fs::create_dir_all(tmp.path().join("workspaces")).unwrap();
    let db = Arc::new(Db::open_in_memory().unwrap());
    // Repo URL points nowhere: the clone in PREPARE_WORKSPACE fails.
    db.insert_task(&test_task(
        "bad",
        &tmp.path().join("missing-origin").to_string_lossy(),
    ))
    .unwrap();

    let bus = EventBus::new();
    let _watchers = WatcherRegistry::new();
    let llm = common::FakeLlm::new(vec![]);
    let workspaces = Arc::new(WorkspaceManager::new(
        Arc::clone(&config),
        Arc::clone(&db),
        None,
    ));
    let services =
        BackgroundServiceManager::new(Arc::clone(&config), Arc::clone(&db), llm);
    let init = InitEngine::new(config, Arc::clone(&db), workspaces, services, Arc::clone(&bus));

    assert!(init.initialize("bad").await.is_err());

    let task = db.get_task("bad").unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.init_status, InitStatus::PrepareWorkspace);
    assert!(task.initialization_error.contains("PREPARE_WORKSPACE"));

    let chunks = bus.replay_from("bad", 0).await;
    assert!(chunks.iter().any(|c| matches!(
        c,
        StreamChunk::InitProgress { phase, .. } if phase == "error"
    )));
}
