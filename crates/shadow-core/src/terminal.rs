use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::events::EventBus;
use crate::executor::Executor;
use crate::llm::StreamChunk;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Per-task pollers that surface workspace terminal activity as
/// `terminal-output` chunks on the event bus.
pub struct TerminalPoller {
    bus: Arc<EventBus>,
    tasks: Mutex<HashMap<String, CancellationToken>>,
}

impl TerminalPoller {
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            tasks: Mutex::new(HashMap::new()),
        })
    }

    /// Start polling a task's terminal. A second start for the same task is
    /// a no-op while the first poller is alive.
    pub async fn start(&self, task_id: &str, executor: Arc<dyn Executor>) {
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(task_id) {
            return;
        }
        let cancel = CancellationToken::new();
        tasks.insert(task_id.to_string(), cancel.clone());
        drop(tasks);

        let bus = Arc::clone(&self.bus);
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            let mut since_id = 0u64;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(task_id = %task_id, "terminal poller stopped");
                        return;
                    }
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }
                let Ok(entries) = executor.terminal_history(since_id).await else {
                    continue;
                };
                for entry in entries {
                    since_id = since_id.max(entry.id);
                    bus.publish(&task_id, StreamChunk::TerminalOutput { entry })
                        .await;
                }
            }
        });
    }

    pub async fn stop(&self, task_id: &str) {
        let mut tasks = self.tasks.lock().await;
        if let Some(cancel) = tasks.remove(task_id) {
            cancel.cancel();
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
