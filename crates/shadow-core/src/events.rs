use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};

use crate::llm::{StreamChunk, StreamState};

const BROADCAST_CAPACITY: usize = 512;
const MAX_BUFFER_CHUNKS: usize = 10_000;

struct TaskChannel {
    tx: broadcast::Sender<StreamChunk>,
    /// Replay buffer for the current stream. Position 0 is the first chunk
    /// published after the last `start_stream`.
    buffer: Vec<StreamChunk>,
    /// Concatenation of `content` chunks since the last `start_stream`.
    content: String,
    is_streaming: bool,
}

impl TaskChannel {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            tx,
            buffer: Vec::new(),
            content: String::new(),
            is_streaming: false,
        }
    }
}

/// Per-task fan-out of typed stream chunks. Delivery is best-effort
/// broadcast; late joiners get a `StreamState` snapshot plus incremental
/// replay from any buffer position.
pub struct EventBus {
    channels: Mutex<HashMap<String, TaskChannel>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            channels: Mutex::new(HashMap::new()),
        })
    }

    /// Begin a new stream for a task, resetting content and replay buffer.
    pub async fn start_stream(&self, task_id: &str) {
        let mut map = self.channels.lock().await;
        let ch = map
            .entry(task_id.to_string())
            .or_insert_with(TaskChannel::new);
        ch.buffer.clear();
        ch.content.clear();
        ch.is_streaming = true;
    }

    pub async fn end_stream(&self, task_id: &str) {
        let mut map = self.channels.lock().await;
        if let Some(ch) = map.get_mut(task_id) {
            ch.is_streaming = false;
        }
    }

    /// Publish a chunk to the task's subscribers and the replay buffer.
    pub async fn publish(&self, task_id: &str, chunk: StreamChunk) {
        let mut map = self.channels.lock().await;
        let ch = map
            .entry(task_id.to_string())
            .or_insert_with(TaskChannel::new);
        if let StreamChunk::Content { content } = &chunk {
            ch.content.push_str(content);
        }
        let _ = ch.tx.send(chunk.clone());
        ch.buffer.push(chunk);
        if ch.buffer.len() > MAX_BUFFER_CHUNKS {
            ch.buffer.remove(0);
        }
    }

    /// Subscribe to a task's stream. The returned snapshot reflects exactly
    /// the prefix of content the receiver will not see incrementally.
    pub async fn subscribe(
        &self,
        task_id: &str,
    ) -> (StreamState, broadcast::Receiver<StreamChunk>) {
        let mut map = self.channels.lock().await;
        let ch = map
            .entry(task_id.to_string())
            .or_insert_with(TaskChannel::new);
        let state = StreamState {
            content: ch.content.clone(),
            is_streaming: ch.is_streaming,
            buffer_position: ch.buffer.len(),
        };
        (state, ch.tx.subscribe())
    }

    /// Replay buffered chunks of the current stream from `from_position`.
    pub async fn replay_from(&self, task_id: &str, from_position: usize) -> Vec<StreamChunk> {
        let map = self.channels.lock().await;
        match map.get(task_id) {
            Some(ch) if from_position < ch.buffer.len() => ch.buffer[from_position..].to_vec(),
            _ => Vec::new(),
        }
    }

    pub async fn is_streaming(&self, task_id: &str) -> bool {
        let map = self.channels.lock().await;
        map.get(task_id).map(|ch| ch.is_streaming).unwrap_or(false)
    }

    /// Drop all in-memory state for a task.
    pub async fn remove_task(&self, task_id: &str) {
        let mut map = self.channels.lock().await;
        map.remove(task_id);
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
