use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use shadow_core::llm::{LlmClient, StreamChunk, StreamRequest};

use crate::sse::SseParser;
use crate::toolspec::tool_specs;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u64 = 8_192;
const COMPLETE_MAX_TOKENS: u64 = 1_024;
/// Upper bound on tool-use round trips within one user turn.
const MAX_AGENT_TURNS: usize = 50;
const CHANNEL_CAPACITY: usize = 256;

/// Anthropic Messages API backend: streams text deltas, accumulates
/// tool-use blocks, dispatches them through the request's tool router and
/// keeps looping until the model stops calling tools.
#[derive(Clone)]
pub struct AnthropicClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
        }
    }

    /// Point the client at a different endpoint (tests, proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn resolve_key(&self, user_api_keys: &HashMap<String, String>) -> String {
        user_api_keys
            .get("anthropic")
            .filter(|k| !k.is_empty())
            .cloned()
            .unwrap_or_else(|| self.api_key.clone())
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn create_message_stream(
        &self,
        request: StreamRequest,
    ) -> Result<mpsc::Receiver<StreamChunk>> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let client = self.clone();
        tokio::spawn(async move {
            run_stream(client, request, tx).await;
        });
        Ok(rx)
    }

    async fn complete(
        &self,
        prompt: &str,
        model: &str,
        user_api_keys: &HashMap<String, String>,
    ) -> Result<String> {
        let body = json!({
            "model": model,
            "max_tokens": COMPLETE_MAX_TOKENS,
            "messages": [{"role": "user", "content": prompt}],
        });
        let resp: Value = self
            .http
            .post(self.messages_url())
            .header("content-type", "application/json")
            .header("x-api-key", self.resolve_key(user_api_keys))
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .context("completion request")?
            .error_for_status()
            .context("completion status")?
            .json()
            .await
            .context("completion body")?;
        Ok(resp["content"][0]["text"].as_str().unwrap_or("").to_string())
    }
}

// ── Streaming loop ────────────────────────────────────────────────────────

struct ToolCallOut {
    id: String,
    name: String,
    args: Value,
}

#[derive(Default)]
struct TurnOutput {
    text: String,
    tool_calls: Vec<ToolCallOut>,
    stop_reason: Option<String>,
    input_tokens: u64,
    output_tokens: u64,
}

async fn run_stream(client: AnthropicClient, req: StreamRequest, tx: mpsc::Sender<StreamChunk>) {
    let api_key = client.resolve_key(&req.user_api_keys);
    let tools = (req.enable_tools && req.tools.is_some()).then(tool_specs);
    let mut transcript: Vec<Value> = req
        .messages
        .iter()
        .map(|m| json!({"role": m.role, "content": m.content}))
        .collect();
    let mut total_input = 0u64;
    let mut total_output = 0u64;

    for turn in 0..MAX_AGENT_TURNS {
        let mut body = json!({
            "model": req.model,
            "max_tokens": MAX_TOKENS,
            "messages": transcript,
            "stream": true,
        });
        if !req.system_prompt.is_empty() {
            body["system"] = json!(req.system_prompt);
        }
        if let Some(tools) = &tools {
            body["tools"] = json!(tools);
        }

        debug!(task_id = %req.task_id, turn, "starting model turn");
        let resp = match client
            .http
            .post(client.messages_url())
            .header("content-type", "application/json")
            .header("x-api-key", &api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                send_error(&tx, format!("provider request failed: {e}")).await;
                return;
            }
        };

        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            send_error(&tx, format!("provider auth failed ({status})")).await;
            return;
        }
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            send_error(&tx, format!("provider returned {status}: {detail}")).await;
            return;
        }

        let output = match read_turn(resp, &req, &tx).await {
            Ok(Some(output)) => output,
            // Cancelled or the receiver went away: wind down quietly.
            Ok(None) => return,
            Err(e) => {
                send_error(&tx, format!("stream read failed: {e}")).await;
                return;
            }
        };
        total_input += output.input_tokens;
        total_output += output.output_tokens;

        let mut content_blocks = Vec::new();
        if !output.text.is_empty() {
            content_blocks.push(json!({"type": "text", "text": output.text}));
        }
        for call in &output.tool_calls {
            content_blocks.push(json!({
                "type": "tool_use",
                "id": call.id,
                "name": call.name,
                "input": call.args,
            }));
        }
        if !content_blocks.is_empty() {
            transcript.push(json!({"role": "assistant", "content": content_blocks}));
        }

        if output.stop_reason.as_deref() == Some("tool_use") && !output.tool_calls.is_empty() {
            let Some(router) = &req.tools else {
                send_error(&tx, "model requested a tool but tools are disabled".into()).await;
                return;
            };
            let mut results = Vec::new();
            for call in &output.tool_calls {
                if req.cancel.is_cancelled() {
                    return;
                }
                let result = router.dispatch(&call.name, &call.args).await;
                if tx
                    .send(StreamChunk::ToolResult {
                        id: call.id.clone(),
                        result: result.clone(),
                    })
                    .await
                    .is_err()
                {
                    return;
                }
                results.push(json!({
                    "type": "tool_result",
                    "tool_use_id": call.id,
                    "content": result.to_string(),
                }));
            }
            transcript.push(json!({"role": "user", "content": results}));
            continue;
        }

        let _ = tx
            .send(StreamChunk::Usage {
                prompt_tokens: total_input,
                completion_tokens: total_output,
                total_tokens: total_input + total_output,
            })
            .await;
        let _ = tx
            .send(StreamChunk::Complete {
                finish_reason: map_stop_reason(output.stop_reason.as_deref()),
            })
            .await;
        return;
    }

    warn!(task_id = %req.task_id, "agent exceeded {MAX_AGENT_TURNS} turns");
    send_error(&tx, "agent exceeded the maximum number of tool turns".into()).await;
}

/// Read one streamed model message. Returns None when cancelled or when the
/// chunk receiver has gone away.
async fn read_turn(
    mut resp: reqwest::Response,
    req: &StreamRequest,
    tx: &mpsc::Sender<StreamChunk>,
) -> Result<Option<TurnOutput>> {
    let mut parser = SseParser::new();
    let mut output = TurnOutput::default();
    // index → (id, name, accumulated input json) for open tool_use blocks.
    let mut open_blocks: HashMap<u64, (String, String, String)> = HashMap::new();

    loop {
        let chunk = tokio::select! {
            _ = req.cancel.cancelled() => return Ok(None),
            chunk = resp.chunk() => chunk.context("read provider stream")?,
        };
        let Some(bytes) = chunk else {
            // Stream ended without message_stop; use what we have.
            return Ok(Some(output));
        };

        for event in parser.feed(&String::from_utf8_lossy(&bytes)) {
            let Ok(v) = serde_json::from_str::<Value>(&event.data) else {
                continue;
            };
            let index = v["index"].as_u64().unwrap_or(0);
            match v["type"].as_str().unwrap_or("") {
                "message_start" => {
                    output.input_tokens +=
                        v["message"]["usage"]["input_tokens"].as_u64().unwrap_or(0);
                }
                "content_block_start" => {
                    if v["content_block"]["type"] == "tool_use" {
                        open_blocks.insert(
                            index,
                            (
                                v["content_block"]["id"].as_str().unwrap_or("").to_string(),
                                v["content_block"]["name"].as_str().unwrap_or("").to_string(),
                                String::new(),
                            ),
                        );
                    }
                }
                "content_block_delta" => match v["delta"]["type"].as_str() {
                    Some("text_delta") => {
                        let text = v["delta"]["text"].as_str().unwrap_or("");
                        output.text.push_str(text);
                        if tx
                            .send(StreamChunk::Content {
                                content: text.to_string(),
                            })
                            .await
                            .is_err()
                        {
                            return Ok(None);
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(block) = open_blocks.get_mut(&index) {
                            block
                                .2
                                .push_str(v["delta"]["partial_json"].as_str().unwrap_or(""));
                        }
                    }
                    _ => {}
                },
                "content_block_stop" => {
                    if let Some((id, name, args_json)) = open_blocks.remove(&index) {
                        let args: Value = if args_json.trim().is_empty() {
                            json!({})
                        } else {
                            serde_json::from_str(&args_json).unwrap_or(json!({}))
                        };
                        if tx
                            .send(StreamChunk::ToolCall {
                                id: id.clone(),
                                name: name.clone(),
                                args: args.clone(),
                            })
                            .await
                            .is_err()
                        {
                            return Ok(None);
                        }
                        output.tool_calls.push(ToolCallOut { id, name, args });
                    }
                }
                "message_delta" => {
                    output.output_tokens += v["usage"]["output_tokens"].as_u64().unwrap_or(0);
                    if let Some(reason) = v["delta"]["stop_reason"].as_str() {
                        output.stop_reason = Some(reason.to_string());
                    }
                }
                "message_stop" => return Ok(Some(output)),
                "error" => {
                    return Err(anyhow!(
                        "provider error event: {}",
                        v["error"]["message"].as_str().unwrap_or("unknown")
                    ));
                }
                _ => {}
            }
        }
    }
}

async fn send_error(tx: &mpsc::Sender<StreamChunk>, error: String) {
    warn!("llm stream error: {error}");
    let _ = tx
        .send(StreamChunk::Error {
            error,
            finish_reason: "error".to_string(),
        })
        .await;
}

fn map_stop_reason(reason: Option<&str>) -> String {
    match reason {
        Some("end_turn") | Some("stop_sequence") | None => "stop".to_string(),
        Some("max_tokens") => "length".to_string(),
        Some(other) => other.to_string(),
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
