use crate::transcode::{map_finish_reason, reasoning_detail_text, usage_value};
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde_json::{Value, json};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Fixed block layout of a translated message: thinking at 0, assistant text
/// at 1, tool-use blocks allocated upward from 2.
const THINKING_BLOCK_INDEX: u32 = 0;
const TEXT_BLOCK_INDEX: u32 = 1;
const FIRST_TOOL_BLOCK_INDEX: u32 = 2;

/// One downstream SSE event, named and carrying its JSON payload.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    pub name: &'static str,
    pub data: Value,
}

impl MessageEvent {
    fn new(name: &'static str, data: Value) -> Self {
        Self { name, data }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
}

#[derive(Debug, Default)]
struct ToolCallState {
    id: String,
    name: String,
    args_buffer: String,
    json_sent: bool,
    claude_index: Option<u32>,
}

/// Per-request state machine translating OpenAI chat-completions chunks into
/// Anthropic stream events.
///
/// The machine itself is synchronous and IO-free: callers feed parsed chunk
/// objects and forward the returned events in order. `pump_openai_stream`
/// below drives it from a live upstream response.
pub struct MessageStream {
    message_id: String,
    model: String,
    thinking_started: bool,
    thinking_has_content: bool,
    text_started: bool,
    tool_calls: HashMap<u64, ToolCallState>,
    next_tool_index: u32,
    final_stop_reason: &'static str,
    usage: UsageTotals,
}

impl MessageStream {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            message_id: format!("msg_{}", uuid::Uuid::new_v4()),
            model: model.into(),
            thinking_started: false,
            thinking_has_content: false,
            text_started: false,
            tool_calls: HashMap::new(),
            next_tool_index: FIRST_TOOL_BLOCK_INDEX,
            final_stop_reason: "end_turn",
            usage: UsageTotals::default(),
        }
    }

    pub fn usage(&self) -> UsageTotals {
        self.usage
    }

    pub fn stop_reason(&self) -> &'static str {
        self.final_stop_reason
    }

    /// Events emitted once, before any upstream chunk is consumed.
    pub fn open(&self) -> Vec<MessageEvent> {
        vec![
            MessageEvent::new(
                "message_start",
                json!({
                    "type": "message_start",
                    "message": {
                        "id": self.message_id,
                        "type": "message",
                        "role": "assistant",
                        "model": self.model,
                        "content": [],
                        "stop_reason": Value::Null,
                        "stop_sequence": Value::Null,
                        "usage": usage_value(0, 0, 0),
                    }
                }),
            ),
            MessageEvent::new("ping", json!({"type": "ping"})),
        ]
    }

    /// Translate one parsed upstream chunk. Usage-only chunks (no `choices`)
    /// are absorbed; chunks after `finish_reason` are still processed because
    /// usage legitimately arrives last.
    pub fn on_chunk(&mut self, chunk: &Value) -> Vec<MessageEvent> {
        let mut events = Vec::new();

        if let Some(usage) = chunk.get("usage").and_then(|v| v.as_object()) {
            if let Some(prompt) = usage.get("prompt_tokens").and_then(|v| v.as_u64()) {
                self.usage.input_tokens = prompt;
            }
            if let Some(completion) = usage.get("completion_tokens").and_then(|v| v.as_u64()) {
                self.usage.output_tokens = completion;
            }
            if let Some(cached) = usage
                .get("prompt_tokens_details")
                .and_then(|d| d.get("cached_tokens"))
                .and_then(|v| v.as_u64())
            {
                if cached > 0 {
                    self.usage.cache_read_input_tokens = cached;
                }
            }
        }

        let Some(choice) = chunk
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
        else {
            return events;
        };

        if let Some(delta) = choice.get("delta") {
            if let Some(text) = delta.get("reasoning_content").and_then(|v| v.as_str()) {
                if !text.is_empty() {
                    self.thinking_fragment(text, &mut events);
                }
            }

            // reasoning_details is skipped when the plain `reasoning` field is
            // present in the same chunk, which would double-count the text.
            if delta.get("reasoning").is_none() {
                if let Some(details) = delta.get("reasoning_details").and_then(|v| v.as_array()) {
                    for detail in details {
                        if let Some(text) = reasoning_detail_text(detail) {
                            self.thinking_fragment(&text, &mut events);
                        }
                    }
                }
            }

            if let Some(text) = delta.get("reasoning").and_then(|v| v.as_str()) {
                if !text.is_empty() {
                    self.thinking_fragment(text, &mut events);
                }
            }

            if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
                if !text.is_empty() {
                    if !self.text_started {
                        self.text_started = true;
                        events.push(MessageEvent::new(
                            "content_block_start",
                            json!({
                                "type": "content_block_start",
                                "index": TEXT_BLOCK_INDEX,
                                "content_block": {"type": "text", "text": ""},
                            }),
                        ));
                    }
                    events.push(MessageEvent::new(
                        "content_block_delta",
                        json!({
                            "type": "content_block_delta",
                            "index": TEXT_BLOCK_INDEX,
                            "delta": {"type": "text_delta", "text": text},
                        }),
                    ));
                }
            }

            if let Some(calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                for call in calls {
                    self.tool_call_delta(call, &mut events);
                }
            }
        }

        if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
            if !reason.is_empty() {
                self.final_stop_reason = map_finish_reason(reason);
            }
        }

        events
    }

    /// Events closing the message after the upstream stream ends: block stops
    /// for text, tools in allocation order, then thinking, followed by
    /// `message_delta` carrying the stop reason and final usage.
    pub fn finish(&self) -> Vec<MessageEvent> {
        let mut events = Vec::new();

        if self.text_started {
            events.push(block_stop(TEXT_BLOCK_INDEX));
        }
        let mut tool_indices: Vec<u32> = self
            .tool_calls
            .values()
            .filter_map(|t| t.claude_index)
            .collect();
        tool_indices.sort_unstable();
        for index in tool_indices {
            events.push(block_stop(index));
        }
        if self.thinking_has_content {
            events.push(block_stop(THINKING_BLOCK_INDEX));
        }

        events.push(MessageEvent::new(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {
                    "stop_reason": self.final_stop_reason,
                    "stop_sequence": Value::Null,
                },
                "usage": usage_value(
                    self.usage.input_tokens,
                    self.usage.output_tokens,
                    self.usage.cache_read_input_tokens,
                ),
            }),
        ));
        events.push(MessageEvent::new("message_stop", json!({"type": "message_stop"})));
        events
    }

    fn thinking_fragment(&mut self, text: &str, events: &mut Vec<MessageEvent>) {
        if !self.thinking_started {
            self.thinking_started = true;
            self.thinking_has_content = true;
            events.push(MessageEvent::new(
                "content_block_start",
                json!({
                    "type": "content_block_start",
                    "index": THINKING_BLOCK_INDEX,
                    "content_block": {"type": "thinking", "thinking": ""},
                }),
            ));
        }
        // The delta field must be named `thinking`; clients only collapse
        // reasoning rendered through that exact shape.
        events.push(MessageEvent::new(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": THINKING_BLOCK_INDEX,
                "delta": {"type": "thinking_delta", "thinking": text},
            }),
        ));
    }

    fn tool_call_delta(&mut self, call: &Value, events: &mut Vec<MessageEvent>) {
        let upstream_index = call.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
        let state = self.tool_calls.entry(upstream_index).or_default();

        if let Some(id) = call.get("id").and_then(|v| v.as_str()) {
            if !id.is_empty() {
                state.id = id.to_string();
            }
        }
        if let Some(name) = call
            .get("function")
            .and_then(|f| f.get("name"))
            .and_then(|v| v.as_str())
        {
            if !name.is_empty() {
                state.name = name.to_string();
            }
        }

        // A block opens only once both id and name are known.
        if state.claude_index.is_none() && !state.id.is_empty() && !state.name.is_empty() {
            let index = self.next_tool_index;
            self.next_tool_index += 1;
            state.claude_index = Some(index);
            events.push(MessageEvent::new(
                "content_block_start",
                json!({
                    "type": "content_block_start",
                    "index": index,
                    "content_block": {
                        "type": "tool_use",
                        "id": state.id,
                        "name": state.name,
                        "input": {},
                    },
                }),
            ));
        }

        if let Some(fragment) = call
            .get("function")
            .and_then(|f| f.get("arguments"))
            .and_then(|v| v.as_str())
        {
            state.args_buffer.push_str(fragment);
            if let Some(index) = state.claude_index {
                if !state.json_sent
                    && !state.args_buffer.is_empty()
                    && serde_json::from_str::<Value>(&state.args_buffer).is_ok()
                {
                    state.json_sent = true;
                    events.push(MessageEvent::new(
                        "content_block_delta",
                        json!({
                            "type": "content_block_delta",
                            "index": index,
                            "delta": {
                                "type": "input_json_delta",
                                "partial_json": state.args_buffer,
                            },
                        }),
                    ));
                }
            }
        }
    }
}

fn block_stop(index: u32) -> MessageEvent {
    MessageEvent::new(
        "content_block_stop",
        json!({"type": "content_block_stop", "index": index}),
    )
}

/// Outcome of a pumped stream, for the per-request summary log.
#[derive(Debug, Clone, Copy)]
pub struct StreamSummary {
    pub usage: UsageTotals,
    pub stop_reason: &'static str,
}

/// Drive a live upstream SSE body through the state machine, forwarding
/// events to the downstream channel.
///
/// A failed send means the client went away: the upstream response is dropped
/// (closing the connection) and no further events are produced. Upstream
/// read errors end the message cleanly and are followed by an `error` event.
pub async fn pump_openai_stream(
    upstream: reqwest::Response,
    model: String,
    tx: mpsc::Sender<axum::response::sse::Event>,
) -> StreamSummary {
    let mut machine = MessageStream::new(model);
    if forward(&tx, machine.open()).await.is_err() {
        return summary(&machine);
    }

    let mut read_error: Option<String> = None;
    let mut chunks = upstream.bytes_stream().eventsource();
    while let Some(event) = chunks.next().await {
        let event = match event {
            Ok(event) => event,
            Err(err) => {
                read_error = Some(err.to_string());
                break;
            }
        };
        if event.data.trim() == "[DONE]" {
            break;
        }
        let Ok(chunk) = serde_json::from_str::<Value>(&event.data) else {
            continue;
        };
        if forward(&tx, machine.on_chunk(&chunk)).await.is_err() {
            return summary(&machine);
        }
    }

    if forward(&tx, machine.finish()).await.is_err() {
        return summary(&machine);
    }
    if let Some(message) = read_error {
        tracing::warn!("upstream stream read failed: {message}");
        let error = crate::error::AppError::api(format!("upstream stream error: {message}"));
        let _ = tx
            .send(
                axum::response::sse::Event::default()
                    .event("error")
                    .data(error.to_envelope().to_string()),
            )
            .await;
    }
    summary(&machine)
}

fn summary(machine: &MessageStream) -> StreamSummary {
    StreamSummary {
        usage: machine.usage(),
        stop_reason: machine.stop_reason(),
    }
}

async fn forward(
    tx: &mpsc::Sender<axum::response::sse::Event>,
    events: Vec<MessageEvent>,
) -> Result<(), ()> {
    for event in events {
        let wire = axum::response::sse::Event::default()
            .event(event.name)
            .data(event.data.to_string());
        if tx.send(wire).await.is_err() {
            return Err(());
        }
    }
    Ok(())
}
