use crate::error::{AppError, AppResult};
use crate::transcode::{map_finish_reason, reasoning_detail_text, usage_value};
use serde_json::{Value, json};

/// Convert a non-streaming OpenAI chat-completions response into an
/// Anthropic message. The returned `model` echoes the client-facing name,
/// not the upstream's.
pub fn convert_response(openai: &Value, client_model: &str) -> AppResult<Value> {
    let choice = openai
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .ok_or_else(|| AppError::api("no choices in upstream response"))?;
    let message = choice.get("message").cloned().unwrap_or(Value::Null);

    let mut content: Vec<Value> = Vec::new();

    // Thinking blocks come first, in upstream order.
    if let Some(details) = message.get("reasoning_details").and_then(|v| v.as_array()) {
        for detail in details {
            if let Some(thinking) = reasoning_detail_text(detail) {
                content.push(json!({"type": "thinking", "thinking": thinking}));
            }
        }
    }

    if let Some(text) = message.get("content").and_then(|v| v.as_str()) {
        if !text.is_empty() {
            content.push(json!({"type": "text", "text": text}));
        }
    }

    if let Some(tool_calls) = message.get("tool_calls").and_then(|v| v.as_array()) {
        for call in tool_calls {
            let arguments = call
                .get("function")
                .and_then(|f| f.get("arguments"))
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let input = serde_json::from_str::<Value>(arguments)
                .unwrap_or_else(|_| Value::String(arguments.to_string()));
            content.push(json!({
                "type": "tool_use",
                "id": call.get("id").and_then(|v| v.as_str()).unwrap_or(""),
                "name": call
                    .get("function")
                    .and_then(|f| f.get("name"))
                    .and_then(|v| v.as_str())
                    .unwrap_or(""),
                "input": input,
            }));
        }
    }

    let stop_reason = match choice.get("finish_reason").and_then(|v| v.as_str()) {
        Some(reason) if !reason.is_empty() => Value::String(map_finish_reason(reason).to_string()),
        _ => Value::String("end_turn".to_string()),
    };

    let usage = openai.get("usage");
    let input_tokens = usage
        .and_then(|u| u.get("prompt_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let output_tokens = usage
        .and_then(|u| u.get("completion_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let cache_read = usage
        .and_then(|u| u.get("prompt_tokens_details"))
        .and_then(|d| d.get("cached_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    let id = openai
        .get("id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4()));

    Ok(json!({
        "id": id,
        "type": "message",
        "role": "assistant",
        "model": client_model,
        "content": content,
        "stop_reason": stop_reason,
        "stop_sequence": Value::Null,
        "usage": usage_value(input_tokens, output_tokens, cache_read),
    }))
}
