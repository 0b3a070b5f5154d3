use serde::Deserialize;
use serde_json::{Value, json};

pub mod request;
pub mod response;
pub mod stream;

/// Anthropic `/v1/messages` request envelope. Content-bearing fields keep
/// their polymorphic wire shape and are normalized by the helpers below.
#[derive(Debug, Clone, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub max_tokens: u64,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub system: Option<Value>,
    #[serde(default)]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(default)]
    pub thinking: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: ContentValue,
}

/// `content` on the wire is either a plain string or a sequence of typed
/// blocks; anything else is carried through untouched.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ContentValue {
    Text(String),
    Blocks(Vec<Value>),
    Other(Value),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
}

/// Flatten the `system` field: strings verbatim, block sequences joined over
/// the `text` of their `text` blocks.
pub fn system_text(system: Option<&Value>) -> String {
    match system {
        None => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter(|b| b.get("type").and_then(|v| v.as_str()) == Some("text"))
            .filter_map(|b| b.get("text").and_then(|v| v.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(_) => String::new(),
    }
}

/// Flatten a `tool_result.content` value to the plain string OpenAI's tool
/// message carries.
pub fn flatten_tool_result(content: Option<&Value>) -> String {
    match content {
        None => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter(|b| b.get("type").and_then(|v| v.as_str()) == Some("text"))
            .filter_map(|b| b.get("text").and_then(|v| v.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
    }
}

/// Map an OpenAI finish reason onto the Anthropic stop reason vocabulary.
pub fn map_finish_reason(reason: &str) -> &'static str {
    match reason {
        "length" => "max_tokens",
        "tool_calls" | "function_call" => "tool_use",
        _ => "end_turn",
    }
}

/// Extract thinking text from one `reasoning_details` element. Encrypted
/// reasoning is opaque ciphertext and is dropped, never surfaced as text.
pub fn reasoning_detail_text(detail: &Value) -> Option<String> {
    let text = match detail.get("type").and_then(|v| v.as_str())? {
        "reasoning.text" => detail.get("text").and_then(|v| v.as_str())?,
        "reasoning.summary" => detail.get("summary").and_then(|v| v.as_str())?,
        _ => return None,
    };
    if text.is_empty() {
        return None;
    }
    Some(text.to_string())
}

/// The full six-field usage object every Anthropic response carries, with
/// zeros where the upstream reported nothing.
pub fn usage_value(input_tokens: u64, output_tokens: u64, cache_read_input_tokens: u64) -> Value {
    json!({
        "input_tokens": input_tokens,
        "output_tokens": output_tokens,
        "cache_creation_input_tokens": 0,
        "cache_read_input_tokens": cache_read_input_tokens,
        "cache_creation": {
            "ephemeral_5m_input_tokens": 0,
            "ephemeral_1h_input_tokens": 0,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_text_handles_both_shapes() {
        assert_eq!(system_text(None), "");
        assert_eq!(
            system_text(Some(&json!("You are a helpful assistant."))),
            "You are a helpful assistant."
        );
        let blocks = json!([
            {"type": "text", "text": "first"},
            {"type": "image", "source": {}},
            {"type": "text", "text": "second"},
        ]);
        assert_eq!(system_text(Some(&blocks)), "first\nsecond");
        assert_eq!(system_text(Some(&json!([]))), "");
    }

    #[test]
    fn tool_result_flattening() {
        assert_eq!(flatten_tool_result(Some(&json!("42"))), "42");
        let blocks = json!([
            {"type": "text", "text": "line one"},
            {"type": "text", "text": "line two"},
        ]);
        assert_eq!(flatten_tool_result(Some(&blocks)), "line one\nline two");
    }

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(map_finish_reason("stop"), "end_turn");
        assert_eq!(map_finish_reason("length"), "max_tokens");
        assert_eq!(map_finish_reason("tool_calls"), "tool_use");
        assert_eq!(map_finish_reason("function_call"), "tool_use");
        assert_eq!(map_finish_reason("content_filter"), "end_turn");
        assert_eq!(map_finish_reason("weird"), "end_turn");
    }

    #[test]
    fn encrypted_reasoning_dropped() {
        assert_eq!(
            reasoning_detail_text(&json!({"type": "reasoning.text", "text": "hm"})),
            Some("hm".to_string())
        );
        assert_eq!(
            reasoning_detail_text(&json!({"type": "reasoning.summary", "summary": "s"})),
            Some("s".to_string())
        );
        assert_eq!(
            reasoning_detail_text(&json!({"type": "reasoning.encrypted", "data": "AAAA"})),
            None
        );
        assert_eq!(
            reasoning_detail_text(&json!({"type": "reasoning.text", "text": ""})),
            None
        );
    }

    #[test]
    fn usage_carries_all_six_fields() {
        let usage = usage_value(3, 1, 0);
        let obj = usage.as_object().expect("object");
        assert_eq!(obj.len(), 5);
        assert_eq!(usage["input_tokens"], 3);
        assert_eq!(usage["output_tokens"], 1);
        assert_eq!(usage["cache_creation_input_tokens"], 0);
        assert_eq!(usage["cache_read_input_tokens"], 0);
        assert_eq!(usage["cache_creation"]["ephemeral_5m_input_tokens"], 0);
        assert_eq!(usage["cache_creation"]["ephemeral_1h_input_tokens"], 0);
    }
}
