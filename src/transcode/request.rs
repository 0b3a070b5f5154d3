use crate::capabilities::{CacheKey, CapabilityCache};
use crate::config::{Config, ProviderClass};
use crate::router;
use crate::transcode::{
    ChatMessage, ContentValue, MessagesRequest, ToolDefinition, flatten_tool_result, system_text,
};
use serde_json::{Map, Value, json};

/// An upstream chat-completions request, plus what C7 needs to know to retry
/// and to record capability-probe outcomes.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub body: Value,
    pub upstream_model: String,
    pub sent_max_completion_tokens: bool,
    pub stream: bool,
}

/// Build the upstream request for an Anthropic `/v1/messages` request.
///
/// The token-limit parameter is chosen from the capability cache; unknown
/// `(base_url, model)` keys are probed optimistically with
/// `max_completion_tokens` and corrected by the caller's retry path.
pub async fn build_chat_request(
    req: &MessagesRequest,
    config: &Config,
    capabilities: &CapabilityCache,
) -> PreparedRequest {
    let upstream_model = router::map_model(&req.model, config);
    let stream = req.stream.unwrap_or(false);

    let mut body = json!({
        "model": upstream_model,
        "messages": convert_messages(&req.messages, &system_text(req.system.as_ref())),
    });
    let obj = body.as_object_mut().expect("chat request object");

    if let Some(temperature) = req.temperature {
        obj.insert("temperature".to_string(), Value::from(temperature));
    }
    if let Some(top_p) = req.top_p {
        obj.insert("top_p".to_string(), Value::from(top_p));
    }
    if let Some(stop) = &req.stop_sequences {
        if !stop.is_empty() {
            obj.insert("stop".to_string(), json!(stop));
        }
    }
    if let Some(stream) = req.stream {
        obj.insert("stream".to_string(), Value::Bool(stream));
    }

    let has_tools = req.tools.as_ref().is_some_and(|t| !t.is_empty());
    if let Some(tools) = &req.tools {
        if !tools.is_empty() {
            obj.insert("tools".to_string(), Value::Array(convert_tools(tools)));
        }
    }

    if stream {
        obj.insert("stream_options".to_string(), json!({"include_usage": true}));
        match config.provider_class() {
            ProviderClass::Openrouter => {
                obj.insert("usage".to_string(), json!({"include": true}));
                obj.insert("reasoning".to_string(), json!({"enabled": true}));
            }
            ProviderClass::Openai => {
                obj.insert("reasoning_effort".to_string(), json!("medium"));
            }
            ProviderClass::Ollama => {
                if has_tools {
                    obj.insert("tool_choice".to_string(), json!("required"));
                }
            }
            ProviderClass::Unknown => {}
        }
    }

    let mut sent_max_completion_tokens = false;
    if req.max_tokens > 0 {
        let key = CacheKey::new(&config.upstream_base_url, &upstream_model);
        let use_max_completion = match capabilities.get(&key).await {
            Some(record) => record.uses_max_completion_tokens,
            None => true,
        };
        let field = if use_max_completion {
            "max_completion_tokens"
        } else {
            "max_tokens"
        };
        obj.insert(field.to_string(), Value::from(req.max_tokens));
        sent_max_completion_tokens = use_max_completion;
    }

    PreparedRequest {
        body,
        upstream_model,
        sent_max_completion_tokens,
        stream,
    }
}

/// Rewrite a prepared body to carry `max_tokens` instead of
/// `max_completion_tokens`, for the one-shot parameter retry.
pub fn swap_token_limit_param(body: &mut Value) {
    if let Some(obj) = body.as_object_mut() {
        if let Some(limit) = obj.remove("max_completion_tokens") {
            obj.insert("max_tokens".to_string(), limit);
        }
    }
}

fn convert_messages(messages: &[ChatMessage], system: &str) -> Vec<Value> {
    let mut out = Vec::new();
    if !system.is_empty() {
        out.push(json!({"role": "system", "content": system}));
    }

    for msg in messages {
        match &msg.content {
            ContentValue::Text(text) => {
                out.push(json!({"role": msg.role, "content": text}));
            }
            ContentValue::Blocks(blocks) => convert_block_message(&msg.role, blocks, &mut out),
            ContentValue::Other(raw) => {
                out.push(json!({"role": msg.role, "content": raw}));
            }
        }
    }
    out
}

fn convert_block_message(role: &str, blocks: &[Value], out: &mut Vec<Value>) {
    let mut text_parts: Vec<&str> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();
    let mut has_tool_result = false;

    for block in blocks {
        match block.get("type").and_then(|v| v.as_str()) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                    text_parts.push(text);
                }
            }
            Some("tool_use") => {
                let input = block.get("input").cloned().unwrap_or(Value::Null);
                let arguments =
                    serde_json::to_string(&input).unwrap_or_else(|_| "{}".to_string());
                tool_calls.push(json!({
                    "id": block.get("id").and_then(|v| v.as_str()).unwrap_or(""),
                    "type": "function",
                    "function": {
                        "name": block.get("name").and_then(|v| v.as_str()).unwrap_or(""),
                        "arguments": arguments,
                    }
                }));
            }
            Some("tool_result") => {
                has_tool_result = true;
                out.push(json!({
                    "role": "tool",
                    "content": flatten_tool_result(block.get("content")),
                    "tool_call_id": block
                        .get("tool_use_id")
                        .and_then(|v| v.as_str())
                        .unwrap_or(""),
                }));
            }
            _ => {}
        }
    }

    if !has_tool_result && (!text_parts.is_empty() || !tool_calls.is_empty()) {
        let mut m = Map::new();
        m.insert("role".to_string(), Value::String(role.to_string()));
        m.insert(
            "content".to_string(),
            Value::String(text_parts.join("\n")),
        );
        if !tool_calls.is_empty() {
            m.insert("tool_calls".to_string(), Value::Array(tool_calls));
        }
        out.push(Value::Object(m));
    }
}

fn convert_tools(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.input_schema,
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: Value) -> MessagesRequest {
        serde_json::from_value(raw).expect("request")
    }

    fn test_config(base_url: &str) -> Config {
        Config::new(base_url, Some("sk-test".to_string())).expect("config")
    }

    #[tokio::test]
    async fn plain_text_request_probes_max_completion_tokens() {
        let req = parse(json!({
            "model": "claude-sonnet-4-20250514",
            "max_tokens": 50,
            "messages": [{"role": "user", "content": "hi"}],
            "stream": false,
        }));
        let config = test_config("https://api.openai.com/v1");
        let prepared = build_chat_request(&req, &config, &CapabilityCache::new()).await;

        assert_eq!(prepared.upstream_model, "gpt-5");
        assert_eq!(prepared.body["model"], "gpt-5");
        assert_eq!(prepared.body["max_completion_tokens"], 50);
        assert!(prepared.body.get("max_tokens").is_none());
        assert!(prepared.sent_max_completion_tokens);
        assert_eq!(
            prepared.body["messages"],
            json!([{"role": "user", "content": "hi"}])
        );
    }

    #[tokio::test]
    async fn cached_legacy_model_gets_max_tokens() {
        let req = parse(json!({
            "model": "gpt-4o",
            "max_tokens": 20,
            "messages": [{"role": "user", "content": "hi"}],
        }));
        let config = test_config("https://api.openai.com/v1");
        let capabilities = CapabilityCache::new();
        capabilities
            .put(
                CacheKey::new(&config.upstream_base_url, "gpt-4o"),
                false,
            )
            .await;

        let prepared = build_chat_request(&req, &config, &capabilities).await;
        assert_eq!(prepared.body["max_tokens"], 20);
        assert!(prepared.body.get("max_completion_tokens").is_none());
        assert!(!prepared.sent_max_completion_tokens);
    }

    #[tokio::test]
    async fn system_blocks_are_joined_and_prepended() {
        let req = parse(json!({
            "model": "claude-sonnet-4",
            "max_tokens": 10,
            "system": [
                {"type": "text", "text": "one"},
                {"type": "text", "text": "two"},
            ],
            "messages": [{"role": "user", "content": "hi"}],
        }));
        let config = test_config("https://api.openai.com/v1");
        let prepared = build_chat_request(&req, &config, &CapabilityCache::new()).await;
        assert_eq!(
            prepared.body["messages"][0],
            json!({"role": "system", "content": "one\ntwo"})
        );
    }

    #[tokio::test]
    async fn empty_system_array_adds_no_message() {
        let req = parse(json!({
            "model": "claude-sonnet-4",
            "max_tokens": 10,
            "system": [],
            "messages": [],
        }));
        let config = test_config("https://api.openai.com/v1");
        let prepared = build_chat_request(&req, &config, &CapabilityCache::new()).await;
        assert_eq!(prepared.body["messages"], json!([]));
    }

    #[tokio::test]
    async fn tool_result_becomes_single_tool_message() {
        let req = parse(json!({
            "model": "claude-sonnet-4",
            "max_tokens": 10,
            "messages": [{
                "role": "user",
                "content": [{"type": "tool_result", "tool_use_id": "c1", "content": "42"}],
            }],
        }));
        let config = test_config("https://api.openai.com/v1");
        let prepared = build_chat_request(&req, &config, &CapabilityCache::new()).await;
        assert_eq!(
            prepared.body["messages"],
            json!([{"role": "tool", "content": "42", "tool_call_id": "c1"}])
        );
    }

    #[tokio::test]
    async fn tool_use_blocks_become_tool_calls_with_string_arguments() {
        let req = parse(json!({
            "model": "claude-sonnet-4",
            "max_tokens": 10,
            "messages": [{
                "role": "assistant",
                "content": [
                    {"type": "text", "text": "running it"},
                    {"type": "tool_use", "id": "c1", "name": "grep", "input": {"q": "x"}},
                ],
            }],
        }));
        let config = test_config("https://api.openai.com/v1");
        let prepared = build_chat_request(&req, &config, &CapabilityCache::new()).await;
        let message = &prepared.body["messages"][0];
        assert_eq!(message["role"], "assistant");
        assert_eq!(message["content"], "running it");
        assert_eq!(message["tool_calls"][0]["id"], "c1");
        assert_eq!(message["tool_calls"][0]["function"]["name"], "grep");
        assert_eq!(
            message["tool_calls"][0]["function"]["arguments"],
            "{\"q\":\"x\"}"
        );
    }

    #[tokio::test]
    async fn streaming_extras_per_provider_class() {
        let raw = json!({
            "model": "claude-sonnet-4",
            "max_tokens": 10,
            "stream": true,
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"name": "grep", "description": "", "input_schema": {"type": "object"}}],
        });

        let openrouter = test_config("https://openrouter.ai/api/v1");
        let prepared =
            build_chat_request(&parse(raw.clone()), &openrouter, &CapabilityCache::new()).await;
        assert_eq!(prepared.body["stream_options"], json!({"include_usage": true}));
        assert_eq!(prepared.body["usage"], json!({"include": true}));
        assert_eq!(prepared.body["reasoning"], json!({"enabled": true}));

        let openai = test_config("https://api.openai.com/v1");
        let prepared =
            build_chat_request(&parse(raw.clone()), &openai, &CapabilityCache::new()).await;
        assert_eq!(prepared.body["reasoning_effort"], "medium");
        assert!(prepared.body.get("usage").is_none());

        let ollama = Config::new("http://localhost:11434/v1", None).expect("config");
        let prepared =
            build_chat_request(&parse(raw), &ollama, &CapabilityCache::new()).await;
        assert_eq!(prepared.body["tool_choice"], "required");
        assert!(prepared.body.get("reasoning_effort").is_none());
    }

    #[tokio::test]
    async fn conversion_is_deterministic() {
        let raw = json!({
            "model": "claude-sonnet-4",
            "max_tokens": 10,
            "stop_sequences": ["END"],
            "temperature": 0.5,
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "c1", "name": "grep", "input": {"q": "x"}},
                ]},
            ],
        });
        let config = test_config("https://api.openai.com/v1");
        let capabilities = CapabilityCache::new();
        let first = build_chat_request(&parse(raw.clone()), &config, &capabilities).await;
        let second = build_chat_request(&parse(raw), &config, &capabilities).await;
        assert_eq!(
            serde_json::to_string(&first.body).unwrap(),
            serde_json::to_string(&second.body).unwrap()
        );
    }

    #[test]
    fn swap_replaces_the_limit_parameter_in_place() {
        let mut body = json!({"model": "gpt-4o", "max_completion_tokens": 10});
        swap_token_limit_param(&mut body);
        assert_eq!(body, json!({"model": "gpt-4o", "max_tokens": 10}));
    }
}
