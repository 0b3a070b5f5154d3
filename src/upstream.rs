use crate::capabilities::{CacheKey, CapabilityCache};
use crate::config::{Config, ProviderClass};
use crate::error::AppError;
use crate::transcode::request::{PreparedRequest, swap_token_limit_param};
use axum::http::StatusCode;
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network,
    Http,
}

#[derive(Debug, Clone)]
pub struct UpstreamCallError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub message: String,
}

impl UpstreamCallError {
    fn new(kind: UpstreamErrorKind, status: Option<StatusCode>, message: String) -> Self {
        Self {
            kind,
            status,
            message,
        }
    }

    pub fn into_app_error(self) -> AppError {
        AppError::api(self.message)
    }
}

impl std::fmt::Display for UpstreamCallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Call `{base}/chat/completions` without streaming and decode the JSON
/// reply.
///
/// Error bodies are matched against the token-limit parameter rule whatever
/// the status code: some gateways report parameter errors inside a 200
/// envelope. A request that probed with `max_completion_tokens` is retried
/// once with `max_tokens`, and either probe outcome is recorded in the
/// capability cache.
pub async fn call_chat_completions(
    client: &reqwest::Client,
    config: &Config,
    capabilities: &CapabilityCache,
    mut prepared: PreparedRequest,
) -> Result<Value, UpstreamCallError> {
    let key = CacheKey::new(&config.upstream_base_url, &prepared.upstream_model);
    let (status, text) = send(client, config, &prepared.body, config.request_timeout).await?;

    if let Some(value) = decode_success(status, &text) {
        record_probe_success(capabilities, &key, &prepared).await;
        return Ok(value);
    }

    if prepared.sent_max_completion_tokens && is_token_param_error(&text) {
        tracing::debug!(
            model = %prepared.upstream_model,
            "upstream rejected max_completion_tokens, retrying with max_tokens"
        );
        swap_token_limit_param(&mut prepared.body);
        let (retry_status, retry_text) =
            send(client, config, &prepared.body, config.request_timeout).await?;
        if let Some(value) = decode_success(retry_status, &retry_text) {
            capabilities.put(key, false).await;
            return Ok(value);
        }
        return Err(http_error(retry_status, &retry_text));
    }

    Err(http_error(status, &text))
}

/// Open a streaming call and return the response once it is known to be an
/// event stream.
///
/// A reply that is not an event stream (non-200, or a JSON body on 200) is
/// read and put through the same parameter-retry rule before anything is
/// emitted downstream. Once the stream is handed back, no retry happens.
pub async fn open_chat_stream(
    client: &reqwest::Client,
    config: &Config,
    capabilities: &CapabilityCache,
    mut prepared: PreparedRequest,
) -> Result<reqwest::Response, UpstreamCallError> {
    let key = CacheKey::new(&config.upstream_base_url, &prepared.upstream_model);
    let response = send_raw(client, config, &prepared.body, config.stream_timeout).await?;

    if is_event_stream(&response) {
        record_probe_success(capabilities, &key, &prepared).await;
        return Ok(response);
    }

    let status = response.status();
    let text = read_body(response, status).await?;
    if prepared.sent_max_completion_tokens && is_token_param_error(&text) {
        tracing::debug!(
            model = %prepared.upstream_model,
            "upstream rejected max_completion_tokens on stream open, retrying with max_tokens"
        );
        swap_token_limit_param(&mut prepared.body);
        let retry = send_raw(client, config, &prepared.body, config.stream_timeout).await?;
        if is_event_stream(&retry) {
            capabilities.put(key, false).await;
            return Ok(retry);
        }
        let retry_status = retry.status();
        let retry_text = read_body(retry, retry_status).await?;
        return Err(http_error(retry_status, &retry_text));
    }

    Err(http_error(status, &text))
}

/// The body-content rule for token-limit parameter rejections: one error
/// keyword plus one limit-parameter name, case-insensitive.
fn is_token_param_error(body: &str) -> bool {
    let lower = body.to_lowercase();
    (lower.contains("parameter") || lower.contains("unsupported") || lower.contains("invalid"))
        && (lower.contains("max_tokens") || lower.contains("max_completion_tokens"))
}

/// A reply counts as success only when the status is 200-class and the body
/// decodes to a chat completion rather than an error envelope.
fn decode_success(status: StatusCode, text: &str) -> Option<Value> {
    if !status.is_success() {
        return None;
    }
    let value: Value = serde_json::from_str(text).ok()?;
    if value.get("error").is_some() && value.get("choices").is_none() {
        return None;
    }
    Some(value)
}

/// The first successful probe with `max_completion_tokens` for an unknown
/// key records that the model accepts it.
async fn record_probe_success(
    capabilities: &CapabilityCache,
    key: &CacheKey,
    prepared: &PreparedRequest,
) {
    if prepared.sent_max_completion_tokens && capabilities.get(key).await.is_none() {
        capabilities.put(key.clone(), true).await;
    }
}

fn is_event_stream(response: &reqwest::Response) -> bool {
    if !response.status().is_success() {
        return false;
    }
    let content_type = response
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    !content_type.contains("application/json")
}

async fn send(
    client: &reqwest::Client,
    config: &Config,
    body: &Value,
    timeout: Duration,
) -> Result<(StatusCode, String), UpstreamCallError> {
    let response = send_raw(client, config, body, timeout).await?;
    let status = response.status();
    let text = read_body(response, status).await?;
    Ok((status, text))
}

async fn send_raw(
    client: &reqwest::Client,
    config: &Config,
    body: &Value,
    timeout: Duration,
) -> Result<reqwest::Response, UpstreamCallError> {
    request_builder(client, config, body, timeout)
        .send()
        .await
        .map_err(|err| UpstreamCallError::new(UpstreamErrorKind::Network, None, err.to_string()))
}

fn request_builder(
    client: &reqwest::Client,
    config: &Config,
    body: &Value,
    timeout: Duration,
) -> reqwest::RequestBuilder {
    let url = format!(
        "{}/chat/completions",
        config.upstream_base_url.trim_end_matches('/')
    );
    let mut request = client.post(url).timeout(timeout).json(body);
    if !config.is_localhost() {
        request = request.bearer_auth(&config.api_key);
    }
    if config.provider_class() == ProviderClass::Openrouter {
        if let Some(app_url) = &config.upstream_app_url {
            request = request.header("HTTP-Referer", app_url);
        }
        if let Some(app_name) = &config.upstream_app_name {
            request = request.header("X-Title", app_name);
        }
    }
    request
}

async fn read_body(
    response: reqwest::Response,
    status: StatusCode,
) -> Result<String, UpstreamCallError> {
    response.text().await.map_err(|err| {
        UpstreamCallError::new(UpstreamErrorKind::Network, Some(status), err.to_string())
    })
}

fn http_error(status: StatusCode, text: &str) -> UpstreamCallError {
    UpstreamCallError::new(
        UpstreamErrorKind::Http,
        Some(status),
        format!("upstream status {status}: {text}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn build(config: &Config) -> reqwest::Request {
        request_builder(
            &reqwest::Client::new(),
            config,
            &json!({"model": "m"}),
            Duration::from_secs(5),
        )
        .build()
        .expect("request")
    }

    #[test]
    fn param_error_rule_needs_both_keyword_groups() {
        assert!(is_token_param_error(
            "Unsupported parameter: max_completion_tokens"
        ));
        assert!(is_token_param_error(
            "{\"error\":{\"message\":\"Invalid value for max_tokens\"}}"
        ));
        assert!(!is_token_param_error("max_tokens exceeded your quota"));
        assert!(!is_token_param_error("invalid api key"));
        assert!(!is_token_param_error("internal server error"));
    }

    #[test]
    fn success_decoding_rejects_error_envelopes() {
        let ok = StatusCode::OK;
        assert!(decode_success(ok, "{\"choices\":[]}").is_some());
        assert!(decode_success(ok, "{\"error\":{\"message\":\"boom\"}}").is_none());
        assert!(decode_success(StatusCode::BAD_REQUEST, "{\"choices\":[]}").is_none());
        assert!(decode_success(ok, "not json").is_none());
    }

    #[test]
    fn bearer_header_skipped_for_localhost() {
        let config = Config::new("http://127.0.0.1:11434/v1", None).expect("config");
        let request = build(&config);
        assert!(request.headers().get("authorization").is_none());
        assert_eq!(
            request.url().as_str(),
            "http://127.0.0.1:11434/v1/chat/completions"
        );
    }

    #[test]
    fn openrouter_gets_attribution_headers() {
        let mut config =
            Config::new("https://openrouter.ai/api/v1", Some("sk-or".to_string())).expect("config");
        config.upstream_app_name = Some("ccproxy".to_string());
        config.upstream_app_url = Some("https://example.com".to_string());
        let request = build(&config);
        assert_eq!(
            request.headers().get("authorization").unwrap(),
            "Bearer sk-or"
        );
        assert_eq!(request.headers().get("http-referer").unwrap(), "https://example.com");
        assert_eq!(request.headers().get("x-title").unwrap(), "ccproxy");
    }

    #[test]
    fn base_url_suffix_is_not_second_guessed() {
        let config = Config::new("https://example.com/llm/", Some("sk".to_string())).expect("config");
        let request = build(&config);
        assert_eq!(
            request.url().as_str(),
            "https://example.com/llm/chat/completions"
        );
    }
}
