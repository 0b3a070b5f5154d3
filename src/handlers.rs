use crate::app::AppState;
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::router;
use crate::transcode::MessagesRequest;
use crate::transcode::request::build_chat_request;
use crate::transcode::response::convert_response;
use crate::transcode::stream::pump_openai_stream;
use crate::upstream;
use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use futures_util::StreamExt;
use serde_json::{Value, json};
use std::time::Instant;
use tokio::sync::mpsc;

/// `POST /v1/messages`: translate, forward, translate back. The `stream`
/// field of the body decides between a JSON reply and an SSE stream.
pub async fn create_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    let req: MessagesRequest = serde_json::from_slice(&body)
        .map_err(|err| AppError::invalid_request(format!("Invalid request body: {err}")))?;

    if let Some(expected) = &state.config.client_auth_key {
        let provided = headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != expected {
            return Err(AppError::authentication("Invalid API key"));
        }
    }

    if state.config.passthrough {
        return Err(AppError::new(
            StatusCode::NOT_IMPLEMENTED,
            "api_error",
            "passthrough mode is not implemented",
        ));
    }

    let started = Instant::now();
    let prepared = build_chat_request(&req, &state.config, &state.capabilities).await;
    if state.config.debug {
        tracing::debug!(model = %prepared.upstream_model, body = %prepared.body, "upstream request");
    }

    if prepared.stream {
        let upstream_model = prepared.upstream_model.clone();
        let (tx, rx) = mpsc::channel::<Event>(64);
        let task_state = state.clone();
        tokio::spawn(async move {
            match upstream::open_chat_stream(
                &task_state.http,
                &task_state.config,
                &task_state.capabilities,
                prepared,
            )
            .await
            {
                Ok(response) => {
                    let summary =
                        pump_openai_stream(response, upstream_model.clone(), tx).await;
                    if task_state.config.simple_log {
                        log_request_summary(
                            &task_state.config,
                            &upstream_model,
                            summary.usage.input_tokens,
                            summary.usage.output_tokens,
                            started,
                        );
                    }
                }
                Err(err) => {
                    tracing::warn!("upstream stream open failed: {err}");
                    let _ = tx
                        .send(
                            Event::default()
                                .event("error")
                                .data(err.into_app_error().to_envelope().to_string()),
                        )
                        .await;
                }
            }
        });

        let stream = tokio_stream::wrappers::ReceiverStream::new(rx)
            .map(Ok::<_, std::convert::Infallible>);
        let mut response = Sse::new(stream).into_response();
        let response_headers = response.headers_mut();
        response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        response_headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        response_headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
        return Ok(response);
    }

    let upstream_model = prepared.upstream_model.clone();
    let value = upstream::call_chat_completions(
        &state.http,
        &state.config,
        &state.capabilities,
        prepared,
    )
    .await
    .map_err(|err| err.into_app_error())?;
    if state.config.debug {
        tracing::debug!(body = %value, "upstream response");
    }
    let converted = convert_response(&value, &req.model)?;
    if state.config.simple_log {
        let input = converted["usage"]["input_tokens"].as_u64().unwrap_or(0);
        let output = converted["usage"]["output_tokens"].as_u64().unwrap_or(0);
        log_request_summary(&state.config, &upstream_model, input, output, started);
    }
    Ok(Json(converted).into_response())
}

/// `POST /v1/messages/count_tokens`: static stub, the client only needs a
/// plausible number.
pub async fn count_tokens() -> Json<Value> {
    Json(json!({"input_tokens": 100}))
}

pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn index(State(state): State<AppState>) -> Json<Value> {
    let config = &state.config;
    Json(json!({
        "message": "ccproxy",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "config": {
            "openai_base_url": config.upstream_base_url,
            "provider_class": config.provider_class(),
            "passthrough": config.passthrough,
            "opus_model": describe_mapping(&config.opus_override, router::DEFAULT_OPUS_MODEL),
            "sonnet_model": describe_mapping(&config.sonnet_override, router::DEFAULT_SONNET_MODEL),
            "haiku_model": describe_mapping(&config.haiku_override, router::DEFAULT_HAIKU_MODEL),
        },
        "endpoints": {
            "health": "/health",
            "messages": "/v1/messages",
            "count_tokens": "/v1/messages/count_tokens",
        },
    }))
}

fn describe_mapping(override_value: &Option<String>, default: &str) -> String {
    match override_value {
        Some(model) => format!("{model} (env override)"),
        None => format!("{default} (default)"),
    }
}

fn log_request_summary(
    config: &Config,
    upstream_model: &str,
    input_tokens: u64,
    output_tokens: u64,
    started: Instant,
) {
    let elapsed = started.elapsed().as_secs_f64();
    let tokens_per_sec = if elapsed > 0.0 && output_tokens > 0 {
        output_tokens as f64 / elapsed
    } else {
        0.0
    };
    tracing::info!(
        "[REQ] {} model={} in={} out={} tok/s={:.1}",
        config.upstream_base_url,
        upstream_model,
        input_tokens,
        output_tokens,
        tokens_per_sec
    );
}
