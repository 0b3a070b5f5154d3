use crate::capabilities::CapabilityCache;
use crate::config::Config;
use crate::error::{AppError, AppResult};
use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub http: reqwest::Client,
    pub capabilities: CapabilityCache,
}

pub fn load_state(config: Config) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent(concat!("ccproxy/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|err| {
            AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "api_error",
                format!("http client init failed: {err}"),
            )
        })?;
    Ok(AppState {
        config: Arc::new(config),
        http,
        capabilities: CapabilityCache::new(),
    })
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(crate::handlers::index))
        .route("/health", get(crate::handlers::health))
        .route("/v1/messages", post(crate::handlers::create_messages))
        .route(
            "/v1/messages/count_tokens",
            post(crate::handlers::count_tokens),
        )
        .with_state(state)
        .layer(SetRequestIdLayer::new(
            axum::http::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}
