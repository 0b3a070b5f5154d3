use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Error returned to the downstream client, rendered as the Anthropic
/// error envelope `{"type":"error","error":{"type":...,"message":...}}`.
#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub error_type: String,
    pub message: String,
}

impl AppError {
    pub fn new(
        status: StatusCode,
        error_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status,
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request_error", message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "authentication_error", message)
    }

    pub fn api(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "api_error", message)
    }

    /// The envelope value, also used verbatim as the payload of streaming
    /// `error` events.
    pub fn to_envelope(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "error",
            "error": {
                "type": self.error_type,
                "message": self.message,
            }
        })
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, axum::Json(self.to_envelope())).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
