use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Authorization header is missing or not a Bearer token")]
    MissingAuth,

    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("Request body is not valid JSON: {0}")]
    MalformedBody(String),

    #[error("API key has expired")]
    KeyExpired,

    #[error("Daily request limit reached: {current}/{limit}")]
    DailyLimitReached { current: u64, limit: u64 },

    #[error("Model '{got}' is not available; expected '{expected}'")]
    InvalidModel { expected: String, got: String },

    #[error("No upstream source is available")]
    NoSourceAvailable,

    #[error("Upstream returned {status}")]
    UpstreamError { status: u16, details: String },

    #[error("Upstream did not respond within the deadline")]
    UpstreamTimeout,

    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Upstream network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl ProxyError {
    /// The stable `error` kind string surfaced to callers.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::MissingAuth => "Missing or invalid Authorization header",
            ProxyError::InvalidApiKey => "Invalid API key",
            ProxyError::MalformedBody(_) => "Invalid request body",
            ProxyError::KeyExpired => "API key has expired",
            ProxyError::DailyLimitReached { .. } => "Daily limit reached",
            ProxyError::InvalidModel { .. } => "Invalid model",
            ProxyError::NoSourceAvailable => "Service Unavailable",
            ProxyError::UpstreamError { .. } => "Upstream API error",
            ProxyError::UpstreamTimeout => "Request timeout",
            ProxyError::Store(_) | ProxyError::Json(_) | ProxyError::Network(_) => {
                "Internal server error"
            }
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::MissingAuth | ProxyError::InvalidApiKey => StatusCode::UNAUTHORIZED,
            ProxyError::KeyExpired => StatusCode::FORBIDDEN,
            ProxyError::DailyLimitReached { .. } => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::InvalidModel { .. } | ProxyError::MalformedBody(_) => {
                StatusCode::BAD_REQUEST
            }
            ProxyError::NoSourceAvailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::UpstreamError { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ProxyError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Store(_) | ProxyError::Json(_) | ProxyError::Network(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Render as the caller-facing error body, tagged with the request's
    /// correlation id.
    pub fn to_response(&self, correlation_id: &str) -> Response {
        let mut body = json!({
            "error": self.kind(),
            "message": self.to_string(),
            "correlationId": correlation_id,
        });

        match self {
            ProxyError::DailyLimitReached { current, limit } => {
                body["current_usage"] = json!(current);
                body["daily_limit"] = json!(limit);
            }
            ProxyError::InvalidModel { .. } => {
                body["type"] = json!("invalid_request_error");
            }
            ProxyError::UpstreamError { details, .. } => {
                body["details"] = json!(details);
            }
            _ => {}
        }

        (self.status(), Json(body)).into_response()
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        self.to_response("")
    }
}
