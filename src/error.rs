use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

/// Request-scoped error, rendered as the OpenAI error body for both dialects:
/// `{"error":{"message","type","code","param":null}}`.
#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub kind: String,
    pub message: String,
}

impl AppError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "invalid_request_error".to_string(),
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            kind: "invalid_api_key".to_string(),
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            kind: "rate_limit_exceeded".to_string(),
            message: message.into(),
        }
    }

    pub fn upstream_unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            kind: "upstream_error".to_string(),
            message: message.into(),
        }
    }

    pub fn upstream_timeout(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::GATEWAY_TIMEOUT,
            kind: "upstream_timeout".to_string(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "internal_error".to_string(),
            message: message.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.status == StatusCode::GATEWAY_TIMEOUT
    }

    pub fn body(&self) -> serde_json::Value {
        json!({
            "error": {
                "message": self.message,
                "type": self.kind,
                "code": self.kind,
                "param": null,
            }
        })
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = self.body();
        (self.status, Json(body)).into_response()
    }
}

/// Map a failed upstream HTTP status onto the proxy error taxonomy.
pub fn map_upstream_status(status: reqwest::StatusCode, body: &str) -> AppError {
    let message = if body.is_empty() {
        format!("upstream error: {}", status)
    } else {
        format!("upstream error: {}", body)
    };
    match status.as_u16() {
        408 | 504 => AppError::upstream_timeout(message),
        429 => AppError {
            status: StatusCode::BAD_GATEWAY,
            kind: "rate_limit_exceeded".to_string(),
            message,
        },
        _ => AppError::upstream_unavailable(message),
    }
}

/// Map a reqwest transport failure; timeouts keep their own kind so the
/// non-stream retry path can tell them apart.
pub fn map_transport_error(err: &reqwest::Error) -> AppError {
    if err.is_timeout() {
        AppError::upstream_timeout(format!("upstream request timed out: {}", err))
    } else if err.is_connect() {
        AppError::upstream_unavailable(format!("upstream connection failed: {}", err))
    } else {
        AppError::upstream_unavailable(format!("upstream request failed: {}", err))
    }
}
