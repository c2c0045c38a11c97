use axum::http::{header::AUTHORIZATION, HeaderMap};

use crate::config::AuthConfig;
use crate::error::AppError;

/// Which inbound surface is being authenticated; the messages endpoint also
/// accepts `x-api-key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthSurface {
    OpenAi,
    Anthropic,
}

/// Shared bearer-token gate. Disabled entirely when no key is configured.
pub fn check_api_key(
    auth: &AuthConfig,
    headers: &HeaderMap,
    surface: AuthSurface,
) -> Result<(), AppError> {
    if !auth.required() {
        return Ok(());
    }

    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let presented = match surface {
        AuthSurface::OpenAi => bearer,
        AuthSurface::Anthropic => headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .or(bearer),
    };

    match presented {
        None => Err(AppError::unauthorized(
            "Missing API key. Provide it in the Authorization header using the Bearer scheme.",
        )),
        Some(key) if key == auth.api_key => Ok(()),
        Some(_) => Err(AppError::unauthorized("Invalid API key.")),
    }
}
