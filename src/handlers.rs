use axum::{extract::State, http::HeaderMap, response::IntoResponse, Json};
use opentelemetry::KeyValue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

use crate::auth::{check_api_key, AuthSurface};
use crate::error::AppError;
use crate::finalize;
use crate::models::{
    AnthropicRequest, OpenAiModel, OpenAiModelsResponse, OpenAiRequest, UpstreamModelEntry,
};
use crate::state::{AppState, InflightGuard};
use crate::streaming::{collect_events, stream_response};
use crate::transform::{anthropic_to_common, openai_to_common, CommonRequest, Dialect};

const MODELS_CACHE_KEY: &str = "models_list";

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": state.config.observability.service_name,
    }))
}

pub async fn get_models(
    State(state): State<AppState>,
) -> Result<axum::response::Response, AppError> {
    if let Some(cached) = state.models_cache.get(MODELS_CACHE_KEY) {
        return Ok(Json(cached).into_response());
    }

    let upstream = state.upstream.fetch_models().await?;
    let models: Vec<OpenAiModel> = upstream
        .data
        .into_iter()
        .filter(|entry| entry.info.as_ref().map(|i| i.is_active).unwrap_or(true))
        .map(model_from_entry)
        .collect();
    let response = OpenAiModelsResponse {
        object: "list".to_string(),
        data: models,
    };

    state.models_cache.insert_with_ttl(
        MODELS_CACHE_KEY,
        response.clone(),
        std::time::Duration::from_secs(state.config.cache.models_ttl_secs),
    );
    Ok(Json(response).into_response())
}

fn model_from_entry(entry: UpstreamModelEntry) -> OpenAiModel {
    let name = if entry.id.starts_with("GLM") || entry.id.starts_with('Z') {
        entry.id.clone()
    } else {
        match entry.name {
            Some(name) if name.chars().next().map(|c| c.is_ascii_alphabetic()).unwrap_or(false) => {
                name
            }
            _ => format_model_name(&entry.id),
        }
    };
    OpenAiModel {
        created: entry.info.as_ref().and_then(|i| i.created_at).unwrap_or(0),
        id: entry.id,
        object: "model".to_string(),
        name,
        owned_by: "z.ai".to_string(),
    }
}

fn format_model_name(id: &str) -> String {
    id.split('-')
        .enumerate()
        .map(|(i, part)| {
            if i == 0 {
                part.to_uppercase()
            } else if part.chars().all(|c| c.is_ascii_digit()) {
                part.to_string()
            } else {
                let mut chars = part.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect(),
                    None => String::new(),
                }
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

pub async fn post_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<OpenAiRequest>,
) -> Result<axum::response::Response, AppError> {
    check_api_key(&state.config.auth, &headers, AuthSurface::OpenAi)
        .map_err(|e| record_error(&state, e))?;
    let request_id = generate_id("req");
    let start = Instant::now();

    let common = openai_to_common(payload, &state.config).map_err(|e| {
        let err = record_error(&state, e);
        log_failure(&request_id, "unknown", start, &err);
        err
    })?;
    run_request(state, common, Dialect::OpenAi, request_id, start).await
}

pub async fn post_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<AnthropicRequest>,
) -> Result<axum::response::Response, AppError> {
    check_api_key(&state.config.auth, &headers, AuthSurface::Anthropic)
        .map_err(|e| record_error(&state, e))?;
    let request_id = generate_id("req");
    let start = Instant::now();

    let common = anthropic_to_common(payload, &state.config).map_err(|e| {
        let err = record_error(&state, e);
        log_failure(&request_id, "unknown", start, &err);
        err
    })?;
    run_request(state, common, Dialect::Anthropic, request_id, start).await
}

async fn run_request(
    state: AppState,
    common: CommonRequest,
    dialect: Dialect,
    request_id: String,
    start: Instant,
) -> Result<axum::response::Response, AppError> {
    state.stats.record_request();

    let guard = match state.inflight.clone().try_acquire_owned() {
        Ok(permit) => InflightGuard::new(permit, state.inflight_count.clone()),
        Err(_) => {
            let err = record_error(&state, AppError::rate_limited("too many in-flight requests"));
            log_failure(&request_id, &common.model, start, &err);
            return Err(err);
        }
    };

    let stream_label = if common.stream { "true" } else { "false" };
    state
        .metrics
        .requests
        .add(1, &[KeyValue::new("stream", stream_label)]);
    info!(
        request_id = %request_id,
        model = %common.model,
        stream = common.stream,
        "request accepted"
    );

    if common.stream {
        let model = common.model.clone();
        return stream_response(state.clone(), common, dialect, guard, request_id.clone(), start)
            .await
            .map_err(|e| {
                let err = record_error(&state, e);
                log_failure(&request_id, &model, start, &err);
                err
            });
    }

    let _guard = guard;
    let (events, thinking_secs) = collect_non_stream(&state, &common).await.map_err(|e| {
        let err = record_error(&state, e);
        log_failure(&request_id, &common.model, start, &err);
        err
    })?;

    let agg = finalize::aggregate(&events);
    let prompt_chars = common.prompt_chars();
    let response = match dialect {
        Dialect::OpenAi => finalize::openai_response(
            &agg,
            &common.requested_model,
            prompt_chars,
            state.config.reasoning_mode,
            thinking_secs,
            Some(state.content_cache.as_ref()),
        )
        .map(|body| Json(body).into_response()),
        Dialect::Anthropic => {
            finalize::anthropic_response(&agg, &common.requested_model, prompt_chars)
                .map(|body| Json(body).into_response())
        }
    }
    .map_err(|e| {
        let err = record_error(&state, e);
        log_failure(&request_id, &common.model, start, &err);
        err
    })?;

    state.metrics.latency_ms.record(
        start.elapsed().as_millis() as f64,
        &[KeyValue::new("stream", "false")],
    );
    info!(
        request_id = %request_id,
        model = %common.model,
        latency_ms = start.elapsed().as_millis(),
        status = 200,
        "request completed"
    );
    Ok(response)
}

/// Non-stream upstream round trip under the request wall clock, retried once
/// when the first attempt times out (no output has been shipped yet, so the
/// retry cannot duplicate tokens).
async fn collect_non_stream(
    state: &AppState,
    common: &CommonRequest,
) -> Result<(Vec<crate::engine::StreamEvent>, u64), AppError> {
    match collect_with_deadline(state, common).await {
        Err(err) if err.is_timeout() => {
            tracing::warn!("non-stream call timed out, retrying once");
            collect_with_deadline(state, common).await
        }
        other => other,
    }
}

async fn collect_with_deadline(
    state: &AppState,
    common: &CommonRequest,
) -> Result<(Vec<crate::engine::StreamEvent>, u64), AppError> {
    tokio::time::timeout(state.config.request_timeout(), collect_events(state, common))
        .await
        .map_err(|_| {
            AppError::upstream_timeout(format!(
                "request exceeded {}s",
                state.config.limits.request_timeout_secs
            ))
        })?
}

pub async fn get_metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<axum::response::Response, AppError> {
    check_api_key(&state.config.auth, &headers, AuthSurface::OpenAi)?;
    let body = serde_json::json!({
        "uptime_secs": state.stats.uptime_secs(),
        "requests_total": state.stats.requests_total(),
        "errors_total": state.stats.errors_total(),
        "active_requests": state.inflight_count.load(Ordering::Relaxed),
        "caches": {
            "models": state.models_cache.stats(),
            "auth_token": state.token_cache.stats(),
            "content": state.content_cache.stats(),
        },
    });
    Ok(Json(body).into_response())
}

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

pub fn generate_id(prefix: &str) -> String {
    let seq = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("{}-{}-{}", prefix, ts, seq)
}

fn record_error(state: &AppState, err: AppError) -> AppError {
    state.stats.record_error();
    state
        .metrics
        .errors
        .add(1, &[KeyValue::new("type", err.kind.clone())]);
    err
}

fn log_failure(request_id: &str, model: &str, start: Instant, err: &AppError) {
    info!(
        request_id = %request_id,
        model = %model,
        latency_ms = start.elapsed().as_millis(),
        status = err.status.as_u16(),
        error_type = %err.kind,
        "request failed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_names_format_like_the_catalog() {
        assert_eq!(format_model_name("deep-seek-chat"), "DEEP-Seek-Chat");
        assert_eq!(format_model_name("qwen-7"), "QWEN-7");
    }

    #[test]
    fn glm_ids_keep_their_id_as_name() {
        let entry: UpstreamModelEntry = serde_json::from_str(
            r#"{"id":"GLM-4.5","name":"whatever","info":{"is_active":true,"created_at":7}}"#,
        )
        .expect("entry");
        let model = model_from_entry(entry);
        assert_eq!(model.name, "GLM-4.5");
        assert_eq!(model.created, 7);
        assert_eq!(model.owned_by, "z.ai");
    }

    #[test]
    fn non_ascii_display_name_is_reformatted() {
        let entry: UpstreamModelEntry =
            serde_json::from_str(r#"{"id":"chat-lite","name":"旗舰模型"}"#).expect("entry");
        let model = model_from_entry(entry);
        assert_eq!(model.name, "CHAT-Lite");
    }

    #[test]
    fn generated_ids_are_unique_and_prefixed() {
        let a = generate_id("chatcmpl");
        let b = generate_id("chatcmpl");
        assert!(a.starts_with("chatcmpl-"));
        assert_ne!(a, b);
    }
}
