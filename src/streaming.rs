use axum::{
    body::Bytes,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use opentelemetry::KeyValue;

use crate::anthropic::AnthropicEncoder;
use crate::engine::{Engine, ResponseState, StreamEvent};
use crate::error::AppError;
use crate::handlers::generate_id;
use crate::openai::OpenAiEncoder;
use crate::sse::SseParser;
use crate::state::{AppState, InflightGuard};
use crate::transform::{self, CommonRequest, Dialect};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

enum Encoder {
    OpenAi(OpenAiEncoder),
    Anthropic(AnthropicEncoder),
}

impl Encoder {
    fn encode(&mut self, event: &StreamEvent) -> Vec<String> {
        match self {
            Self::OpenAi(enc) => enc.encode(event),
            Self::Anthropic(enc) => enc.encode(event),
        }
    }

    fn heartbeat(&self) -> Option<String> {
        match self {
            Self::OpenAi(enc) => enc.heartbeat(),
            Self::Anthropic(enc) => enc.heartbeat(),
        }
    }
}

/// Open the upstream stream and bridge it to the caller through the
/// translation engine. The writer side reads from a bounded channel, so a
/// slow caller backpressures the upstream read.
pub async fn stream_response(
    state: AppState,
    common: CommonRequest,
    dialect: Dialect,
    guard: InflightGuard,
    request_id: String,
    start: Instant,
) -> Result<Response, AppError> {
    let chat_id = generate_id("chat");
    let upstream_req = transform::to_upstream(&common, chat_id, generate_id("msg"));
    let resp = state.upstream.chat_stream(&upstream_req).await?;

    let mut encoder = match dialect {
        Dialect::OpenAi => Encoder::OpenAi(OpenAiEncoder::new(
            generate_id("chatcmpl"),
            common.requested_model.clone(),
            common.prompt_chars(),
        )),
        Dialect::Anthropic => Encoder::Anthropic(AnthropicEncoder::new(
            generate_id("msg"),
            common.requested_model.clone(),
            common.prompt_chars(),
        )),
    };

    let (tx, rx) = mpsc::channel::<Result<Bytes, std::convert::Infallible>>(64);
    let metrics = state.metrics.clone();
    let stream_timeout = state.config.stream_timeout();
    let tool_timeout = state.config.tool_call_timeout();

    tokio::spawn(async move {
        let _guard = guard;
        let mut parser = SseParser::new(Box::pin(resp.bytes_stream()), stream_timeout);
        let mut engine = Engine::new(tool_timeout);
        let deadline = Instant::now() + stream_timeout;
        let mut last_sent = Instant::now();

        loop {
            if Instant::now() >= deadline {
                let timeout = AppError::upstream_timeout(format!(
                    "stream exceeded {}s wall clock",
                    stream_timeout.as_secs()
                ));
                send_terminator(&tx, &mut encoder, &metrics, &timeout).await;
                break;
            }

            match parser.next_frame().await {
                Ok(Some(frame)) => {
                    if last_sent.elapsed() >= HEARTBEAT_INTERVAL {
                        if let Some(ping) = encoder.heartbeat() {
                            if tx.send(Ok(Bytes::from(ping))).await.is_err() {
                                break;
                            }
                            last_sent = Instant::now();
                        }
                    }
                    let events = engine.step(&frame);
                    if !send_events(&tx, &mut encoder, &events).await {
                        break;
                    }
                    if !events.is_empty() {
                        last_sent = Instant::now();
                    }
                    if matches!(engine.state(), ResponseState::Done | ResponseState::Error) {
                        break;
                    }
                }
                Ok(None) => {
                    let events = engine.finish_eof();
                    send_events(&tx, &mut encoder, &events).await;
                    break;
                }
                Err(err) => {
                    send_terminator(&tx, &mut encoder, &metrics, &err).await;
                    break;
                }
            }
        }

        if parser.skipped() > 0 {
            tracing::warn!(
                request_id = %request_id,
                skipped = parser.skipped(),
                "stream finished with undecodable upstream frames"
            );
        }
        metrics.latency_ms.record(
            start.elapsed().as_millis() as f64,
            &[KeyValue::new("stream", "true")],
        );
    });

    let body = axum::body::Body::from_stream(ReceiverStream::new(rx));
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}

async fn send_events(
    tx: &mpsc::Sender<Result<Bytes, std::convert::Infallible>>,
    encoder: &mut Encoder,
    events: &[StreamEvent],
) -> bool {
    for event in events {
        for block in encoder.encode(event) {
            if tx.send(Ok(Bytes::from(block))).await.is_err() {
                // Caller went away; dropping the task aborts the upstream read.
                return false;
            }
        }
    }
    true
}

async fn send_terminator(
    tx: &mpsc::Sender<Result<Bytes, std::convert::Infallible>>,
    encoder: &mut Encoder,
    metrics: &crate::metrics::Metrics,
    err: &AppError,
) {
    metrics
        .errors
        .add(1, &[KeyValue::new("type", err.kind.clone())]);
    let events = [StreamEvent::Fatal(err.message.clone())];
    let _ = send_events(tx, encoder, &events).await;
}

/// Drive the engine over the whole upstream stream and return the ordered
/// event sequence plus the elapsed thinking time; the non-streaming
/// finalizer consumes both.
pub async fn collect_events(
    state: &AppState,
    common: &CommonRequest,
) -> Result<(Vec<StreamEvent>, u64), AppError> {
    let chat_id = generate_id("chat");
    let upstream_req = transform::to_upstream(common, chat_id, generate_id("msg"));
    let resp = state.upstream.chat_stream(&upstream_req).await?;

    let mut parser = SseParser::new(Box::pin(resp.bytes_stream()), state.config.stream_timeout());
    let mut engine = Engine::new(state.config.tool_call_timeout());
    let mut events = Vec::new();

    loop {
        match parser.next_frame().await? {
            Some(frame) => {
                events.extend(engine.step(&frame));
                if matches!(engine.state(), ResponseState::Done | ResponseState::Error) {
                    break;
                }
            }
            None => {
                events.extend(engine.finish_eof());
                break;
            }
        }
    }
    Ok((events, engine.thinking_secs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Phase, UpstreamFrame};

    fn frame(phase: Phase, delta: Option<&str>, edit: Option<&str>, done: bool) -> UpstreamFrame {
        UpstreamFrame {
            phase,
            delta_content: delta.map(str::to_string),
            edit_content: edit.map(str::to_string),
            usage: None,
            done,
            error: None,
        }
    }

    fn run_pipeline(mut encoder: Encoder, frames: &[UpstreamFrame]) -> Vec<String> {
        let mut engine = Engine::new(Duration::from_secs(30));
        let mut blocks = Vec::new();
        for f in frames {
            for event in engine.step(f) {
                blocks.extend(encoder.encode(&event));
            }
        }
        for event in engine.finish_eof() {
            blocks.extend(encoder.encode(&event));
        }
        blocks
    }

    #[test]
    fn openai_tool_call_stream_end_to_end() {
        let encoder = Encoder::OpenAi(OpenAiEncoder::new(
            "chatcmpl-t".to_string(),
            "GLM-4.5".to_string(),
            4,
        ));
        let tool_edit = "<glm_block >{\"type\":\"tool_call\",\"data\":{\"metadata\":{\"id\":\"call_1\",\"name\":\"get_weather\",\"arguments\":{\"city\":\"Beijing\"}}}}</glm_block>";
        let frames = vec![
            frame(Phase::ToolCall, None, Some(tool_edit), false),
            frame(Phase::Other, None, Some("null,[\"x\"]"), false),
        ];
        let blocks = run_pipeline(encoder, &frames);

        // Open chunk, argument reassembly, tool_calls finish, [DONE].
        let mut arguments = String::new();
        let mut saw_open = false;
        let mut finish_reason = None;
        for block in &blocks {
            if block == "data: [DONE]\n\n" {
                continue;
            }
            let payload = block
                .strip_prefix("data: ")
                .and_then(|s| s.strip_suffix("\n\n"))
                .expect("sse block");
            let value: serde_json::Value = serde_json::from_str(payload).expect("json");
            if let Some(calls) = value["choices"][0]["delta"]["tool_calls"].as_array() {
                for call in calls {
                    if call["id"] == "call_1" {
                        saw_open = true;
                    }
                    if let Some(fragment) = call["function"]["arguments"].as_str() {
                        arguments.push_str(fragment);
                    }
                }
            }
            if let Some(reason) = value["choices"][0]["finish_reason"].as_str() {
                finish_reason = Some(reason.to_string());
            }
        }
        assert!(saw_open);
        assert_eq!(arguments, "{\"city\":\"Beijing\"}");
        assert_eq!(finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(blocks.last().map(String::as_str), Some("data: [DONE]\n\n"));
    }

    #[test]
    fn anthropic_stream_end_to_end_event_order() {
        let encoder = Encoder::Anthropic(AnthropicEncoder::new(
            "msg_t".to_string(),
            "claude-3-opus-20240229".to_string(),
            4,
        ));
        let frames = vec![
            frame(Phase::Answer, Some("Hel"), None, false),
            frame(Phase::Answer, Some("lo"), None, false),
            frame(Phase::Other, None, None, true),
        ];
        let blocks = run_pipeline(encoder, &frames);
        let order: Vec<&str> = blocks
            .iter()
            .map(|b| {
                b.strip_prefix("event: ")
                    .and_then(|s| s.split('\n').next())
                    .expect("event line")
            })
            .collect();
        assert_eq!(
            order,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert!(blocks[5].contains("\"stop_reason\":\"end_turn\""));
    }

    #[test]
    fn answer_text_between_tool_frames_never_reaches_the_wire() {
        let encoder = Encoder::OpenAi(OpenAiEncoder::new(
            "chatcmpl-t".to_string(),
            "GLM-4.5".to_string(),
            4,
        ));
        let tool_edit = "<glm_block >{\"type\":\"tool_call\",\"data\":{\"metadata\":{\"id\":\"call_1\",\"name\":\"f\",\"arguments\":{}}}}</glm_block>";
        let frames = vec![
            frame(Phase::ToolCall, None, Some(tool_edit), false),
            frame(Phase::Answer, Some("I will call a tool now"), None, false),
            frame(Phase::Other, None, Some("null,"), false),
        ];
        let blocks = run_pipeline(encoder, &frames);
        assert!(!blocks.iter().any(|b| b.contains("I will call a tool now")));
    }
}
