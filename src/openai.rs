use serde_json::{json, Value};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::engine::StreamEvent;
use crate::models::Usage;
use crate::toolcall::ToolEvent;

/// Encodes dialect-neutral stream events as OpenAI `chat.completion.chunk`
/// SSE blocks. Every produced string is one `data: <json>\n\n` block, or the
/// literal `data: [DONE]\n\n` terminator.
pub struct OpenAiEncoder {
    id: String,
    created: u64,
    model: String,
    prompt_chars: usize,
    output_chars: usize,
}

impl OpenAiEncoder {
    pub fn new(id: String, model: String, prompt_chars: usize) -> Self {
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            id,
            created,
            model,
            prompt_chars,
            output_chars: 0,
        }
    }

    pub fn encode(&mut self, event: &StreamEvent) -> Vec<String> {
        match event {
            StreamEvent::Start => {
                vec![self.chunk(json!({"role": "assistant"}), None)]
            }
            StreamEvent::ReasoningDelta(delta) => {
                vec![self.chunk(json!({"reasoning_content": delta}), None)]
            }
            StreamEvent::ReasoningSignature(signature) => {
                vec![self.chunk(
                    json!({"reasoning_content": {"thinking": "", "signature": signature}}),
                    None,
                )]
            }
            StreamEvent::TextDelta(text) => {
                self.output_chars += text.chars().count();
                vec![self.chunk(json!({"content": text}), None)]
            }
            StreamEvent::Tool(ToolEvent::Open { index, id, name }) => {
                vec![self.chunk(
                    json!({
                        "content": null,
                        "tool_calls": [{
                            "index": index,
                            "id": id,
                            "type": "function",
                            "function": {"name": name, "arguments": ""}
                        }]
                    }),
                    None,
                )]
            }
            StreamEvent::Tool(ToolEvent::ArgsDelta { index, fragment }) => {
                vec![self.chunk(
                    json!({
                        "tool_calls": [{
                            "index": index,
                            "function": {"arguments": fragment}
                        }]
                    }),
                    None,
                )]
            }
            StreamEvent::Tool(ToolEvent::Error { kind, message, .. }) => {
                vec![self.chunk(
                    json!({}),
                    Some(json!({
                        "message": message,
                        "type": "tool_call_error",
                        "code": kind,
                        "param": null,
                    })),
                )]
            }
            StreamEvent::Finish { reason, usage } => {
                let usage = usage
                    .map(Usage::from_upstream)
                    .unwrap_or_else(|| Usage::estimate(self.prompt_chars, self.output_chars));
                let final_chunk = json!({
                    "id": self.id,
                    "object": "chat.completion.chunk",
                    "created": self.created,
                    "model": self.model,
                    "choices": [{
                        "index": 0,
                        "delta": {},
                        "finish_reason": reason.openai(),
                    }],
                    "usage": usage,
                });
                vec![
                    sse_data(&final_chunk),
                    "data: [DONE]\n\n".to_string(),
                ]
            }
            StreamEvent::Fatal(message) => {
                let body = json!({
                    "error": {
                        "message": message,
                        "type": "upstream_error",
                        "code": "upstream_error",
                        "param": null,
                    }
                });
                vec![sse_data(&body), "data: [DONE]\n\n".to_string()]
            }
        }
    }

    /// OpenAI streams carry no heartbeat: an SSE comment is not a valid
    /// dialect event.
    pub fn heartbeat(&self) -> Option<String> {
        None
    }

    fn chunk(&self, delta: Value, error: Option<Value>) -> String {
        let mut body = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": null,
            }],
        });
        if let Some(error) = error {
            body["error"] = error;
        }
        sse_data(&body)
    }
}

fn sse_data(value: &Value) -> String {
    format!("data: {}\n\n", value)
}
