use serde_json::json;
use std::collections::HashMap;

use crate::engine::StreamEvent;
use crate::models::Usage;
use crate::toolcall::ToolEvent;

/// Encodes dialect-neutral stream events as Anthropic typed SSE events.
///
/// Content-block indices are allocated here, in emission order; every delta
/// stays inside its block's start/stop envelope and the event order is
/// message_start → blocks → message_delta → message_stop.
pub struct AnthropicEncoder {
    message_id: String,
    model: String,
    next_index: u32,
    text_block: Option<u32>,
    thinking_block: Option<u32>,
    tool_blocks: HashMap<usize, u32>,
    open_tool_blocks: Vec<u32>,
    prompt_chars: usize,
    output_chars: usize,
}

impl AnthropicEncoder {
    pub fn new(message_id: String, model: String, prompt_chars: usize) -> Self {
        Self {
            message_id,
            model,
            next_index: 0,
            text_block: None,
            thinking_block: None,
            tool_blocks: HashMap::new(),
            open_tool_blocks: Vec::new(),
            prompt_chars,
            output_chars: 0,
        }
    }

    pub fn encode(&mut self, event: &StreamEvent) -> Vec<String> {
        match event {
            StreamEvent::Start => {
                let message = json!({
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": self.model,
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": 0, "output_tokens": 0},
                });
                vec![sse_event(
                    "message_start",
                    json!({"type": "message_start", "message": message}),
                )]
            }
            StreamEvent::ReasoningDelta(delta) => {
                let mut out = Vec::new();
                let index = self.ensure_thinking_block(&mut out);
                out.push(sse_event(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": {"type": "thinking_delta", "thinking": delta}
                    }),
                ));
                out
            }
            StreamEvent::ReasoningSignature(signature) => {
                let mut out = Vec::new();
                let index = self.ensure_thinking_block(&mut out);
                out.push(sse_event(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": {"type": "signature_delta", "signature": signature}
                    }),
                ));
                self.thinking_block = None;
                out.push(sse_event(
                    "content_block_stop",
                    json!({"type": "content_block_stop", "index": index}),
                ));
                out
            }
            StreamEvent::TextDelta(text) => {
                self.output_chars += text.chars().count();
                let mut out = Vec::new();
                let index = self.ensure_text_block(&mut out);
                out.push(sse_event(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": {"type": "text_delta", "text": text}
                    }),
                ));
                out
            }
            StreamEvent::Tool(ToolEvent::Open { index, id, name }) => {
                let mut out = Vec::new();
                self.stop_text_block(&mut out);
                let block = self.next_index;
                self.next_index += 1;
                self.tool_blocks.insert(*index, block);
                self.open_tool_blocks.push(block);
                out.push(sse_event(
                    "content_block_start",
                    json!({
                        "type": "content_block_start",
                        "index": block,
                        "content_block": {
                            "type": "tool_use",
                            "id": id,
                            "name": name,
                            "input": {}
                        }
                    }),
                ));
                out
            }
            StreamEvent::Tool(ToolEvent::ArgsDelta { index, fragment }) => {
                let Some(block) = self.tool_blocks.get(index).copied() else {
                    return Vec::new();
                };
                vec![sse_event(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": block,
                        "delta": {"type": "input_json_delta", "partial_json": fragment}
                    }),
                )]
            }
            StreamEvent::Tool(ToolEvent::Error { kind, message, .. }) => {
                vec![sse_event(
                    "error",
                    json!({
                        "type": "error",
                        "error": {"type": format!("tool_call_{}", kind), "message": message}
                    }),
                )]
            }
            StreamEvent::Finish { reason, usage } => {
                let mut out = Vec::new();
                self.flush_open_blocks(&mut out);
                let usage = usage
                    .map(Usage::from_upstream)
                    .unwrap_or_else(|| Usage::estimate(self.prompt_chars, self.output_chars));
                out.push(sse_event(
                    "message_delta",
                    json!({
                        "type": "message_delta",
                        "delta": {"stop_reason": reason.anthropic(), "stop_sequence": null},
                        "usage": {
                            "input_tokens": usage.prompt_tokens,
                            "output_tokens": usage.completion_tokens
                        }
                    }),
                ));
                out.push(sse_event("message_stop", json!({"type": "message_stop"})));
                out
            }
            StreamEvent::Fatal(message) => {
                vec![sse_event(
                    "error",
                    json!({
                        "type": "error",
                        "error": {"type": "upstream_error", "message": message}
                    }),
                )]
            }
        }
    }

    pub fn heartbeat(&self) -> Option<String> {
        Some(sse_event("ping", json!({"type": "ping"})))
    }

    fn ensure_text_block(&mut self, out: &mut Vec<String>) -> u32 {
        if let Some(index) = self.text_block {
            return index;
        }
        let index = self.next_index;
        self.next_index += 1;
        self.text_block = Some(index);
        out.push(sse_event(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": index,
                "content_block": {"type": "text", "text": ""}
            }),
        ));
        index
    }

    fn ensure_thinking_block(&mut self, out: &mut Vec<String>) -> u32 {
        if let Some(index) = self.thinking_block {
            return index;
        }
        let index = self.next_index;
        self.next_index += 1;
        self.thinking_block = Some(index);
        out.push(sse_event(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": index,
                "content_block": {"type": "thinking", "thinking": "", "signature": ""}
            }),
        ));
        index
    }

    fn stop_text_block(&mut self, out: &mut Vec<String>) {
        if let Some(index) = self.text_block.take() {
            out.push(sse_event(
                "content_block_stop",
                json!({"type": "content_block_stop", "index": index}),
            ));
        }
    }

    fn flush_open_blocks(&mut self, out: &mut Vec<String>) {
        if let Some(index) = self.thinking_block.take() {
            out.push(sse_event(
                "content_block_stop",
                json!({"type": "content_block_stop", "index": index}),
            ));
        }
        self.stop_text_block(out);
        for block in self.open_tool_blocks.drain(..) {
            out.push(sse_event(
                "content_block_stop",
                json!({"type": "content_block_stop", "index": block}),
            ));
        }
    }
}

fn sse_event(event: &str, data: serde_json::Value) -> String {
    format!("event: {}\ndata: {}\n\n", event, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FinishReason;

    fn encoder() -> AnthropicEncoder {
        AnthropicEncoder::new("msg_test".to_string(), "claude-3-opus-20240229".to_string(), 4)
    }

    fn event_types(blocks: &[String]) -> Vec<String> {
        blocks
            .iter()
            .map(|b| {
                b.strip_prefix("event: ")
                    .and_then(|s| s.split('\n').next())
                    .expect("event line")
                    .to_string()
            })
            .collect()
    }

    #[test]
    fn text_stream_produces_canonical_event_order() {
        let mut enc = encoder();
        let mut blocks = Vec::new();
        blocks.extend(enc.encode(&StreamEvent::Start));
        blocks.extend(enc.encode(&StreamEvent::TextDelta("Hel".to_string())));
        blocks.extend(enc.encode(&StreamEvent::TextDelta("lo".to_string())));
        blocks.extend(enc.encode(&StreamEvent::Finish {
            reason: FinishReason::Stop,
            usage: None,
        }));

        assert_eq!(
            event_types(&blocks),
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
    fn deltas_never_escape_their_envelope() {
        let mut enc = encoder();
        let mut blocks = Vec::new();
        blocks.extend(enc.encode(&StreamEvent::Start));
        blocks.extend(enc.encode(&StreamEvent::ReasoningDelta("hm".to_string())));
        blocks.extend(enc.encode(&StreamEvent::ReasoningSignature("123".to_string())));
        blocks.extend(enc.encode(&StreamEvent::TextDelta("hi".to_string())));
        blocks.extend(enc.encode(&StreamEvent::Finish {
            reason: FinishReason::Stop,
            usage: None,
        }));

        // Track per-index envelope state over the whole stream.
        let mut open: std::collections::HashSet<u64> = Default::default();
        for block in &blocks {
            let data = block.split("data: ").nth(1).expect("data line").trim();
            let value: serde_json::Value = serde_json::from_str(data).expect("json");
            match value["type"].as_str().expect("type") {
                "content_block_start" => {
                    assert!(open.insert(value["index"].as_u64().expect("index")));
                }
                "content_block_delta" => {
                    assert!(open.contains(&value["index"].as_u64().expect("index")));
                }
                "content_block_stop" => {
                    assert!(open.remove(&value["index"].as_u64().expect("index")));
                }
                _ => {}
            }
        }
        assert!(open.is_empty());
    }

    #[test]
    fn thinking_block_precedes_text_block() {
        let mut enc = encoder();
        let mut blocks = Vec::new();
        blocks.extend(enc.encode(&StreamEvent::ReasoningDelta("a".to_string())));
        blocks.extend(enc.encode(&StreamEvent::ReasoningSignature("9".to_string())));
        blocks.extend(enc.encode(&StreamEvent::TextDelta("b".to_string())));
        assert!(blocks[0].contains("\"thinking\""));
        assert!(blocks[0].contains("\"index\":0"));
        assert!(blocks[4].contains("\"index\":1"));
        assert!(blocks[2].contains("signature_delta"));
    }

    #[test]
    fn tool_events_map_to_tool_use_blocks() {
        let mut enc = encoder();
        let mut blocks = Vec::new();
        blocks.extend(enc.encode(&StreamEvent::Tool(ToolEvent::Open {
            index: 0,
            id: "call_1".to_string(),
            name: "get_weather".to_string(),
        })));
        blocks.extend(enc.encode(&StreamEvent::Tool(ToolEvent::ArgsDelta {
            index: 0,
            fragment: "{\"city\":\"Beijing\"}".to_string(),
        })));
        blocks.extend(enc.encode(&StreamEvent::Finish {
            reason: FinishReason::ToolCalls,
            usage: None,
        }));

        assert!(blocks[0].contains("tool_use"));
        assert!(blocks[1].contains("input_json_delta"));
        let last = blocks.len() - 2;
        assert!(blocks[last].contains("\"stop_reason\":\"tool_use\""));
    }

    #[test]
    fn heartbeat_is_a_ping_event() {
        let enc = encoder();
        let ping = enc.heartbeat().expect("ping");
        assert!(ping.starts_with("event: ping\n"));
    }
}
