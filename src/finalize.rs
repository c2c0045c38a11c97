use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

use crate::cache::TtlCache;
use crate::engine::{FinishReason, StreamEvent};
use crate::error::AppError;
use crate::models::{
    AnthropicOutBlock, AnthropicResponse, AnthropicUsage, OpenAiChoice, OpenAiChoiceMessage,
    OpenAiResponse, OpenAiToolCall, OpenAiToolCallFunction, Usage, UpstreamUsage,
};
use crate::reasoning::{self, ReasoningMode};
use crate::toolcall::ToolEvent;

/// Everything a non-streaming caller needs, accumulated from the outbound
/// event sequence.
#[derive(Debug, Default)]
pub struct Aggregate {
    pub reasoning_text: String,
    pub signature: Option<String>,
    pub answer_text: String,
    pub tool_calls: Vec<AggregatedToolCall>,
    pub finish: Option<FinishReason>,
    pub usage: Option<UpstreamUsage>,
    pub fatal: Option<String>,
}

#[derive(Debug)]
pub struct AggregatedToolCall {
    pub index: usize,
    pub id: String,
    pub name: String,
    pub arguments: String,
}

pub fn aggregate(events: &[StreamEvent]) -> Aggregate {
    let mut agg = Aggregate::default();
    let mut failed: HashSet<usize> = HashSet::new();

    for event in events {
        match event {
            StreamEvent::Start => {}
            StreamEvent::ReasoningDelta(delta) => agg.reasoning_text.push_str(delta),
            StreamEvent::ReasoningSignature(signature) => {
                agg.signature = Some(signature.clone());
            }
            StreamEvent::TextDelta(text) => agg.answer_text.push_str(text),
            StreamEvent::Tool(ToolEvent::Open { index, id, name }) => {
                agg.tool_calls.push(AggregatedToolCall {
                    index: *index,
                    id: id.clone(),
                    name: name.clone(),
                    arguments: String::new(),
                });
            }
            StreamEvent::Tool(ToolEvent::ArgsDelta { index, fragment }) => {
                if let Some(call) = agg.tool_calls.iter_mut().find(|c| c.index == *index) {
                    call.arguments.push_str(fragment);
                }
            }
            StreamEvent::Tool(ToolEvent::Error { index, .. }) => {
                failed.insert(*index);
            }
            StreamEvent::Finish { reason, usage } => {
                agg.finish = Some(*reason);
                agg.usage = *usage;
            }
            StreamEvent::Fatal(message) => agg.fatal = Some(message.clone()),
        }
    }

    agg.tool_calls.retain(|c| !failed.contains(&c.index));
    agg
}

/// Merge rendered reasoning and answer text, the single-`content` shape the
/// chat-completions dialect expects.
fn compose_content(
    agg: &Aggregate,
    mode: ReasoningMode,
    thinking_secs: u64,
    render_cache: Option<&TtlCache<String>>,
) -> String {
    if agg.reasoning_text.is_empty() {
        return agg.answer_text.clone();
    }
    let rendered = render_memoized(&agg.reasoning_text, mode, thinking_secs, render_cache);
    if agg.answer_text.is_empty() {
        rendered
    } else {
        format!("{}\n\n{}", rendered, agg.answer_text)
    }
}

fn render_memoized(
    text: &str,
    mode: ReasoningMode,
    thinking_secs: u64,
    cache: Option<&TtlCache<String>>,
) -> String {
    let Some(cache) = cache else {
        return reasoning::render(text, mode, thinking_secs);
    };
    let key = reasoning::render_fingerprint(text, mode);
    if let Some(hit) = cache.get(&key) {
        return hit;
    }
    let rendered = reasoning::render(text, mode, thinking_secs);
    cache.insert(key, rendered.clone());
    rendered
}

pub fn openai_response(
    agg: &Aggregate,
    model: &str,
    prompt_chars: usize,
    mode: ReasoningMode,
    thinking_secs: u64,
    render_cache: Option<&TtlCache<String>>,
) -> Result<OpenAiResponse, AppError> {
    if let Some(message) = &agg.fatal {
        return Err(AppError::upstream_unavailable(message.clone()));
    }

    let tool_calls: Vec<OpenAiToolCall> = agg
        .tool_calls
        .iter()
        .map(|call| OpenAiToolCall {
            id: call.id.clone(),
            call_type: "function".to_string(),
            function: OpenAiToolCallFunction {
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            },
        })
        .collect();

    let finish = agg.finish.unwrap_or(FinishReason::Stop);
    let (content, output_chars) = if tool_calls.is_empty() {
        let content = compose_content(agg, mode, thinking_secs, render_cache);
        let chars = content.chars().count();
        (Some(content), chars)
    } else {
        // Tool-call responses carry null content.
        let chars: usize = tool_calls
            .iter()
            .map(|c| c.function.arguments.chars().count())
            .sum();
        (None, chars)
    };

    let usage = agg
        .usage
        .map(Usage::from_upstream)
        .unwrap_or_else(|| Usage::estimate(prompt_chars, output_chars));

    Ok(OpenAiResponse {
        id: crate::handlers::generate_id("chatcmpl"),
        object: "chat.completion".to_string(),
        created: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
        model: model.to_string(),
        choices: vec![OpenAiChoice {
            index: 0,
            message: OpenAiChoiceMessage {
                role: "assistant".to_string(),
                content,
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
            },
            finish_reason: finish.openai().to_string(),
        }],
        usage,
    })
}

pub fn anthropic_response(
    agg: &Aggregate,
    requested_model: &str,
    prompt_chars: usize,
) -> Result<AnthropicResponse, AppError> {
    if let Some(message) = &agg.fatal {
        return Err(AppError::upstream_unavailable(message.clone()));
    }

    let mut content = Vec::new();
    if !agg.reasoning_text.is_empty() {
        content.push(AnthropicOutBlock::Thinking {
            thinking: agg.reasoning_text.clone(),
            signature: agg.signature.clone().unwrap_or_default(),
        });
    }
    if !agg.answer_text.is_empty() {
        content.push(AnthropicOutBlock::Text {
            text: agg.answer_text.clone(),
        });
    }
    let mut output_chars = agg.answer_text.chars().count();
    for call in &agg.tool_calls {
        let input: Value = serde_json::from_str(&call.arguments).map_err(|e| {
            AppError::internal(format!("tool call arguments invalid at finalization: {}", e))
        })?;
        output_chars += call.arguments.chars().count();
        content.push(AnthropicOutBlock::ToolUse {
            id: call.id.clone(),
            name: call.name.clone(),
            input,
        });
    }

    let finish = agg.finish.unwrap_or(FinishReason::Stop);
    let usage = agg
        .usage
        .map(Usage::from_upstream)
        .unwrap_or_else(|| Usage::estimate(prompt_chars, output_chars));

    Ok(AnthropicResponse {
        id: crate::handlers::generate_id("msg"),
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        model: requested_model.to_string(),
        content,
        stop_reason: finish.anthropic().to_string(),
        stop_sequence: None,
        usage: AnthropicUsage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events_simple_echo() -> Vec<StreamEvent> {
        vec![
            StreamEvent::Start,
            StreamEvent::TextDelta("He".to_string()),
            StreamEvent::TextDelta("llo".to_string()),
            StreamEvent::TextDelta("!".to_string()),
            StreamEvent::Finish {
                reason: FinishReason::Stop,
                usage: None,
            },
        ]
    }

    #[test]
    fn simple_echo_composes_content_and_estimates_usage() {
        let agg = aggregate(&events_simple_echo());
        let resp = openai_response(&agg, "GLM-4.5", 2, ReasoningMode::Think, 0, None).expect("ok");
        let choice = &resp.choices[0];
        assert_eq!(choice.message.content.as_deref(), Some("Hello!"));
        assert_eq!(choice.finish_reason, "stop");
        // ceil(6/4) == 2
        assert_eq!(resp.usage.completion_tokens, 2);
    }

    #[test]
    fn thinking_renders_in_think_mode() {
        let events = vec![
            StreamEvent::Start,
            StreamEvent::ReasoningDelta("Let me ".to_string()),
            StreamEvent::ReasoningDelta("ponder".to_string()),
            StreamEvent::ReasoningSignature("1234".to_string()),
            StreamEvent::TextDelta("42".to_string()),
            StreamEvent::Finish {
                reason: FinishReason::Stop,
                usage: None,
            },
        ];
        let agg = aggregate(&events);
        let resp = openai_response(&agg, "GLM-4.5", 2, ReasoningMode::Think, 1, None).expect("ok");
        assert_eq!(
            resp.choices[0].message.content.as_deref(),
            Some("\u{1F914}\n\nLet me ponder\n\n42")
        );
    }

    #[test]
    fn tool_calls_null_content_and_tool_calls_reason() {
        let events = vec![
            StreamEvent::Start,
            StreamEvent::Tool(ToolEvent::Open {
                index: 0,
                id: "call_1".to_string(),
                name: "get_weather".to_string(),
            }),
            StreamEvent::Tool(ToolEvent::ArgsDelta {
                index: 0,
                fragment: "{\"city\":\"Beijing\"}".to_string(),
            }),
            StreamEvent::Finish {
                reason: FinishReason::ToolCalls,
                usage: None,
            },
        ];
        let agg = aggregate(&events);
        let resp = openai_response(&agg, "GLM-4.5", 2, ReasoningMode::Think, 0, None).expect("ok");
        let choice = &resp.choices[0];
        assert!(choice.message.content.is_none());
        let calls = choice.message.tool_calls.as_ref().expect("tool calls");
        assert_eq!(calls[0].function.arguments, "{\"city\":\"Beijing\"}");
        assert_eq!(choice.finish_reason, "tool_calls");
    }

    #[test]
    fn failed_tool_calls_are_dropped_others_survive() {
        let events = vec![
            StreamEvent::Tool(ToolEvent::Open {
                index: 0,
                id: "call_1".to_string(),
                name: "a".to_string(),
            }),
            StreamEvent::Tool(ToolEvent::Open {
                index: 1,
                id: "call_2".to_string(),
                name: "b".to_string(),
            }),
            StreamEvent::Tool(ToolEvent::ArgsDelta {
                index: 1,
                fragment: "{}".to_string(),
            }),
            StreamEvent::Tool(ToolEvent::Error {
                index: 0,
                kind: "invalid_json".to_string(),
                message: "bad".to_string(),
            }),
            StreamEvent::Finish {
                reason: FinishReason::ToolCalls,
                usage: None,
            },
        ];
        let agg = aggregate(&events);
        assert_eq!(agg.tool_calls.len(), 1);
        assert_eq!(agg.tool_calls[0].id, "call_2");
    }

    #[test]
    fn upstream_usage_takes_precedence() {
        let mut events = events_simple_echo();
        events.pop();
        events.push(StreamEvent::Finish {
            reason: FinishReason::Stop,
            usage: Some(UpstreamUsage {
                input_tokens: 100,
                output_tokens: 50,
            }),
        });
        let agg = aggregate(&events);
        let resp = openai_response(&agg, "GLM-4.5", 2, ReasoningMode::Think, 0, None).expect("ok");
        assert_eq!(resp.usage.prompt_tokens, 100);
        assert_eq!(resp.usage.completion_tokens, 50);
        assert_eq!(resp.usage.total_tokens, 150);
    }

    #[test]
    fn anthropic_body_builds_blocks_in_order() {
        let events = vec![
            StreamEvent::ReasoningDelta("hm".to_string()),
            StreamEvent::ReasoningSignature("77".to_string()),
            StreamEvent::TextDelta("hi".to_string()),
            StreamEvent::Tool(ToolEvent::Open {
                index: 0,
                id: "call_1".to_string(),
                name: "f".to_string(),
            }),
            StreamEvent::Tool(ToolEvent::ArgsDelta {
                index: 0,
                fragment: "{\"x\":1}".to_string(),
            }),
            StreamEvent::Finish {
                reason: FinishReason::ToolCalls,
                usage: None,
            },
        ];
        let agg = aggregate(&events);
        let resp = anthropic_response(&agg, "claude-3-opus-20240229", 8).expect("ok");
        assert_eq!(resp.stop_reason, "tool_use");
        assert_eq!(resp.content.len(), 3);
        match &resp.content[0] {
            AnthropicOutBlock::Thinking { signature, .. } => assert_eq!(signature, "77"),
            other => panic!("unexpected block: {:?}", other),
        }
        match &resp.content[2] {
            AnthropicOutBlock::ToolUse { input, .. } => {
                assert_eq!(input["x"], 1);
            }
            other => panic!("unexpected block: {:?}", other),
        }
    }

    #[test]
    fn fatal_event_surfaces_as_upstream_error() {
        let events = vec![StreamEvent::Fatal("backend down".to_string())];
        let agg = aggregate(&events);
        let err =
            openai_response(&agg, "GLM-4.5", 0, ReasoningMode::Think, 0, None).expect_err("err");
        assert_eq!(err.kind, "upstream_error");
    }

    #[test]
    fn render_cache_is_used_on_repeat() {
        let cache: TtlCache<String> = TtlCache::new(std::time::Duration::from_secs(60), 8);
        let events = vec![
            StreamEvent::ReasoningDelta("deep thought".to_string()),
            StreamEvent::TextDelta("42".to_string()),
            StreamEvent::Finish {
                reason: FinishReason::Stop,
                usage: None,
            },
        ];
        let agg = aggregate(&events);
        let first =
            openai_response(&agg, "m", 0, ReasoningMode::Pure, 0, Some(&cache)).expect("ok");
        let second =
            openai_response(&agg, "m", 0, ReasoningMode::Pure, 0, Some(&cache)).expect("ok");
        assert_eq!(
            first.choices[0].message.content,
            second.choices[0].message.content
        );
        assert!(cache.stats().hits >= 1);
    }
}
