use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::models::{Phase, UpstreamFrame, UpstreamUsage};
use crate::reasoning;
use crate::toolcall::{ToolEvent, ToolSession};

const THINK_END_MARKER: &str = "</details>\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseState {
    Init,
    StreamingAnswer,
    StreamingThink,
    ToolCall,
    PostThinkBridge,
    Done,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
}

impl FinishReason {
    pub fn openai(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::ToolCalls => "tool_calls",
        }
    }

    pub fn anthropic(self) -> &'static str {
        match self {
            Self::Stop => "end_turn",
            Self::ToolCalls => "tool_use",
        }
    }
}

/// Dialect-neutral outbound event. The adapters encode these into OpenAI
/// chunks or Anthropic typed events; order of emission is the wire order.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Start,
    ReasoningDelta(String),
    ReasoningSignature(String),
    TextDelta(String),
    Tool(ToolEvent),
    Finish {
        reason: FinishReason,
        usage: Option<UpstreamUsage>,
    },
    Fatal(String),
}

#[derive(Debug, Default)]
struct ReasoningBuffer {
    text: String,
    emitted_signature: bool,
    started_at: Option<Instant>,
}

/// Phase-driven translation core. One engine per request; frames go in,
/// outbound events come out, strictly in order.
pub struct Engine {
    state: ResponseState,
    started: bool,
    reasoning: ReasoningBuffer,
    tools: ToolSession,
    answer_text: String,
    usage: Option<UpstreamUsage>,
    finish: Option<FinishReason>,
    stray_tool_terminators: u64,
}

impl Engine {
    pub fn new(tool_call_timeout: Duration) -> Self {
        Self {
            state: ResponseState::Init,
            started: false,
            reasoning: ReasoningBuffer::default(),
            tools: ToolSession::new(tool_call_timeout),
            answer_text: String::new(),
            usage: None,
            finish: None,
            stray_tool_terminators: 0,
        }
    }

    pub fn state(&self) -> ResponseState {
        self.state
    }

    pub fn answer_text(&self) -> &str {
        &self.answer_text
    }

    pub fn reasoning_text(&self) -> &str {
        &self.reasoning.text
    }

    pub fn thinking_secs(&self) -> u64 {
        self.reasoning
            .started_at
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0)
    }

    pub fn stray_tool_terminators(&self) -> u64 {
        self.stray_tool_terminators
    }

    /// Consume one upstream frame. Frames arriving after the terminal state
    /// are discarded.
    pub fn step(&mut self, frame: &UpstreamFrame) -> Vec<StreamEvent> {
        if matches!(self.state, ResponseState::Done | ResponseState::Error) {
            return Vec::new();
        }

        let mut events = Vec::new();
        if !self.started {
            self.started = true;
            events.push(StreamEvent::Start);
        }

        if let Some(err) = &frame.error {
            let detail = err
                .detail
                .clone()
                .unwrap_or_else(|| "upstream reported an error".to_string());
            self.state = ResponseState::Error;
            events.push(StreamEvent::Fatal(detail));
            return events;
        }

        if let Some(usage) = frame.usage {
            self.usage = Some(usage);
        }

        for expired in self.tools.expire_stale() {
            events.push(StreamEvent::Tool(expired));
        }

        if frame.done {
            self.emit_finish(&mut events);
            return events;
        }

        match frame.phase {
            Phase::Thinking => self.on_thinking(frame, &mut events),
            Phase::Answer => self.on_answer(frame, &mut events),
            Phase::ToolCall => self.on_tool_call(frame, &mut events),
            Phase::Other => self.on_other(frame, &mut events),
        }

        events
    }

    /// Stream closed without a `done` frame; behaves as `done`.
    pub fn finish_eof(&mut self) -> Vec<StreamEvent> {
        if matches!(self.state, ResponseState::Done | ResponseState::Error) {
            return Vec::new();
        }
        let mut events = Vec::new();
        if !self.started {
            self.started = true;
            events.push(StreamEvent::Start);
        }
        self.emit_finish(&mut events);
        events
    }

    fn on_thinking(&mut self, frame: &UpstreamFrame, events: &mut Vec<StreamEvent>) {
        let Some(delta) = frame.delta_content.as_deref().filter(|d| !d.is_empty()) else {
            if self.state == ResponseState::Init {
                self.state = ResponseState::StreamingThink;
            }
            return;
        };
        if self.reasoning.started_at.is_none() {
            self.reasoning.started_at = Some(Instant::now());
        }
        let cleaned = reasoning::clean_streaming_delta(delta);
        if !cleaned.is_empty() {
            self.reasoning.text.push_str(&cleaned);
            events.push(StreamEvent::ReasoningDelta(cleaned));
        }
        self.state = ResponseState::StreamingThink;
    }

    fn on_answer(&mut self, frame: &UpstreamFrame, events: &mut Vec<StreamEvent>) {
        // While a tool call is active, upstream answer text is scaffolding
        // around the call and must not leak to the caller.
        if self.tools.any_active() {
            return;
        }

        let candidate = frame
            .delta_content
            .as_deref()
            .filter(|d| !d.is_empty())
            .or(frame.edit_content.as_deref())
            .unwrap_or("");

        let text = if self.state == ResponseState::StreamingThink {
            match candidate.split_once(THINK_END_MARKER) {
                Some((_, after)) => {
                    if !self.reasoning.emitted_signature {
                        events.push(StreamEvent::ReasoningSignature(self.freeze_reasoning()));
                    }
                    self.state = ResponseState::PostThinkBridge;
                    after
                }
                None => candidate,
            }
        } else {
            candidate
        };

        if !text.is_empty() {
            self.answer_text.push_str(text);
            events.push(StreamEvent::TextDelta(text.to_string()));
            self.state = ResponseState::StreamingAnswer;
        } else if self.state == ResponseState::Init {
            self.state = ResponseState::StreamingAnswer;
        }
    }

    fn on_tool_call(&mut self, frame: &UpstreamFrame, events: &mut Vec<StreamEvent>) {
        self.state = ResponseState::ToolCall;
        if let Some(edit) = frame.edit_content.as_deref() {
            for event in self.tools.ingest(edit) {
                events.push(StreamEvent::Tool(event));
            }
        }
    }

    fn on_other(&mut self, frame: &UpstreamFrame, events: &mut Vec<StreamEvent>) {
        let Some(edit) = frame.edit_content.as_deref() else {
            return;
        };
        if !edit.starts_with("null,") {
            return;
        }
        if self.tools.any_active() {
            for error in self.tools.close_all() {
                events.push(StreamEvent::Tool(error));
            }
            self.finish = Some(FinishReason::ToolCalls);
            self.emit_finish(events);
        } else {
            // Terminator without an open call; the upstream emits these for
            // non-tool block types too. Counted, not acted on.
            self.stray_tool_terminators += 1;
            tracing::debug!("tool terminator with no active calls");
        }
    }

    fn emit_finish(&mut self, events: &mut Vec<StreamEvent>) {
        if self.tools.any_active() {
            for error in self.tools.close_all() {
                events.push(StreamEvent::Tool(error));
            }
            self.finish = Some(FinishReason::ToolCalls);
        }
        let reason = self.finish.unwrap_or_else(|| {
            if self.tools.calls().is_empty() {
                FinishReason::Stop
            } else {
                FinishReason::ToolCalls
            }
        });
        self.finish = Some(reason);
        events.push(StreamEvent::Finish {
            reason,
            usage: self.usage,
        });
        self.state = ResponseState::Done;
    }

    fn freeze_reasoning(&mut self) -> String {
        self.reasoning.emitted_signature = true;
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0)
            .to_string()
    }
}
