use serde::Deserialize;
use serde_json::Value;
use std::time::{Duration, Instant};

const BLOCK_OPEN: &str = "<glm_block >";
const BLOCK_CLOSE: &str = "</glm_block>";
const ARGS_FRAGMENT_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCallState {
    Open,
    Closed,
}

#[derive(Debug)]
pub struct ToolCall {
    pub index: usize,
    pub id: String,
    pub name: String,
    pub arguments: String,
    pub state: ToolCallState,
    pub failed: bool,
    opened_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolEvent {
    Open {
        index: usize,
        id: String,
        name: String,
    },
    ArgsDelta {
        index: usize,
        fragment: String,
    },
    Error {
        index: usize,
        kind: String,
        message: String,
    },
}

/// Wire shape of one closed `<glm_block>` payload.
#[derive(Debug, Deserialize)]
struct BlockPayload {
    #[serde(rename = "type", default)]
    payload_type: String,
    #[serde(default)]
    data: BlockData,
}

#[derive(Debug, Default, Deserialize)]
struct BlockData {
    #[serde(default)]
    metadata: BlockMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct BlockMetadata {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<Value>,
}

/// Per-response tool-call assembly: ordered calls keyed by ordinal, plus a
/// buffer for a trailing block that has not closed yet.
#[derive(Debug)]
pub struct ToolSession {
    calls: Vec<ToolCall>,
    pending: String,
    timeout: Duration,
}

impl ToolSession {
    pub fn new(timeout: Duration) -> Self {
        Self {
            calls: Vec::new(),
            pending: String::new(),
            timeout,
        }
    }

    pub fn any_active(&self) -> bool {
        self.calls.iter().any(|c| c.state == ToolCallState::Open)
    }

    pub fn calls(&self) -> &[ToolCall] {
        &self.calls
    }

    /// Feed one `tool_call` frame's `edit_content`. Only blocks that close
    /// within the buffered text are processed; an unclosed trailing block
    /// waits for the next frame.
    pub fn ingest(&mut self, chunk: &str) -> Vec<ToolEvent> {
        self.pending.push_str(chunk);
        let mut events = Vec::new();

        loop {
            let Some(open) = self.pending.find(BLOCK_OPEN) else {
                self.retain_partial_opener();
                break;
            };
            let body_start = open + BLOCK_OPEN.len();
            let Some(close) = self.pending[body_start..].find(BLOCK_CLOSE) else {
                // Unclosed trailing block: keep from the opener onward.
                self.pending.drain(..open);
                break;
            };
            let inner = self.pending[body_start..body_start + close].to_string();
            self.pending.drain(..body_start + close + BLOCK_CLOSE.len());
            events.extend(self.open_call(&inner));
        }

        events
    }

    fn open_call(&mut self, inner: &str) -> Vec<ToolEvent> {
        let payload: BlockPayload = match serde_json::from_str(inner) {
            Ok(p) => p,
            Err(err) => {
                tracing::warn!("tool call block decode failed: {}", err);
                return Vec::new();
            }
        };
        if payload.payload_type != "tool_call" {
            return Vec::new();
        }
        let metadata = payload.data.metadata;
        let Some(name) = metadata.name else {
            tracing::warn!("tool call block missing function name");
            return Vec::new();
        };
        let id = metadata.id.unwrap_or_else(synthesize_call_id);
        let arguments = metadata.arguments.unwrap_or(Value::Object(Default::default()));
        let canonical = match serde_json::to_string(&arguments) {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!("tool call arguments not serializable: {}", err);
                return Vec::new();
            }
        };

        let index = self.calls.len();
        self.calls.push(ToolCall {
            index,
            id: id.clone(),
            name: name.clone(),
            arguments: canonical.clone(),
            state: ToolCallState::Open,
            failed: false,
            opened_at: Instant::now(),
        });

        let mut events = vec![ToolEvent::Open { index, id, name }];
        for fragment in chunk_chars(&canonical, ARGS_FRAGMENT_CHARS) {
            events.push(ToolEvent::ArgsDelta { index, fragment });
        }
        events
    }

    /// Close every open call; invoked when the upstream emits its
    /// `null,`-prefixed terminator frame. Argument buffers that fail to
    /// parse produce a `tool-error` for that call only.
    pub fn close_all(&mut self) -> Vec<ToolEvent> {
        let mut events = Vec::new();
        for call in &mut self.calls {
            if call.state == ToolCallState::Closed {
                continue;
            }
            call.state = ToolCallState::Closed;
            if serde_json::from_str::<Value>(&call.arguments).is_err() {
                call.failed = true;
                events.push(ToolEvent::Error {
                    index: call.index,
                    kind: "invalid_json".to_string(),
                    message: format!("tool call {} arguments are not valid JSON", call.id),
                });
            }
        }
        events
    }

    /// Force-close calls that have been open longer than the configured
    /// per-call timeout.
    pub fn expire_stale(&mut self) -> Vec<ToolEvent> {
        let mut events = Vec::new();
        for call in &mut self.calls {
            if call.state == ToolCallState::Open && call.opened_at.elapsed() > self.timeout {
                call.state = ToolCallState::Closed;
                call.failed = true;
                events.push(ToolEvent::Error {
                    index: call.index,
                    kind: "timeout".to_string(),
                    message: format!("tool call {} timed out before completion", call.id),
                });
            }
        }
        events
    }

    // A frame boundary can fall inside the opener marker itself; keep the
    // longest suffix that could still grow into one. The marker is ASCII, so
    // a byte-suffix match is also a char-boundary match.
    fn retain_partial_opener(&mut self) {
        let bytes = self.pending.as_bytes();
        for keep in (1..BLOCK_OPEN.len()).rev() {
            if bytes.len() >= keep && bytes[bytes.len() - keep..] == BLOCK_OPEN.as_bytes()[..keep] {
                self.pending.drain(..self.pending.len() - keep);
                return;
            }
        }
        self.pending.clear();
    }
}

fn synthesize_call_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("call_{}", &hex[..12])
}

fn chunk_chars(s: &str, max_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut count = 0;
    for ch in s.chars() {
        current.push(ch);
        count += 1;
        if count == max_chars {
            out.push(std::mem::take(&mut current));
            count = 0;
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(id: &str, name: &str, args: &str) -> String {
        format!(
            "{}{{\"type\":\"tool_call\",\"data\":{{\"metadata\":{{\"id\":\"{}\",\"name\":\"{}\",\"arguments\":{}}}}}}}{}",
            BLOCK_OPEN, id, name, args, BLOCK_CLOSE
        )
    }

    fn session() -> ToolSession {
        ToolSession::new(Duration::from_secs(30))
    }

    #[test]
    fn single_block_opens_and_streams_arguments() {
        let mut session = session();
        let events = session.ingest(&block("call_1", "get_weather", r#"{"city":"Beijing"}"#));

        assert_eq!(
            events[0],
            ToolEvent::Open {
                index: 0,
                id: "call_1".to_string(),
                name: "get_weather".to_string(),
            }
        );
        let rebuilt: String = events
            .iter()
            .filter_map(|e| match e {
                ToolEvent::ArgsDelta { fragment, .. } => Some(fragment.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(rebuilt, r#"{"city":"Beijing"}"#);
        assert!(session.any_active());
    }

    #[test]
    fn two_blocks_in_one_frame_get_consecutive_indices() {
        let mut session = session();
        let frame = format!(
            "{}{}",
            block("call_1", "get_weather", r#"{"city":"Beijing"}"#),
            block("call_2", "get_time", r#"{"tz":"Asia/Shanghai"}"#)
        );
        let events = session.ingest(&frame);

        let opens: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ToolEvent::Open { index, name, .. } => Some((*index, name.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(
            opens,
            vec![(0, "get_weather".to_string()), (1, "get_time".to_string())]
        );
    }

    #[test]
    fn unclosed_block_waits_for_next_frame() {
        let mut session = session();
        let full = block("call_1", "lookup", r#"{"q":"rust"}"#);
        let (head, tail) = full.split_at(30);

        assert!(session.ingest(head).is_empty());
        let events = session.ingest(tail);
        assert!(matches!(events[0], ToolEvent::Open { index: 0, .. }));
    }

    #[test]
    fn opener_split_across_frames_is_reassembled() {
        let mut session = session();
        assert!(session.ingest("scaffolding <glm_bl").is_empty());
        let rest = format!(
            "ock >{{\"type\":\"tool_call\",\"data\":{{\"metadata\":{{\"id\":\"c\",\"name\":\"f\",\"arguments\":{{}}}}}}}}{}",
            BLOCK_CLOSE
        );
        let events = session.ingest(&rest);
        assert!(matches!(events[0], ToolEvent::Open { .. }));
    }

    #[test]
    fn long_arguments_fragment_at_one_hundred_chars() {
        let mut session = session();
        let long_value = "x".repeat(260);
        let events = session.ingest(&block("call_1", "store", &format!(r#"{{"blob":"{}"}}"#, long_value)));

        let fragments: Vec<&String> = events
            .iter()
            .filter_map(|e| match e {
                ToolEvent::ArgsDelta { fragment, .. } => Some(fragment),
                _ => None,
            })
            .collect();
        assert!(fragments.len() > 1);
        assert!(fragments.iter().all(|f| f.chars().count() <= 100));
        let rebuilt: String = fragments.iter().map(|f| f.as_str()).collect();
        let value: Value = serde_json::from_str(&rebuilt).expect("valid json");
        assert_eq!(value["blob"].as_str().map(str::len), Some(260));
    }

    #[test]
    fn close_all_transitions_and_validates() {
        let mut session = session();
        session.ingest(&block("call_1", "get_weather", r#"{"city":"Beijing"}"#));
        let errors = session.close_all();
        assert!(errors.is_empty());
        assert!(!session.any_active());
        assert_eq!(session.calls()[0].state, ToolCallState::Closed);
        // Closing again is a no-op.
        assert!(session.close_all().is_empty());
    }

    #[test]
    fn corrupted_argument_buffer_reports_tool_error() {
        let mut session = session();
        session.ingest(&block("call_1", "get_weather", r#"{"city":"Beijing"}"#));
        session.calls[0].arguments.push('{');
        let errors = session.close_all();
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            &errors[0],
            ToolEvent::Error { kind, index: 0, .. } if kind == "invalid_json"
        ));
        assert!(session.calls()[0].failed);
    }

    #[test]
    fn stale_open_call_times_out() {
        let mut session = ToolSession::new(Duration::from_millis(0));
        session.ingest(&block("call_1", "slow", r#"{}"#));
        std::thread::sleep(Duration::from_millis(5));
        let events = session.expire_stale();
        assert!(matches!(
            &events[0],
            ToolEvent::Error { kind, .. } if kind == "timeout"
        ));
        assert!(!session.any_active());
    }

    #[test]
    fn missing_id_is_synthesized() {
        let mut session = session();
        let inner = r#"{"type":"tool_call","data":{"metadata":{"name":"f","arguments":{}}}}"#;
        let events = session.ingest(&format!("{}{}{}", BLOCK_OPEN, inner, BLOCK_CLOSE));
        match &events[0] {
            ToolEvent::Open { id, .. } => assert!(id.starts_with("call_")),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn non_tool_call_blocks_are_skipped() {
        let mut session = session();
        let inner = r#"{"type":"citation","data":{"metadata":{"name":"x"}}}"#;
        let events = session.ingest(&format!("{}{}{}", BLOCK_OPEN, inner, BLOCK_CLOSE));
        assert!(events.is_empty());
        assert!(!session.any_active());
    }
}
