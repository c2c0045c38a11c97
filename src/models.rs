use serde::{Deserialize, Serialize};
use serde_json::Value;

// ===== OpenAI Chat Completions dialect =====

#[derive(Debug, Deserialize)]
pub struct OpenAiRequest {
    pub model: String,
    pub messages: Vec<OpenAiMessage>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub tools: Option<Vec<OpenAiTool>>,
    #[serde(default)]
    pub tool_choice: Option<Value>,
    /// Fields this proxy does not interpret are forwarded upstream untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAiMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<OpenAiMessageContent>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum OpenAiMessageContent {
    Text(String),
    Parts(Vec<OpenAiContentPart>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum OpenAiContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: Value },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiTool {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: OpenAiFunctionDef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiFunctionDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: Value,
}

#[derive(Debug, Serialize)]
pub struct OpenAiResponse {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<OpenAiChoice>,
    pub usage: Usage,
}

#[derive(Debug, Serialize)]
pub struct OpenAiChoice {
    pub index: u32,
    pub message: OpenAiChoiceMessage,
    pub finish_reason: String,
}

#[derive(Debug, Serialize)]
pub struct OpenAiChoiceMessage {
    pub role: String,
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenAiToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: OpenAiToolCallFunction,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenAiToolCallFunction {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenAiModelsResponse {
    pub object: String,
    pub data: Vec<OpenAiModel>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenAiModel {
    pub id: String,
    pub object: String,
    pub name: String,
    pub created: u64,
    pub owned_by: String,
}

// ===== Anthropic Messages dialect =====

#[derive(Debug, Deserialize)]
pub struct AnthropicRequest {
    pub model: String,
    pub max_tokens: u32,
    pub messages: Vec<AnthropicMessage>,
    #[serde(default)]
    pub system: Option<AnthropicSystem>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub tools: Option<Vec<AnthropicTool>>,
}

#[derive(Debug, Deserialize)]
pub struct AnthropicMessage {
    pub role: String,
    pub content: AnthropicContent,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum AnthropicContent {
    Text(String),
    Blocks(Vec<AnthropicContentBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum AnthropicContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String, input: Value },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: Value,
        #[serde(default)]
        is_error: Option<bool>,
    },
    #[serde(rename = "thinking")]
    Thinking { thinking: String, signature: String },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum AnthropicSystem {
    Text(String),
    Blocks(Vec<AnthropicSystemBlock>),
}

#[derive(Debug, Deserialize)]
pub struct AnthropicSystemBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AnthropicTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub input_schema: Value,
}

#[derive(Debug, Serialize)]
pub struct AnthropicResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub response_type: String,
    pub role: String,
    pub model: String,
    pub content: Vec<AnthropicOutBlock>,
    pub stop_reason: String,
    pub stop_sequence: Option<String>,
    pub usage: AnthropicUsage,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum AnthropicOutBlock {
    #[serde(rename = "thinking")]
    Thinking { thinking: String, signature: String },
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String, input: Value },
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct AnthropicUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

// ===== Shared usage accounting =====

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn from_upstream(u: UpstreamUsage) -> Self {
        Self {
            prompt_tokens: u.input_tokens,
            completion_tokens: u.output_tokens,
            total_tokens: u.input_tokens + u.output_tokens,
        }
    }

    /// Length-based estimate: ceil(chars / 4) on each side.
    pub fn estimate(prompt_chars: usize, output_chars: usize) -> Self {
        let prompt_tokens = ceil_div4(prompt_chars);
        let completion_tokens = ceil_div4(output_chars);
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

fn ceil_div4(chars: usize) -> u32 {
    ((chars + 3) / 4) as u32
}

// ===== Upstream phased-SSE dialect =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Thinking,
    Answer,
    ToolCall,
    Other,
}

// Unknown phase tags decode to `Other` rather than failing the frame.
impl<'de> Deserialize<'de> for Phase {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let tag = String::deserialize(deserializer)?;
        Ok(match tag.as_str() {
            "thinking" => Phase::Thinking,
            "answer" => Phase::Answer,
            "tool_call" => Phase::ToolCall,
            _ => Phase::Other,
        })
    }
}

/// One decoded SSE event from the upstream: the nested `data` object of a
/// `data:` line.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamFrame {
    #[serde(default = "default_phase")]
    pub phase: Phase,
    #[serde(default)]
    pub delta_content: Option<String>,
    #[serde(default)]
    pub edit_content: Option<String>,
    #[serde(default)]
    pub usage: Option<UpstreamUsage>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub error: Option<UpstreamErrorDetail>,
}

fn default_phase() -> Phase {
    Phase::Other
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct UpstreamUsage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamErrorDetail {
    #[serde(default)]
    pub detail: Option<String>,
}

/// Envelope of each upstream SSE line: `{"data": {...frame...}}`.
#[derive(Debug, Deserialize)]
pub struct UpstreamEnvelope {
    pub data: UpstreamFrame,
}

#[derive(Debug, Serialize)]
pub struct UpstreamChatRequest {
    pub stream: bool,
    pub chat_id: String,
    pub id: String,
    pub model: String,
    pub messages: Vec<UpstreamMessage>,
    pub params: Value,
    pub features: UpstreamFeatures,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<OpenAiTool>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpstreamMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct UpstreamFeatures {
    pub enable_thinking: bool,
}

#[derive(Debug, Deserialize)]
pub struct UpstreamModelsResponse {
    #[serde(default)]
    pub data: Vec<UpstreamModelEntry>,
}

#[derive(Debug, Deserialize)]
pub struct UpstreamModelEntry {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub info: Option<UpstreamModelInfo>,
}

#[derive(Debug, Deserialize)]
pub struct UpstreamModelInfo {
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub created_at: Option<u64>,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_frame_decodes_phases() {
        let env: UpstreamEnvelope = serde_json::from_str(
            r#"{"data":{"phase":"thinking","delta_content":"hm","done":false}}"#,
        )
        .expect("decode");
        assert_eq!(env.data.phase, Phase::Thinking);
        assert_eq!(env.data.delta_content.as_deref(), Some("hm"));
        assert!(!env.data.done);
    }

    #[test]
    fn upstream_frame_unknown_phase_is_other() {
        let env: UpstreamEnvelope =
            serde_json::from_str(r#"{"data":{"phase":"preamble","done":true}}"#).expect("decode");
        assert_eq!(env.data.phase, Phase::Other);
        assert!(env.data.done);
    }

    #[test]
    fn usage_estimate_rounds_up() {
        // ceil, not floor: (chars + 3) / 4
        assert_eq!(Usage::estimate(0, 6).completion_tokens, 2);
        assert_eq!(Usage::estimate(8, 0).prompt_tokens, 2);
        assert_eq!(Usage::estimate(0, 0).total_tokens, 0);
        assert_eq!(Usage::estimate(1, 4).total_tokens, 2);
    }

    #[test]
    fn openai_request_keeps_unknown_fields() {
        let req: OpenAiRequest = serde_json::from_str(
            r#"{"model":"GLM-4.5","messages":[{"role":"user","content":"Hi"}],"frequency_penalty":0.5}"#,
        )
        .expect("decode");
        assert_eq!(
            req.extra.get("frequency_penalty"),
            Some(&serde_json::json!(0.5))
        );
    }

    #[test]
    fn anthropic_request_requires_max_tokens() {
        let err = serde_json::from_str::<AnthropicRequest>(
            r#"{"model":"claude-3-opus-20240229","messages":[]}"#,
        );
        assert!(err.is_err());
    }
}
