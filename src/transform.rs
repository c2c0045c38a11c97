use chrono::Local;
use serde_json::Value;

use crate::config::Config;
use crate::error::AppError;
use crate::models::{
    AnthropicContent, AnthropicContentBlock, AnthropicRequest, AnthropicSystem, OpenAiFunctionDef,
    OpenAiMessageContent, OpenAiRequest, OpenAiTool, UpstreamChatRequest, UpstreamFeatures,
    UpstreamMessage,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    OpenAi,
    Anthropic,
}

/// Dialect-neutral request form: what both inbound dialects normalize into
/// before the upstream call is built.
#[derive(Debug)]
pub struct CommonRequest {
    pub model: String,
    pub requested_model: String,
    pub messages: Vec<UpstreamMessage>,
    pub stream: bool,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub tools: Option<Vec<OpenAiTool>>,
    pub tool_choice: Option<Value>,
    pub extra: serde_json::Map<String, Value>,
}

impl CommonRequest {
    pub fn prompt_chars(&self) -> usize {
        self.messages.iter().map(|m| m.content.chars().count()).sum()
    }
}

pub fn openai_to_common(req: OpenAiRequest, config: &Config) -> Result<CommonRequest, AppError> {
    let mut messages = Vec::with_capacity(req.messages.len());
    for msg in req.messages {
        let content = flatten_openai_content(msg.content);
        if msg.role == "tool" {
            let id = msg.tool_call_id.unwrap_or_default();
            messages.push(UpstreamMessage {
                role: "user".to_string(),
                content: format!("Tool result ({}): {}", id, content),
            });
        } else if matches!(msg.role.as_str(), "system" | "user" | "assistant") {
            messages.push(UpstreamMessage {
                role: msg.role,
                content,
            });
        } else {
            return Err(AppError::invalid_request(format!(
                "messages: unexpected role \"{}\"",
                msg.role
            )));
        }
    }

    let mut common = CommonRequest {
        model: req.model.clone(),
        requested_model: req.model,
        messages,
        stream: req.stream.unwrap_or(false),
        temperature: req.temperature,
        top_p: req.top_p,
        max_tokens: req.max_tokens,
        tools: req.tools,
        tool_choice: req.tool_choice,
        extra: req.extra,
    };
    normalize(&mut common, Dialect::OpenAi, config);
    Ok(common)
}

pub fn anthropic_to_common(
    req: AnthropicRequest,
    config: &Config,
) -> Result<CommonRequest, AppError> {
    let mut messages = Vec::with_capacity(req.messages.len() + 1);

    if let Some(system) = req.system {
        let text = extract_system_text(system)?;
        if !text.is_empty() {
            messages.push(UpstreamMessage {
                role: "system".to_string(),
                content: text,
            });
        }
    }

    for msg in req.messages {
        if msg.role != "user" && msg.role != "assistant" {
            return Err(AppError::invalid_request(format!(
                "messages: unexpected role \"{}\"",
                msg.role
            )));
        }
        messages.push(UpstreamMessage {
            role: msg.role,
            content: flatten_anthropic_content(msg.content)?,
        });
    }

    let tools = req.tools.map(|tools| {
        tools
            .into_iter()
            .map(|tool| OpenAiTool {
                tool_type: "function".to_string(),
                function: OpenAiFunctionDef {
                    name: tool.name,
                    description: tool.description,
                    // The schema Value crosses untouched so the declaration
                    // echo stays byte-identical.
                    parameters: tool.input_schema,
                },
            })
            .collect()
    });

    let mut common = CommonRequest {
        model: req.model.clone(),
        requested_model: req.model,
        messages,
        stream: req.stream.unwrap_or(false),
        temperature: req.temperature,
        top_p: req.top_p,
        max_tokens: Some(req.max_tokens),
        tools,
        tool_choice: None,
        extra: serde_json::Map::new(),
    };
    normalize(&mut common, Dialect::Anthropic, config);
    Ok(common)
}

/// The normalization pipeline; order matters.
fn normalize(common: &mut CommonRequest, dialect: Dialect, config: &Config) {
    coerce_system_messages(&mut common.messages);
    for msg in &mut common.messages {
        msg.content = expand_placeholders(&msg.content, config);
    }
    common.model = map_model(&common.model, dialect, config);
}

/// Concatenated system messages become a `[SYSTEM]` preamble on the first
/// user message; originals are removed.
fn coerce_system_messages(messages: &mut Vec<UpstreamMessage>) {
    let mut system_text = String::new();
    messages.retain(|msg| {
        if msg.role == "system" {
            if !system_text.is_empty() {
                system_text.push('\n');
            }
            system_text.push_str(&msg.content);
            false
        } else {
            true
        }
    });
    if system_text.is_empty() {
        return;
    }

    let preamble = format!("[SYSTEM] {}\n\n[USER PROMPT FOLLOWS]\n", system_text);
    match messages.iter_mut().find(|m| m.role == "user") {
        Some(first_user) => {
            first_user.content = format!("{}{}", preamble, first_user.content);
        }
        None => {
            messages.insert(
                0,
                UpstreamMessage {
                    role: "user".to_string(),
                    content: preamble,
                },
            );
        }
    }
}

/// Expand `{{…}}` dynamic variables from the wall clock and configured user
/// fields. Placeholders we do not know stay literal.
fn expand_placeholders(content: &str, config: &Config) -> String {
    if !content.contains("{{") {
        return content.to_string();
    }
    let now = Local::now();
    content
        .replace("{{DATE}}", &now.format("%Y-%m-%d").to_string())
        .replace("{{TIME}}", &now.format("%H:%M:%S").to_string())
        .replace("{{DAY}}", &now.format("%A").to_string())
        .replace("{{USER_NAME}}", &config.user.name)
        .replace("{{USER_LOCATION}}", &config.user.location)
        .replace("{{USER_LANG}}", &config.user.language)
        .replace("{{TZ}}", &config.user.timezone)
}

fn map_model(model: &str, dialect: Dialect, config: &Config) -> String {
    match dialect {
        Dialect::OpenAi => {
            if model.starts_with("claude-") {
                config.upstream.default_model.clone()
            } else {
                model.to_string()
            }
        }
        Dialect::Anthropic => {
            if !model.starts_with("claude-") {
                tracing::warn!(model, "unknown model on messages endpoint, using default");
            }
            config.upstream.default_model.clone()
        }
    }
}

fn flatten_openai_content(content: Option<OpenAiMessageContent>) -> String {
    match content {
        None => String::new(),
        Some(OpenAiMessageContent::Text(text)) => text,
        Some(OpenAiMessageContent::Parts(parts)) => {
            let mut out = String::new();
            for part in parts {
                match part {
                    crate::models::OpenAiContentPart::Text { text } => out.push_str(&text),
                    crate::models::OpenAiContentPart::ImageUrl { .. } => {
                        tracing::debug!("dropping image content part");
                    }
                }
            }
            out
        }
    }
}

fn flatten_anthropic_content(content: AnthropicContent) -> Result<String, AppError> {
    match content {
        AnthropicContent::Text(text) => Ok(text),
        AnthropicContent::Blocks(blocks) => {
            let mut out = String::new();
            for block in blocks {
                match block {
                    AnthropicContentBlock::Text { text } => out.push_str(&text),
                    AnthropicContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => {
                        let text = match content {
                            Value::String(s) => s,
                            other => serde_json::to_string(&other).map_err(|e| {
                                AppError::invalid_request(format!(
                                    "tool_result content invalid: {}",
                                    e
                                ))
                            })?,
                        };
                        if !out.is_empty() {
                            out.push('\n');
                        }
                        out.push_str(&format!("Tool result ({}): {}", tool_use_id, text));
                    }
                    // Assistant-side echoes carry no prompt content upstream.
                    AnthropicContentBlock::ToolUse { .. }
                    | AnthropicContentBlock::Thinking { .. } => {}
                }
            }
            Ok(out)
        }
    }
}

fn extract_system_text(system: AnthropicSystem) -> Result<String, AppError> {
    match system {
        AnthropicSystem::Text(text) => Ok(text),
        AnthropicSystem::Blocks(blocks) => {
            let mut out = String::new();
            for block in blocks {
                if block.block_type != "text" {
                    return Err(AppError::invalid_request(format!(
                        "system block type not supported: {}",
                        block.block_type
                    )));
                }
                out.push_str(&block.text.unwrap_or_default());
            }
            Ok(out)
        }
    }
}

/// Build the upstream call from the normalized form.
pub fn to_upstream(common: &CommonRequest, chat_id: String, msg_id: String) -> UpstreamChatRequest {
    UpstreamChatRequest {
        stream: true,
        chat_id,
        id: msg_id,
        model: common.model.clone(),
        messages: common.messages.clone(),
        params: Value::Object(Default::default()),
        features: UpstreamFeatures {
            enable_thinking: true,
        },
        temperature: common.temperature,
        top_p: common.top_p,
        max_tokens: common.max_tokens,
        tools: common.tools.clone(),
        extra: common.extra.clone(),
    }
}
