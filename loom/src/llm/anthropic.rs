//! Anthropic Messages API adapter: hand-rolled reqwest + SSE streaming
//! (no official Anthropic SDK in the pack's dependency stack, so this
//! follows the same request/response/event shapes as the pack's other
//! reqwest-based providers).

use std::sync::Arc;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::AgentError;
use crate::message::{Content, Message, Part, ToolCall};
use crate::stream::ModelChunk;
use crate::tools::ToolSpec;

use super::{CancelToken, ChatModel, ChatModelResponse, LlmUsage, ToolCallDelta, ToolChoiceMode};

const API_BASE: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic Claude adapter. `bind_tools`/`with_structured_output` return a
/// new instance with `tools`/`tool_choice`/`response_schema` set; `self`
/// is never mutated, so a cached instance stays safe to share (spec.md §3).
#[derive(Clone)]
pub struct ChatAnthropic {
    client: reqwest::Client,
    api_key: String,
    model: String,
    temperature: Option<f32>,
    max_tokens: u32,
    tools: Vec<ToolSpec>,
    tool_choice: ToolChoiceMode,
    response_schema: Option<serde_json::Value>,
}

impl ChatAnthropic {
    pub fn new(model: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            tools: Vec::new(),
            tool_choice: ToolChoiceMode::Auto,
            response_schema: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Accumulates every `Message::System` in order, joined with a
    /// blank-line separator, into the single `system` field the Messages
    /// API takes (spec.md §4.1).
    fn collect_system(messages: &[Message]) -> Option<String> {
        let parts: Vec<String> = messages
            .iter()
            .filter_map(|m| match m {
                Message::System { content } => Some(content.to_text()),
                _ => None,
            })
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }

    fn to_anthropic_messages(&self, messages: &[Message]) -> Vec<AnthropicMessage> {
        let mut out = Vec::new();
        for msg in messages {
            match msg {
                Message::System { .. } => continue,
                Message::Human { content } => {
                    out.push(AnthropicMessage { role: "user".into(), content: content_to_anthropic(content) });
                }
                Message::Ai { content, tool_calls } => {
                    let mut blocks = Vec::new();
                    if !content.is_empty() {
                        blocks.push(AnthropicContentBlock::Text { text: content.to_text() });
                    }
                    for call in tool_calls {
                        blocks.push(AnthropicContentBlock::ToolUse {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            input: call.args.clone(),
                        });
                    }
                    if !blocks.is_empty() {
                        out.push(AnthropicMessage { role: "assistant".into(), content: AnthropicContent::Blocks(blocks) });
                    }
                }
                Message::Tool { content, tool_call_id, .. } => {
                    out.push(AnthropicMessage {
                        role: "user".into(),
                        content: AnthropicContent::Blocks(vec![AnthropicContentBlock::ToolResult {
                            tool_use_id: tool_call_id.clone(),
                            content: content.to_text(),
                            is_error: Some(false),
                        }]),
                    });
                }
            }
        }
        out
    }

    fn anthropic_tools(&self) -> Option<Vec<AnthropicTool>> {
        if self.tools.is_empty() {
            return None;
        }
        Some(
            self.tools
                .iter()
                .map(|t| AnthropicTool { name: t.name.clone(), description: Some(t.description.clone()), input_schema: t.schema.clone() })
                .collect(),
        )
    }

    fn tool_choice_body(&self) -> Option<AnthropicToolChoice> {
        if self.tools.is_empty() {
            return None;
        }
        Some(match self.tool_choice {
            ToolChoiceMode::Auto => AnthropicToolChoice::Auto,
            ToolChoiceMode::None => return None,
            ToolChoiceMode::Required => AnthropicToolChoice::Any,
        })
    }

    fn build_request(&self, messages: &[Message], stream: bool) -> CreateMessageRequest {
        let system = Self::collect_system(messages);
        CreateMessageRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            messages: self.to_anthropic_messages(messages),
            system,
            temperature: self.temperature,
            stream,
            tools: self.anthropic_tools(),
            tool_choice: self.tool_choice_body(),
        }
    }

    async fn send(&self, body: &CreateMessageRequest) -> Result<reqwest::Response, AgentError> {
        let resp = self
            .client
            .post(format!("{API_BASE}/messages"))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| AgentError::ModelTransport(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(AgentError::ModelTransport(format!("anthropic http {status}: {text}")));
        }
        Ok(resp)
    }
}

#[async_trait]
impl ChatModel for ChatAnthropic {
    async fn invoke(&self, messages: &[Message]) -> Result<ChatModelResponse, AgentError> {
        let body = self.build_request(messages, false);
        let resp = self.send(&body).await?;
        let parsed: CreateMessageResponse =
            resp.json().await.map_err(|e| AgentError::ModelTransport(e.to_string()))?;

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for block in parsed.content {
            match block {
                AnthropicContentBlock::Text { text } => content.push_str(&text),
                AnthropicContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall { id, name, args: input }),
                _ => {}
            }
        }

        Ok(ChatModelResponse {
            content,
            reasoning: None,
            tool_calls,
            usage: Some(LlmUsage {
                input_tokens: parsed.usage.input_tokens,
                output_tokens: parsed.usage.output_tokens,
                total_tokens: parsed.usage.input_tokens + parsed.usage.output_tokens,
            }),
        })
    }

    async fn stream(
        &self,
        messages: &[Message],
        chunk_tx: Option<mpsc::Sender<ModelChunk>>,
        tool_delta_tx: Option<mpsc::Sender<ToolCallDelta>>,
        cancel: &CancelToken,
    ) -> Result<ChatModelResponse, AgentError> {
        let body = self.build_request(messages, true);
        let resp = self.send(&body).await?;
        let mut events = resp.bytes_stream().eventsource();

        let mut content = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        let mut current_tool: Option<(String, String, usize, String)> = None;
        let mut usage = LlmUsage::default();
        let mut block_index = 0usize;

        while let Some(event) = events.next().await {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            let event = match event {
                Ok(e) => e,
                Err(e) => return Err(AgentError::ModelTransport(format!("anthropic stream error: {e}"))),
            };
            if event.event == "message_stop" || event.data.trim().is_empty() {
                if event.event == "message_stop" {
                    break;
                }
                continue;
            }
            match event.event.as_str() {
                "message_start" => {
                    if let Ok(start) = serde_json::from_str::<MessageStart>(&event.data) {
                        usage.input_tokens = start.message.usage.input_tokens;
                    }
                }
                "content_block_start" => {
                    if let Ok(start) = serde_json::from_str::<ContentBlockStart>(&event.data) {
                        block_index = start.index;
                        if let AnthropicContentBlock::ToolUse { id, name, .. } = start.content_block {
                            current_tool = Some((id, name, block_index, String::new()));
                        }
                    }
                }
                "content_block_delta" => {
                    if let Ok(delta) = serde_json::from_str::<ContentBlockDelta>(&event.data) {
                        match delta.delta {
                            ContentDelta::TextDelta { text } => {
                                content.push_str(&text);
                                if let Some(tx) = &chunk_tx {
                                    let _ = tx.send(ModelChunk { content: Some(text), reasoning: None }).await;
                                }
                            }
                            ContentDelta::ThinkingDelta { thinking } => {
                                if let Some(tx) = &chunk_tx {
                                    let _ = tx.send(ModelChunk { content: None, reasoning: Some(thinking) }).await;
                                }
                            }
                            ContentDelta::InputJsonDelta { partial_json } => {
                                if let Some((id, name, idx, buf)) = &mut current_tool {
                                    if let Some(tx) = &tool_delta_tx {
                                        let _ = tx
                                            .send(ToolCallDelta {
                                                index: *idx,
                                                call_id: Some(id.clone()),
                                                name: Some(name.clone()),
                                                arguments_delta: partial_json.clone(),
                                            })
                                            .await;
                                    }
                                    buf.push_str(&partial_json);
                                }
                            }
                        }
                    }
                }
                "content_block_stop" => {
                    // Arguments are parsed exactly once here, from the fragments
                    // accumulated for this block's index (spec.md §4.1).
                    if let Some((id, name, _, buf)) = current_tool.take() {
                        let args = if buf.is_empty() {
                            serde_json::json!({})
                        } else {
                            serde_json::from_str(&buf).unwrap_or(serde_json::json!({}))
                        };
                        tool_calls.push(ToolCall { id, name, args });
                    }
                }
                "message_delta" => {
                    if let Ok(delta) = serde_json::from_str::<MessageDelta>(&event.data) {
                        if let Some(u) = delta.usage {
                            usage.output_tokens = u.output_tokens;
                        }
                    }
                }
                other => warn!(event = other, "unhandled anthropic stream event"),
            }
        }

        usage.total_tokens = usage.input_tokens + usage.output_tokens;
        Ok(ChatModelResponse { content, reasoning: None, tool_calls, usage: Some(usage) })
    }

    fn bind_tools(&self, tools: Vec<ToolSpec>, choice: ToolChoiceMode) -> Box<dyn ChatModel> {
        Box::new(Self { tools, tool_choice: choice, ..self.clone() })
    }

    fn with_structured_output(&self, schema: serde_json::Value) -> Box<dyn ChatModel> {
        Box::new(Self { response_schema: Some(schema), ..self.clone() })
    }
}

fn content_to_anthropic(content: &Content) -> AnthropicContent {
    match content {
        Content::Text(s) => AnthropicContent::Text(s.clone()),
        Content::Parts(parts) => AnthropicContent::Blocks(
            parts
                .iter()
                .map(|p| match p {
                    Part::Text { text } => AnthropicContentBlock::Text { text: text.clone() },
                    Part::Image { image_base64, media_type } => AnthropicContentBlock::Image {
                        source: ImageSource { source_type: "base64".into(), media_type: media_type.clone(), data: image_base64.clone() },
                    },
                })
                .collect(),
        ),
    }
}

// ============================== API types ==============================

#[derive(Debug, Serialize)]
struct CreateMessageRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<AnthropicToolChoice>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct AnthropicMessage {
    role: String,
    content: AnthropicContent,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
enum AnthropicContent {
    Text(String),
    Blocks(Vec<AnthropicContentBlock>),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type")]
enum AnthropicContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image { source: ImageSource },
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String, input: serde_json::Value },
    #[serde(rename = "tool_result")]
    ToolResult { tool_use_id: String, content: String, #[serde(skip_serializing_if = "Option::is_none")] is_error: Option<bool> },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct ImageSource {
    #[serde(rename = "type")]
    source_type: String,
    media_type: String,
    data: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct AnthropicTool {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    input_schema: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicToolChoice {
    Auto,
    Any,
}

#[derive(Debug, Deserialize)]
struct CreateMessageResponse {
    content: Vec<AnthropicContentBlock>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize, Clone)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct MessageStart {
    message: MessageStartContent,
}

#[derive(Debug, Deserialize)]
struct MessageStartContent {
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct ContentBlockStart {
    index: usize,
    content_block: AnthropicContentBlock,
}

#[derive(Debug, Deserialize)]
struct ContentBlockDelta {
    #[allow(dead_code)]
    index: usize,
    delta: ContentDelta,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentDelta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "thinking_delta")]
    ThinkingDelta { thinking: String },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    usage: Option<AnthropicUsageDelta>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsageDelta {
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_system_extracts_leading_system_message() {
        let messages = vec![Message::system("be terse"), Message::human("hi")];
        let system = ChatAnthropic::collect_system(&messages);
        assert_eq!(system.as_deref(), Some("be terse"));
    }

    #[test]
    fn collect_system_joins_multiple_system_messages_with_blank_line() {
        let messages = vec![Message::system("be terse"), Message::system("never curse"), Message::human("hi")];
        let system = ChatAnthropic::collect_system(&messages);
        assert_eq!(system.as_deref(), Some("be terse\n\nnever curse"));
    }

    #[test]
    fn bind_tools_does_not_mutate_receiver() {
        let base = ChatAnthropic::new("claude-sonnet-4-5-20250929", "key");
        let spec = ToolSpec { name: "echo".into(), description: "d".into(), schema: serde_json::json!({}) };
        let _bound = base.bind_tools(vec![spec], ToolChoiceMode::Required);
        assert!(base.tools.is_empty());
        assert_eq!(base.tool_choice, ToolChoiceMode::Auto);
    }
}
