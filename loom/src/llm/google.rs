//! Gemini `generateContent`/`streamGenerateContent` adapter: hand-rolled
//! reqwest + SSE, mirroring the request/response shapes the Anthropic
//! adapter uses for its own hand-rolled client.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::AgentError;
use crate::message::{Message, ToolCall};
use crate::stream::ModelChunk;
use crate::tools::ToolSpec;

use super::{CancelToken, ChatModel, ChatModelResponse, LlmUsage, ToolCallDelta, ToolChoiceMode};

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Gemini adapter. Function-call ids are synthesized locally (Gemini's
/// wire format doesn't assign one) and kept in an internal counter shared
/// by clones, since both the original and any `bind_tools`/
/// `with_structured_output` copy must hand out distinct ids.
#[derive(Clone)]
pub struct ChatGoogle {
    client: reqwest::Client,
    api_key: String,
    model: String,
    temperature: Option<f32>,
    tools: Vec<ToolSpec>,
    tool_choice: ToolChoiceMode,
    response_schema: Option<serde_json::Value>,
    call_counter: Arc<AtomicU64>,
}

impl ChatGoogle {
    pub fn new(model: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: None,
            tools: Vec::new(),
            tool_choice: ToolChoiceMode::Auto,
            response_schema: None,
            call_counter: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    fn next_call_id(&self) -> String {
        format!("gemini_call_{}", self.call_counter.fetch_add(1, Ordering::SeqCst))
    }

    /// Accumulates every `Message::System` in order, joined with a
    /// blank-line separator, into the single `systemInstruction` field
    /// Gemini takes (spec.md §4.1).
    fn collect_system(messages: &[Message]) -> Option<GeminiContent> {
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
            Some(GeminiContent { role: None, parts: vec![GeminiPart { text: Some(parts.join("\n\n")), ..Default::default() }] })
        }
    }

    fn to_contents(&self, messages: &[Message]) -> Vec<GeminiContent> {
        let mut out = Vec::new();
        for m in messages {
            match m {
                Message::System { .. } => continue,
                Message::Human { content } => {
                    out.push(GeminiContent { role: Some("user".into()), parts: vec![GeminiPart { text: Some(content.to_text()), ..Default::default() }] });
                }
                Message::Ai { content, tool_calls } => {
                    let mut parts = Vec::new();
                    if !content.is_empty() {
                        parts.push(GeminiPart { text: Some(content.to_text()), ..Default::default() });
                    }
                    for call in tool_calls {
                        parts.push(GeminiPart {
                            function_call: Some(GeminiFunctionCall { name: call.name.clone(), args: call.args.clone() }),
                            ..Default::default()
                        });
                    }
                    out.push(GeminiContent { role: Some("model".into()), parts });
                }
                Message::Tool { content, name, .. } => {
                    let response = serde_json::from_str(&content.to_text()).unwrap_or_else(|_| serde_json::json!({ "result": content.to_text() }));
                    out.push(GeminiContent {
                        role: Some("user".into()),
                        parts: vec![GeminiPart { function_response: Some(GeminiFunctionResponse { name: name.clone(), response }), ..Default::default() }],
                    });
                }
            }
        }
        out
    }

    fn gemini_tools(&self) -> Option<Vec<GeminiTool>> {
        if self.tools.is_empty() {
            return None;
        }
        Some(vec![GeminiTool {
            function_declarations: self
                .tools
                .iter()
                .map(|t| GeminiFunctionDeclaration { name: t.name.clone(), description: Some(t.description.clone()), parameters: t.schema.clone() })
                .collect(),
        }])
    }

    fn tool_config(&self) -> Option<GeminiToolConfig> {
        if self.tools.is_empty() {
            return None;
        }
        let mode = match self.tool_choice {
            ToolChoiceMode::Auto => "AUTO",
            ToolChoiceMode::None => "NONE",
            ToolChoiceMode::Required => "ANY",
        };
        Some(GeminiToolConfig { function_calling_config: Some(GeminiFunctionCallingConfig { mode: mode.into() }) })
    }

    fn build_request(&self, messages: &[Message]) -> GenerateContentRequest {
        let system_instruction = Self::collect_system(messages);
        GenerateContentRequest {
            contents: self.to_contents(messages),
            tools: self.gemini_tools(),
            system_instruction,
            generation_config: Some(GeminiGenerationConfig {
                temperature: self.temperature,
                response_mime_type: self.response_schema.as_ref().map(|_| "application/json".to_string()),
                response_schema: self.response_schema.clone(),
            }),
            tool_config: self.tool_config(),
        }
    }

    fn parse_parts(&self, parts: Vec<GeminiPart>) -> (String, Vec<ToolCall>) {
        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for part in parts {
            if let Some(text) = part.text {
                content.push_str(&text);
            }
            if let Some(call) = part.function_call {
                tool_calls.push(ToolCall { id: self.next_call_id(), name: call.name, args: call.args });
            }
        }
        (content, tool_calls)
    }
}

#[async_trait]
impl ChatModel for ChatGoogle {
    async fn invoke(&self, messages: &[Message]) -> Result<ChatModelResponse, AgentError> {
        let body = self.build_request(messages);
        let resp = self
            .client
            .post(format!("{API_BASE}/models/{}:generateContent", self.model))
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::ModelTransport(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(AgentError::ModelTransport(format!("gemini http {status}: {text}")));
        }

        let parsed: GenerateContentResponse = resp.json().await.map_err(|e| AgentError::ModelTransport(e.to_string()))?;
        let candidate = parsed.candidates.unwrap_or_default().into_iter().next();
        let (content, tool_calls) = candidate.and_then(|c| c.content).map(|c| self.parse_parts(c.parts)).unwrap_or_default();

        let usage = parsed.usage_metadata.map(|u| LlmUsage {
            input_tokens: u.prompt_token_count.unwrap_or(0),
            output_tokens: u.candidates_token_count.unwrap_or(0),
            total_tokens: u.prompt_token_count.unwrap_or(0) + u.candidates_token_count.unwrap_or(0),
        });

        Ok(ChatModelResponse { content, reasoning: None, tool_calls, usage })
    }

    async fn stream(
        &self,
        messages: &[Message],
        chunk_tx: Option<mpsc::Sender<ModelChunk>>,
        tool_delta_tx: Option<mpsc::Sender<ToolCallDelta>>,
        cancel: &CancelToken,
    ) -> Result<ChatModelResponse, AgentError> {
        let body = self.build_request(messages);
        let resp = self
            .client
            .post(format!("{API_BASE}/models/{}:streamGenerateContent?alt=sse", self.model))
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::ModelTransport(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(AgentError::ModelTransport(format!("gemini http {status}: {text}")));
        }

        let mut events = resp.bytes_stream().eventsource();
        let mut content = String::new();
        let tool_calls: Mutex<Vec<ToolCall>> = Mutex::new(Vec::new());
        let mut usage: Option<LlmUsage> = None;
        let mut delta_index = 0usize;

        while let Some(event) = events.next().await {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            let event = match event {
                Ok(e) => e,
                Err(e) => return Err(AgentError::ModelTransport(format!("gemini stream error: {e}"))),
            };
            if event.data.trim().is_empty() || event.data == "[DONE]" {
                continue;
            }
            let parsed: GenerateContentResponse =
                serde_json::from_str(&event.data).map_err(|e| AgentError::ModelTransport(format!("gemini parse error: {e}")))?;

            if let Some(u) = parsed.usage_metadata {
                usage = Some(LlmUsage {
                    input_tokens: u.prompt_token_count.unwrap_or(0),
                    output_tokens: u.candidates_token_count.unwrap_or(0),
                    total_tokens: u.prompt_token_count.unwrap_or(0) + u.candidates_token_count.unwrap_or(0),
                });
            }
            if let Some(candidate) = parsed.candidates.unwrap_or_default().into_iter().next() {
                if let Some(c) = candidate.content {
                    let (delta_text, new_calls) = self.parse_parts(c.parts);
                    if !delta_text.is_empty() {
                        content.push_str(&delta_text);
                        if let Some(tx) = &chunk_tx {
                            let _ = tx.send(ModelChunk { content: Some(delta_text), reasoning: None }).await;
                        }
                    }
                    for call in new_calls {
                        if let Some(tx) = &tool_delta_tx {
                            let _ = tx
                                .send(ToolCallDelta {
                                    index: delta_index,
                                    call_id: Some(call.id.clone()),
                                    name: Some(call.name.clone()),
                                    arguments_delta: call.args.to_string(),
                                })
                                .await;
                        }
                        delta_index += 1;
                        tool_calls.lock().expect("tool_calls mutex poisoned").push(call);
                    }
                }
            }
        }

        usage = usage.or(Some(LlmUsage::default()));
        Ok(ChatModelResponse {
            content,
            reasoning: None,
            tool_calls: tool_calls.into_inner().expect("tool_calls mutex poisoned"),
            usage,
        })
    }

    fn bind_tools(&self, tools: Vec<ToolSpec>, choice: ToolChoiceMode) -> Box<dyn ChatModel> {
        Box::new(Self { tools, tool_choice: choice, ..self.clone() })
    }

    fn with_structured_output(&self, schema: serde_json::Value) -> Box<dyn ChatModel> {
        Box::new(Self { response_schema: Some(schema), ..self.clone() })
    }
}

// ============================== API types ==============================

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<GeminiTool>>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
    #[serde(rename = "toolConfig", skip_serializing_if = "Option::is_none")]
    tool_config: Option<GeminiToolConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
struct GeminiPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(rename = "functionCall", skip_serializing_if = "Option::is_none")]
    function_call: Option<GeminiFunctionCall>,
    #[serde(rename = "functionResponse", skip_serializing_if = "Option::is_none")]
    function_response: Option<GeminiFunctionResponse>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct GeminiFunctionCall {
    name: String,
    #[serde(default)]
    args: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct GeminiFunctionResponse {
    name: String,
    response: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct GeminiTool {
    #[serde(rename = "functionDeclarations")]
    function_declarations: Vec<GeminiFunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct GeminiFunctionDeclaration {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct GeminiToolConfig {
    #[serde(rename = "functionCallingConfig", skip_serializing_if = "Option::is_none")]
    function_calling_config: Option<GeminiFunctionCallingConfig>,
}

#[derive(Debug, Serialize)]
struct GeminiFunctionCallingConfig {
    mode: String,
}

#[derive(Debug, Serialize)]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(rename = "responseMimeType", skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
    #[serde(rename = "responseSchema", skip_serializing_if = "Option::is_none")]
    response_schema: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Option<Vec<GeminiCandidate>>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize, Clone)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize, Clone)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: Option<u32>,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_system_extracts_leading_system_message() {
        let messages = vec![Message::system("be terse"), Message::human("hi")];
        let system = ChatGoogle::collect_system(&messages);
        assert!(system.is_some());
    }

    #[test]
    fn collect_system_joins_multiple_system_messages_with_blank_line() {
        let messages = vec![Message::system("be terse"), Message::system("never curse"), Message::human("hi")];
        let system = ChatGoogle::collect_system(&messages).unwrap();
        assert_eq!(system.parts[0].text.as_deref(), Some("be terse\n\nnever curse"));
    }

    #[test]
    fn call_ids_are_unique_across_clones() {
        let base = ChatGoogle::new("gemini-3-flash-preview", "key");
        let clone = base.clone();
        let id1 = base.next_call_id();
        let id2 = clone.next_call_id();
        assert_ne!(id1, id2);
    }
}
