//! OpenAI-compatible Chat Completions adapter built on `async_openai`.
//!
//! Also backs any OpenAI-wire-protocol-compatible provider via
//! `OpenAIConfig::with_api_base` (local proxies, self-hosted gateways).

use std::collections::HashMap;

use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionMessageToolCalls, ChatCompletionRequestAssistantMessageArgs,
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
        ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessage,
        ChatCompletionTool, ChatCompletionToolChoiceOption, ChatCompletionTools,
        CreateChatCompletionRequestArgs, FunctionObject, ToolChoiceOptions,
    },
    Client,
};
use async_trait::async_trait;
use tokio_stream::StreamExt;
use tracing::debug;

use crate::error::AgentError;
use crate::message::{Message, ToolCall};
use crate::stream::ModelChunk;
use crate::tools::ToolSpec;

use super::{CancelToken, ChatModel, ChatModelResponse, LlmUsage, ToolCallDelta, ToolChoiceMode};

/// `ChatOpenAI`: tools/temperature/tool_choice/response_schema are set via
/// `bind_tools`/`with_structured_output`, each returning a new instance.
#[derive(Clone)]
pub struct ChatOpenAI {
    client: Client<OpenAIConfig>,
    model: String,
    tools: Vec<ToolSpec>,
    temperature: Option<f32>,
    tool_choice: ToolChoiceMode,
    response_schema: Option<serde_json::Value>,
}

impl ChatOpenAI {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            model: model.into(),
            tools: Vec::new(),
            temperature: None,
            tool_choice: ToolChoiceMode::Auto,
            response_schema: None,
        }
    }

    pub fn with_config(config: OpenAIConfig, model: impl Into<String>) -> Self {
        Self { client: Client::with_config(config), ..Self::new(model) }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    fn to_request_messages(messages: &[Message]) -> Result<Vec<ChatCompletionRequestMessage>, AgentError> {
        let mut out = Vec::with_capacity(messages.len());
        for m in messages {
            let converted = match m {
                Message::System { content } => {
                    ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage::from(content.to_text().as_str()))
                }
                Message::Human { content } => {
                    ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage::from(content.to_text().as_str()))
                }
                Message::Ai { content, tool_calls } => {
                    let mut builder = ChatCompletionRequestAssistantMessageArgs::default();
                    if !content.is_empty() {
                        builder.content(content.to_text());
                    }
                    if !tool_calls.is_empty() {
                        builder.tool_calls(
                            tool_calls
                                .iter()
                                .map(|tc| async_openai::types::chat::ChatCompletionMessageToolCallsArgs::default()
                                    .id(tc.id.clone())
                                    .function(async_openai::types::chat::FunctionCall {
                                        name: tc.name.clone(),
                                        arguments: tc.args.to_string(),
                                    })
                                    .build()
                                    .map(ChatCompletionMessageToolCalls::Function))
                                .collect::<Result<Vec<_>, _>>()
                                .map_err(|e| AgentError::Other(e.to_string()))?,
                        );
                    }
                    ChatCompletionRequestMessage::Assistant(
                        builder.build().map_err(|e| AgentError::Other(e.to_string()))?,
                    )
                }
                Message::Tool { content, tool_call_id, .. } => ChatCompletionRequestMessage::Tool(
                    ChatCompletionRequestToolMessageArgs::default()
                        .tool_call_id(tool_call_id.clone())
                        .content(content.to_text())
                        .build()
                        .map_err(|e| AgentError::Other(e.to_string()))?,
                ),
            };
            out.push(converted);
        }
        Ok(out)
    }

    fn chat_tools(&self) -> Option<Vec<ChatCompletionTools>> {
        if self.tools.is_empty() {
            return None;
        }
        Some(
            self.tools
                .iter()
                .map(|t| {
                    ChatCompletionTools::Function(ChatCompletionTool {
                        function: FunctionObject {
                            name: t.name.clone(),
                            description: Some(t.description.clone()),
                            parameters: Some(t.schema.clone()),
                            ..Default::default()
                        },
                    })
                })
                .collect(),
        )
    }

    fn tool_choice_option(&self) -> ToolChoiceOptions {
        match self.tool_choice {
            ToolChoiceMode::Auto => ToolChoiceOptions::Auto,
            ToolChoiceMode::None => ToolChoiceOptions::None,
            ToolChoiceMode::Required => ToolChoiceOptions::Required,
        }
    }

    fn build_args(&self, messages: &[Message], stream: bool) -> Result<CreateChatCompletionRequestArgs, AgentError> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(self.model.clone());
        args.messages(Self::to_request_messages(messages)?);
        args.stream(stream);
        if let Some(tools) = self.chat_tools() {
            args.tools(tools);
            args.tool_choice(ChatCompletionToolChoiceOption::Mode(self.tool_choice_option()));
        }
        if let Some(t) = self.temperature {
            args.temperature(t);
        }
        if let Some(schema) = &self.response_schema {
            args.response_format(async_openai::types::chat::ResponseFormat::JsonSchema {
                json_schema: async_openai::types::chat::ResponseFormatJsonSchema {
                    description: None,
                    name: "structured_output".into(),
                    schema: Some(schema.clone()),
                    strict: Some(false),
                },
            });
        }
        Ok(args)
    }
}

#[async_trait]
impl ChatModel for ChatOpenAI {
    async fn invoke(&self, messages: &[Message]) -> Result<ChatModelResponse, AgentError> {
        let request = self
            .build_args(messages, false)?
            .build()
            .map_err(|e| AgentError::Other(format!("openai request build failed: {e}")))?;

        debug!(model = %self.model, message_count = messages.len(), "openai chat create");
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| AgentError::ModelTransport(e.to_string()))?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::ModelTransport("openai returned no choices".into()))?;
        let msg = choice.message;
        let content = msg.content.unwrap_or_default();
        let tool_calls = msg
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .filter_map(|tc| match tc {
                ChatCompletionMessageToolCalls::Function(f) => Some(ToolCall {
                    id: f.id,
                    name: f.function.name,
                    args: serde_json::from_str(&f.function.arguments).unwrap_or(serde_json::json!({})),
                }),
                _ => None,
            })
            .collect();

        let usage = response.usage.map(|u| LlmUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });

        Ok(ChatModelResponse { content, reasoning: None, tool_calls, usage })
    }

    async fn stream(
        &self,
        messages: &[Message],
        chunk_tx: Option<tokio::sync::mpsc::Sender<ModelChunk>>,
        tool_delta_tx: Option<tokio::sync::mpsc::Sender<ToolCallDelta>>,
        cancel: &CancelToken,
    ) -> Result<ChatModelResponse, AgentError> {
        let request = self
            .build_args(messages, true)?
            .build()
            .map_err(|e| AgentError::Other(format!("openai request build failed: {e}")))?;

        let mut stream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(|e| AgentError::ModelTransport(e.to_string()))?;

        let mut full_content = String::new();
        // index -> (id, name, arguments)
        let mut calls: HashMap<u32, (String, String, String)> = HashMap::new();
        let mut usage: Option<LlmUsage> = None;

        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            let chunk = chunk.map_err(|e| AgentError::ModelTransport(e.to_string()))?;

            if let Some(u) = &chunk.usage {
                usage = Some(LlmUsage {
                    input_tokens: u.prompt_tokens,
                    output_tokens: u.completion_tokens,
                    total_tokens: u.total_tokens,
                });
            }

            for choice in chunk.choices {
                let delta = choice.delta;
                if let Some(text) = delta.content {
                    if !text.is_empty() {
                        full_content.push_str(&text);
                        if let Some(tx) = &chunk_tx {
                            let _ = tx.send(ModelChunk { content: Some(text), reasoning: None }).await;
                        }
                    }
                }
                if let Some(deltas) = delta.tool_calls {
                    for tc in deltas {
                        let entry = calls.entry(tc.index).or_insert_with(|| (String::new(), String::new(), String::new()));
                        if let Some(id) = &tc.id {
                            if !id.is_empty() {
                                entry.0 = id.clone();
                            }
                        }
                        let mut arg_fragment = String::new();
                        if let Some(f) = &tc.function {
                            if let Some(name) = &f.name {
                                entry.1.push_str(name);
                            }
                            if let Some(args) = &f.arguments {
                                entry.2.push_str(args);
                                arg_fragment = args.clone();
                            }
                        }
                        if let Some(tx) = &tool_delta_tx {
                            let _ = tx
                                .send(ToolCallDelta {
                                    index: tc.index as usize,
                                    call_id: if entry.0.is_empty() { None } else { Some(entry.0.clone()) },
                                    name: if entry.1.is_empty() { None } else { Some(entry.1.clone()) },
                                    arguments_delta: arg_fragment,
                                })
                                .await;
                        }
                    }
                }
            }
        }

        let mut tool_calls: Vec<(u32, ToolCall)> = calls
            .into_iter()
            .map(|(idx, (id, name, args))| {
                let parsed = if args.is_empty() { serde_json::json!({}) } else { serde_json::from_str(&args).unwrap_or(serde_json::json!({})) };
                (idx, ToolCall { id, name, args: parsed })
            })
            .collect();
        tool_calls.sort_by_key(|(idx, _)| *idx);

        Ok(ChatModelResponse {
            content: full_content,
            reasoning: None,
            tool_calls: tool_calls.into_iter().map(|(_, tc)| tc).collect(),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_openai_new_creates_client() {
        let _ = ChatOpenAI::new("gpt-4o-mini");
    }

    #[test]
    fn bind_tools_does_not_mutate_receiver() {
        let base = ChatOpenAI::new("gpt-4o-mini");
        let spec = ToolSpec { name: "echo".into(), description: "d".into(), schema: serde_json::json!({}) };
        let _bound = base.bind_tools(vec![spec], ToolChoiceMode::Required);
        assert!(base.tools.is_empty());
    }

    #[tokio::test]
    async fn invoke_against_unreachable_base_returns_error() {
        let config = OpenAIConfig::new().with_api_key("test-key").with_api_base("https://127.0.0.1:1");
        let client = ChatOpenAI::with_config(config, "gpt-4o-mini");
        let messages = [Message::human("hi")];
        assert!(client.invoke(&messages).await.is_err());
    }
}
