//! Deterministic in-memory [`ChatModel`] for ReAct-loop tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::AgentError;
use crate::message::{Message, ToolCall};
use crate::stream::ModelChunk;
use crate::tools::ToolSpec;

use super::{CancelToken, ChatModel, ChatModelResponse, LlmUsage, ToolCallDelta, ToolChoiceMode};

/// Returns a fixed queue of responses, one per call; the last response
/// repeats once the queue is exhausted. `with_stream_by_char` makes
/// `stream` emit one `ModelChunk` per character instead of one chunk for
/// the whole content, for exercising incremental-rendering callers.
pub struct MockLlm {
    responses: Vec<ChatModelResponse>,
    call_count: AtomicUsize,
    stream_by_char: AtomicBool,
}

impl MockLlm {
    /// A single fixed response returned for every call.
    pub fn with_no_tool_calls(content: impl Into<String>) -> Self {
        Self::new(vec![ChatModelResponse { content: content.into(), reasoning: None, tool_calls: Vec::new(), usage: None }])
    }

    /// One round of a named tool call followed by a plain-text reply, for
    /// exercising a single think → act → observe → think cycle.
    pub fn first_tool_call_then(name: impl Into<String>, args: serde_json::Value, final_content: impl Into<String>) -> Self {
        Self::new(vec![
            ChatModelResponse {
                content: String::new(),
                reasoning: None,
                tool_calls: vec![ToolCall { id: "call-1".into(), name: name.into(), args }],
                usage: None,
            },
            ChatModelResponse { content: final_content.into(), reasoning: None, tool_calls: Vec::new(), usage: None },
        ])
    }

    /// A queue of responses returned one per call, repeating the last
    /// entry once exhausted.
    pub fn new(responses: Vec<ChatModelResponse>) -> Self {
        Self { responses, call_count: AtomicUsize::new(0), stream_by_char: AtomicBool::new(false) }
    }

    pub fn with_stream_by_char(self) -> Self {
        self.stream_by_char.store(true, Ordering::SeqCst);
        self
    }

    fn next_response(&self) -> ChatModelResponse {
        let n = self.call_count.fetch_add(1, Ordering::SeqCst);
        let idx = n.min(self.responses.len().saturating_sub(1));
        self.responses.get(idx).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl ChatModel for MockLlm {
    async fn invoke(&self, _messages: &[Message]) -> Result<ChatModelResponse, AgentError> {
        Ok(self.next_response())
    }

    async fn stream(
        &self,
        messages: &[Message],
        chunk_tx: Option<mpsc::Sender<ModelChunk>>,
        tool_delta_tx: Option<mpsc::Sender<ToolCallDelta>>,
        cancel: &CancelToken,
    ) -> Result<ChatModelResponse, AgentError> {
        let response = self.invoke(messages).await?;

        if let Some(tx) = &chunk_tx {
            if !response.content.is_empty() {
                if self.stream_by_char.load(Ordering::SeqCst) {
                    for c in response.content.chars() {
                        if cancel.is_cancelled() {
                            return Err(AgentError::Cancelled);
                        }
                        let _ = tx.send(ModelChunk { content: Some(c.to_string()), reasoning: None }).await;
                    }
                } else {
                    let _ = tx.send(ModelChunk { content: Some(response.content.clone()), reasoning: None }).await;
                }
            }
        }

        if let Some(tx) = &tool_delta_tx {
            for (index, call) in response.tool_calls.iter().enumerate() {
                let _ = tx
                    .send(ToolCallDelta {
                        index,
                        call_id: Some(call.id.clone()),
                        name: Some(call.name.clone()),
                        arguments_delta: call.args.to_string(),
                    })
                    .await;
            }
        }

        Ok(response)
    }

    fn bind_tools(&self, _tools: Vec<ToolSpec>, _choice: ToolChoiceMode) -> Box<dyn ChatModel> {
        Box::new(Self { responses: self.responses.clone(), call_count: AtomicUsize::new(self.call_count.load(Ordering::SeqCst)), stream_by_char: AtomicBool::new(self.stream_by_char.load(Ordering::SeqCst)) })
    }

    fn with_structured_output(&self, _schema: serde_json::Value) -> Box<dyn ChatModel> {
        Box::new(Self { responses: self.responses.clone(), call_count: AtomicUsize::new(self.call_count.load(Ordering::SeqCst)), stream_by_char: AtomicBool::new(self.stream_by_char.load(Ordering::SeqCst)) })
    }
}

/// Shared-pointer convenience: `Arc<MockLlm>` also satisfies `ChatModel`,
/// so a test can keep a handle to assert on call counts while the loop
/// holds its own `Arc` clone.
#[async_trait]
impl ChatModel for Arc<MockLlm> {
    async fn invoke(&self, messages: &[Message]) -> Result<ChatModelResponse, AgentError> {
        (**self).invoke(messages).await
    }

    async fn stream(
        &self,
        messages: &[Message],
        chunk_tx: Option<mpsc::Sender<ModelChunk>>,
        tool_delta_tx: Option<mpsc::Sender<ToolCallDelta>>,
        cancel: &CancelToken,
    ) -> Result<ChatModelResponse, AgentError> {
        (**self).stream(messages, chunk_tx, tool_delta_tx, cancel).await
    }

    fn bind_tools(&self, tools: Vec<ToolSpec>, choice: ToolChoiceMode) -> Box<dyn ChatModel> {
        (**self).bind_tools(tools, choice)
    }

    fn with_structured_output(&self, schema: serde_json::Value) -> Box<dyn ChatModel> {
        (**self).with_structured_output(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn with_no_tool_calls_repeats_same_response() {
        let mock = MockLlm::with_no_tool_calls("hello");
        let r1 = mock.invoke(&[]).await.unwrap();
        let r2 = mock.invoke(&[]).await.unwrap();
        assert_eq!(r1.content, "hello");
        assert_eq!(r2.content, "hello");
    }

    #[tokio::test]
    async fn first_tool_call_then_advances_queue() {
        let mock = MockLlm::first_tool_call_then("get_time", serde_json::json!({}), "the time is noon");
        let r1 = mock.invoke(&[]).await.unwrap();
        assert_eq!(r1.tool_calls.len(), 1);
        let r2 = mock.invoke(&[]).await.unwrap();
        assert_eq!(r2.content, "the time is noon");
        assert!(r2.tool_calls.is_empty());
        let r3 = mock.invoke(&[]).await.unwrap();
        assert_eq!(r3.content, "the time is noon");
    }

    #[tokio::test]
    async fn stream_by_char_emits_one_chunk_per_character() {
        let mock = MockLlm::with_no_tool_calls("hi").with_stream_by_char();
        let (tx, mut rx) = mpsc::channel(16);
        mock.stream(&[], Some(tx), None, &CancelToken::new()).await.unwrap();
        let mut chars = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            chars.push(chunk.content.unwrap());
        }
        assert_eq!(chars, vec!["h", "i"]);
    }
}
