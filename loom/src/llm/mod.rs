//! Provider-agnostic chat model contract (C2, spec.md §4.1).
//!
//! Every adapter implements [`ChatModel`]: a uniform `invoke`/`stream`/
//! `bind_tools`/`with_structured_output` surface. `bind_tools` and
//! `with_structured_output` return new boxed instances — they never mutate
//! the receiver, so a cached, shared `ChatModel` stays safe under
//! concurrent invocations (spec.md §3 "Ownership & lifecycle").

mod anthropic;
mod factory;
mod google;
mod mock;
mod openai;

pub use anthropic::ChatAnthropic;
pub use factory::{ModelConfig, ModelFactory};
pub use google::ChatGoogle;
pub use mock::MockLlm;
pub use openai::ChatOpenAI;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::AgentError;
use crate::message::{Message, ToolCall};
use crate::stream::ModelChunk;
use crate::tools::ToolSpec;

/// Tool choice mode: whether the model may, must not, or must call a tool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ToolChoiceMode {
    #[default]
    Auto,
    None,
    Required,
}

/// Token usage for one model turn (spec.md §3 `ChatModelResponse.usage_metadata`).
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct LlmUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

impl std::ops::Add for LlmUsage {
    type Output = LlmUsage;
    fn add(self, rhs: LlmUsage) -> LlmUsage {
        LlmUsage {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
            total_tokens: self.total_tokens + rhs.total_tokens,
        }
    }
}

impl std::iter::Sum for LlmUsage {
    fn sum<I: Iterator<Item = LlmUsage>>(iter: I) -> Self {
        iter.fold(LlmUsage::default(), |a, b| a + b)
    }
}

/// Response from one `ChatModel::invoke` call (spec.md §3 `ChatModelResponse`).
#[derive(Clone, Debug, Default)]
pub struct ChatModelResponse {
    pub content: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<LlmUsage>,
}

/// Incremental tool-call argument fragment, keyed by the provider's
/// call-index so fragments for different concurrent tool calls don't
/// interleave (spec.md §4.1: "accumulated per-call-index, then parsed
/// exactly once at stream end").
#[derive(Clone, Debug)]
pub struct ToolCallDelta {
    pub index: usize,
    pub call_id: Option<String>,
    pub name: Option<String>,
    pub arguments_delta: String,
}

/// A cancellation signal, checked at every suspension point (spec.md §5).
/// Cloning shares the same underlying flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Provider-agnostic chat model. Implementations MUST be safe under
/// concurrent `invoke`/`stream` and MUST NOT retain per-call state on
/// `self` (spec.md §3).
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn invoke(&self, messages: &[Message]) -> Result<ChatModelResponse, AgentError>;

    /// Streams deltas, accumulating into a final `ChatModelResponse`.
    /// `chunk_tx` receives `ModelChunk`s as they arrive; `tool_delta_tx`
    /// receives incremental tool-call argument fragments. Honors
    /// `cancel`: when it fires mid-stream the adapter aborts the
    /// underlying transport and returns `Err(AgentError::Cancelled)`.
    async fn stream(
        &self,
        messages: &[Message],
        chunk_tx: Option<mpsc::Sender<ModelChunk>>,
        tool_delta_tx: Option<mpsc::Sender<ToolCallDelta>>,
        cancel: &CancelToken,
    ) -> Result<ChatModelResponse, AgentError>;

    /// Returns a new view that advertises `tools` to the provider. Does
    /// not mutate `self`.
    fn bind_tools(&self, tools: Vec<ToolSpec>, choice: ToolChoiceMode) -> Box<dyn ChatModel>;

    /// Returns a new view that instructs the provider to emit JSON
    /// conforming to `schema`. Does not mutate `self`.
    fn with_structured_output(&self, schema: serde_json::Value) -> Box<dyn ChatModel>;
}

/// Lets a cached `Arc<dyn ChatModel>` be used anywhere a `ChatModel` is
/// expected (e.g. wrapped directly in a `Box<dyn ChatModel>` by the agent
/// executor) without an intermediate newtype.
#[async_trait]
impl ChatModel for Arc<dyn ChatModel> {
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
