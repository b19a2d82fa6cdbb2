//! Streaming event types.
//!
//! Two tiers, matching spec.md §4.2 / §4.3: [`LoopEvent`] is what the ReAct
//! loop itself emits (model deltas, tool start/end); [`Frame`] is what the
//! agent executor maps those into for the public streaming API
//! (content/thinking/tool/usage/result/error).

use serde::Serialize;

use crate::llm::LlmUsage;
use crate::message::ToolCall;

/// One incremental delta from a streaming chat-model call.
#[derive(Clone, Debug, Default)]
pub struct ModelChunk {
    pub content: Option<String>,
    pub reasoning: Option<String>,
}

/// Events emitted by [`crate::agent::react::run_react_stream`] (spec.md §4.2).
#[derive(Clone, Debug)]
pub enum LoopEvent {
    ModelChunk(ModelChunk),
    ModelEnd {
        full_content: String,
        tool_calls: Vec<ToolCall>,
        usage: Option<LlmUsage>,
    },
    ToolStart {
        run_id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolEnd {
        run_id: String,
        name: String,
        output: String,
    },
}

/// Public streaming frame emitted by [`crate::agent::AgentExecutor::stream`]
/// (spec.md §4.3, §6 "Streaming frame envelope").
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Content { content: String },
    Thinking { content: String },
    ToolStart { run_id: String, name: String, input: serde_json::Value },
    ToolEnd { run_id: String, name: String, output: String },
    Usage { usage: LlmUsage },
    Result { output: serde_json::Value },
    Error { error: String },
}
