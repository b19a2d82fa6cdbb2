//! Tool types and the registry that resolves a declarative tool list to
//! concrete callable tools (C5, spec.md §3 `StructuredTool`, §9 "Dynamic
//! tool registry").

mod builtin;
mod registry;

pub use builtin::{
    integration_post_tool, knowledge_search_tool, save_memory_tool, IntegrationSink,
    KnowledgeSearch,
};
pub use registry::ToolRegistry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ToolSourceError;
use crate::message::Part;

/// Shape-level description of a tool, as advertised to a chat model
/// (spec.md §3 `StructuredTool`: name, description, JSON-Schema-shaped
/// schema).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub schema: serde_json::Value,
}

/// Output of a tool invocation: either plain text or a sequence of parts
/// (spec.md §3: `invoke(args) → Text | [Part]`).
#[derive(Clone, Debug)]
pub enum ToolOutput {
    Text(String),
    Parts(Vec<Part>),
}

impl ToolOutput {
    pub fn text(s: impl Into<String>) -> Self {
        ToolOutput::Text(s.into())
    }

    /// Text projection used when composing tool-history summaries and
    /// session messages.
    pub fn to_text(&self) -> String {
        match self {
            ToolOutput::Text(s) => s.clone(),
            ToolOutput::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    Part::Text { text } => Some(text.as_str()),
                    Part::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

/// Per-call context threaded into a tool invocation (current conversation,
/// thread/user id). The open sum of tool sources (MCP peers, local code,
/// sandbox executors, knowledge stores, integration built-ins) only needs
/// to agree on this interface — see spec.md §9 "Dynamic tool registry".
#[derive(Clone, Debug, Default)]
pub struct ToolCallContext {
    pub recent_messages: Vec<crate::message::Message>,
    pub session_id: Option<String>,
}

/// A single tool the ReAct loop's act phase can dispatch by name.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn spec(&self) -> ToolSpec;
    async fn call(
        &self,
        args: serde_json::Value,
        ctx: &ToolCallContext,
    ) -> Result<ToolOutput, ToolSourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_output_to_text_drops_images() {
        let out = ToolOutput::Parts(vec![
            Part::Text { text: "hi".into() },
            Part::Image { image_base64: "x".into(), media_type: "image/png".into() },
        ]);
        assert_eq!(out.to_text(), "hi");
    }
}
