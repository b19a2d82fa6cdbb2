//! Built-in tool factories (C5, spec.md §4.3 step 6): `save_memory`,
//! integration post/send, and knowledge search. The agent executor
//! auto-injects these when the agent definition asks for them.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ToolSourceError;
use crate::memory::LongTermMemory;
use super::{Tool, ToolCallContext, ToolOutput, ToolSpec};

/// `save_memory`: the only caller of [`LongTermMemory::save`]. Its
/// contract is "replace the entire blob" (spec.md §4.6) and the
/// description must say so explicitly, since the model is the sole
/// writer and has no other way to learn the semantics.
struct SaveMemoryTool {
    memory: Arc<LongTermMemory>,
    agent_name: String,
    max_lines: usize,
}

#[async_trait]
impl Tool for SaveMemoryTool {
    fn name(&self) -> &str {
        "save_memory"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "save_memory".into(),
            description: format!(
                "Replaces the entire long-term memory blob for this agent (max {} lines, trailing lines kept on overflow). \
                 This is NOT an append: pass the full content you want to persist, including anything from the current memory \
                 you still want kept.",
                self.max_lines
            ),
            schema: serde_json::json!({
                "type": "object",
                "required": ["content"],
                "properties": { "content": { "type": "string" } }
            }),
        }
    }

    async fn call(&self, args: serde_json::Value, _ctx: &ToolCallContext) -> Result<ToolOutput, ToolSourceError> {
        let content = args
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolSourceError::InvalidArgs("missing \"content\" string".into()))?;
        self.memory
            .save(&self.agent_name, content, self.max_lines)
            .await
            .map_err(|e| ToolSourceError::Execution(e.to_string()))?;
        Ok(ToolOutput::text("memory saved"))
    }
}

pub fn save_memory_tool(memory: Arc<LongTermMemory>, agent_name: impl Into<String>, max_lines: usize) -> Arc<dyn Tool> {
    Arc::new(SaveMemoryTool { memory, agent_name: agent_name.into(), max_lines })
}

/// Posts/sends a message through an agent's integration connector
/// (spec.md §4.3 step 6c). Generic over any sink that can accept an
/// outbound string (a channel connector's send, an email connector's reply).
#[async_trait]
pub trait IntegrationSink: Send + Sync {
    async fn send(&self, target: Option<&str>, text: &str) -> Result<(), ToolSourceError>;
}

struct IntegrationPostTool {
    sink: Arc<dyn IntegrationSink>,
}

#[async_trait]
impl Tool for IntegrationPostTool {
    fn name(&self) -> &str {
        "integration_post"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "integration_post".into(),
            description: "Sends a message through this agent's configured integration (channel or mailbox).".into(),
            schema: serde_json::json!({
                "type": "object",
                "required": ["text"],
                "properties": {
                    "text": { "type": "string" },
                    "target": { "type": "string", "description": "Optional channel member or recipient override" }
                }
            }),
        }
    }

    async fn call(&self, args: serde_json::Value, _ctx: &ToolCallContext) -> Result<ToolOutput, ToolSourceError> {
        let text = args
            .get("text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolSourceError::InvalidArgs("missing \"text\" string".into()))?;
        let target = args.get("target").and_then(|v| v.as_str());
        self.sink.send(target, text).await?;
        Ok(ToolOutput::text("sent"))
    }
}

pub fn integration_post_tool(sink: Arc<dyn IntegrationSink>) -> Arc<dyn Tool> {
    Arc::new(IntegrationPostTool { sink })
}

/// Knowledge/vector store search, referenced only through this narrow
/// interface — the knowledge store itself is an out-of-scope collaborator
/// (spec.md §1).
#[async_trait]
pub trait KnowledgeSearch: Send + Sync {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<String>, ToolSourceError>;
}

struct KnowledgeSearchTool {
    store: Arc<dyn KnowledgeSearch>,
}

#[async_trait]
impl Tool for KnowledgeSearchTool {
    fn name(&self) -> &str {
        "knowledge_search"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "knowledge_search".into(),
            description: "Searches this agent's knowledge base for passages relevant to a query.".into(),
            schema: serde_json::json!({
                "type": "object",
                "required": ["query"],
                "properties": {
                    "query": { "type": "string" },
                    "top_k": { "type": "number" }
                }
            }),
        }
    }

    async fn call(&self, args: serde_json::Value, _ctx: &ToolCallContext) -> Result<ToolOutput, ToolSourceError> {
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolSourceError::InvalidArgs("missing \"query\" string".into()))?;
        let top_k = args.get("top_k").and_then(|v| v.as_u64()).unwrap_or(5) as usize;
        let hits = self.store.search(query, top_k).await?;
        Ok(ToolOutput::text(hits.join("\n---\n")))
    }
}

pub fn knowledge_search_tool(store: Arc<dyn KnowledgeSearch>) -> Arc<dyn Tool> {
    Arc::new(KnowledgeSearchTool { store })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn save_memory_tool_requires_content_field() {
        let dir = tempdir().unwrap();
        let memory = Arc::new(LongTermMemory::new(dir.path()));
        let tool = save_memory_tool(memory, "agent-a", 100);
        let err = tool.call(serde_json::json!({}), &ToolCallContext::default()).await.unwrap_err();
        assert!(matches!(err, ToolSourceError::InvalidArgs(_)));
    }

    #[tokio::test]
    async fn save_memory_tool_replaces_blob() {
        let dir = tempdir().unwrap();
        let memory = Arc::new(LongTermMemory::new(dir.path()));
        let tool = save_memory_tool(memory.clone(), "agent-a", 100);
        tool.call(serde_json::json!({"content": "note one"}), &ToolCallContext::default())
            .await
            .unwrap();
        assert_eq!(memory.load("agent-a").await.unwrap(), "note one");
    }
}
