//! Resolves a declarative tool-name list to concrete [`Tool`] instances.
//!
//! Read-only after initialization (spec.md §5 "Shared resource policy").

use std::collections::HashMap;
use std::sync::Arc;

use super::{Tool, ToolSpec};

/// Name-keyed set of resolved tools, built once per agent instance and
/// shared across all of that agent's invocations.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool, first-wins on name collision (spec.md §4.3 step 6:
    /// "De-duplicate by tool name; first-wins").
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.entry(tool.name().to_string()).or_insert(tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Tool specs in registration order is not guaranteed; callers that
    /// need a stable order should sort by name.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.values().map(|t| t.spec()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolSourceError;
    use crate::tools::{ToolCallContext, ToolOutput};
    use async_trait::async_trait;

    struct Named(&'static str, &'static str);

    #[async_trait]
    impl Tool for Named {
        fn name(&self) -> &str {
            self.0
        }
        fn spec(&self) -> ToolSpec {
            ToolSpec { name: self.0.into(), description: self.1.into(), schema: serde_json::json!({}) }
        }
        async fn call(&self, _args: serde_json::Value, _ctx: &ToolCallContext) -> Result<ToolOutput, ToolSourceError> {
            Ok(ToolOutput::text("ok"))
        }
    }

    #[test]
    fn first_registration_wins_on_name_collision() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(Named("echo", "first")));
        reg.register(Arc::new(Named("echo", "second")));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("echo").unwrap().spec().description, "first");
    }
}
