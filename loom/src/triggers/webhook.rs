//! Webhook trigger: a registered HTTP route that submits one agent
//! invocation per request (spec.md §4.8 "Webhook").

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use super::{merge_input, webhook_session_id, AgentInvoker};
use crate::agent::definition::AgentResult;
use crate::error::AgentError;

#[derive(Debug, Error)]
pub enum WebhookRegistrationError {
    #[error("webhook path {0:?} is already registered")]
    PathTaken(String),
}

pub struct WebhookTrigger {
    agent_name: String,
    path: String,
    declared_input: serde_json::Value,
    invoker: Arc<dyn AgentInvoker>,
}

impl WebhookTrigger {
    pub fn new(agent_name: impl Into<String>, path: Option<String>, declared_input: serde_json::Value, invoker: Arc<dyn AgentInvoker>) -> Self {
        let agent_name = agent_name.into();
        let path = path.unwrap_or_else(|| derived_path(&agent_name));
        Self { agent_name, path, declared_input, invoker }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Merges the request body over the declared input (body takes
    /// precedence) and submits one agent invocation with session id
    /// `trigger-<agent>-webhook-<timestamp>` (spec.md §4.8).
    pub async fn handle(&self, body: serde_json::Value, timestamp: i64) -> Result<AgentResult, AgentError> {
        let input = merge_input(&self.declared_input, &body);
        let session_id = webhook_session_id(&self.agent_name, timestamp);
        self.invoker.invoke(&self.agent_name, input, Some(session_id)).await
    }
}

/// `/api/triggers/webhooks/<agent>` (spec.md §4.8).
fn derived_path(agent_name: &str) -> String {
    format!("/api/triggers/webhooks/{agent_name}")
}

/// Path-keyed registry enforcing first-wins collision detection across
/// triggers (spec.md §4.8 "Path collisions across triggers are detected at
/// registration and the later registration is rejected").
#[derive(Default)]
pub struct WebhookRegistry {
    triggers: Mutex<HashMap<String, Arc<WebhookTrigger>>>,
}

impl WebhookRegistry {
    pub fn new() -> Self {
        Self { triggers: Mutex::new(HashMap::new()) }
    }

    pub fn register(&self, trigger: WebhookTrigger) -> Result<Arc<WebhookTrigger>, WebhookRegistrationError> {
        let mut guard = self.triggers.lock().expect("webhook registry mutex poisoned");
        if guard.contains_key(trigger.path()) {
            return Err(WebhookRegistrationError::PathTaken(trigger.path().to_string()));
        }
        let trigger = Arc::new(trigger);
        guard.insert(trigger.path().to_string(), trigger.clone());
        Ok(trigger)
    }

    pub fn get(&self, path: &str) -> Option<Arc<WebhookTrigger>> {
        self.triggers.lock().expect("webhook registry mutex poisoned").get(path).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        self.triggers.lock().expect("webhook registry mutex poisoned").keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::definition::AgentResultMetadata;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    struct MockInvoker {
        calls: StdMutex<Vec<(String, serde_json::Value, Option<String>)>>,
    }

    #[async_trait]
    impl AgentInvoker for MockInvoker {
        async fn invoke(&self, agent_name: &str, input: serde_json::Value, session_id: Option<String>) -> Result<AgentResult, AgentError> {
            self.calls.lock().unwrap().push((agent_name.to_string(), input, session_id));
            Ok(AgentResult {
                output: json!({"ack": true}),
                metadata: AgentResultMetadata { duration_ms: 0, tool_calls: vec![], session_id: None, messages_in_session: None, structured_output_valid: None },
            })
        }
    }

    #[test]
    fn derived_path_matches_spec_convention() {
        assert_eq!(derived_path("billing"), "/api/triggers/webhooks/billing");
    }

    #[tokio::test]
    async fn handle_merges_body_over_declared_input_with_body_precedence() {
        let invoker = Arc::new(MockInvoker { calls: StdMutex::new(Vec::new()) });
        let trigger = WebhookTrigger::new("billing", None, json!({"mode": "default", "x": 1}), invoker.clone());

        trigger.handle(json!({"mode": "urgent"}), 1000).await.unwrap();

        let calls = invoker.calls.lock().unwrap();
        assert_eq!(calls[0].0, "billing");
        assert_eq!(calls[0].1, json!({"mode": "urgent", "x": 1}));
        assert_eq!(calls[0].2.as_deref(), Some("trigger-billing-webhook-1000"));
    }

    #[test]
    fn registry_rejects_path_collision_first_wins() {
        let invoker: Arc<dyn AgentInvoker> = Arc::new(MockInvoker { calls: StdMutex::new(Vec::new()) });
        let registry = WebhookRegistry::new();

        let first = WebhookTrigger::new("billing", Some("/hooks/shared".to_string()), json!({}), invoker.clone());
        assert!(registry.register(first).is_ok());

        let second = WebhookTrigger::new("other", Some("/hooks/shared".to_string()), json!({}), invoker);
        let err = registry.register(second).unwrap_err();
        assert!(matches!(err, WebhookRegistrationError::PathTaken(p) if p == "/hooks/shared"));
    }

    #[test]
    fn registry_get_returns_registered_trigger_by_path() {
        let invoker: Arc<dyn AgentInvoker> = Arc::new(MockInvoker { calls: StdMutex::new(Vec::new()) });
        let registry = WebhookRegistry::new();
        registry.register(WebhookTrigger::new("billing", None, json!({}), invoker)).unwrap();

        assert!(registry.get("/api/triggers/webhooks/billing").is_some());
        assert!(registry.get("/nope").is_none());
        assert_eq!(registry.paths(), vec!["/api/triggers/webhooks/billing".to_string()]);
    }
}
