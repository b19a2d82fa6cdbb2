//! Cron trigger: fires an agent on a schedule, one continuous session
//! across fires (spec.md §4.8 "Cron").

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use super::{cron_session_id, merge_input, AgentInvoker};
use crate::integrations::{BackgroundService, IntegrationContext};
use crate::llm::CancelToken;

#[derive(Debug, thiserror::Error)]
pub enum CronTriggerError {
    #[error("invalid cron expression: {0}")]
    InvalidExpression(String),
}

pub struct CronTrigger {
    agent_name: String,
    schedule: cron::Schedule,
    declared_input: serde_json::Value,
    invoker: Arc<dyn AgentInvoker>,
    integration: Option<Arc<dyn IntegrationContext>>,
}

impl CronTrigger {
    pub fn new(
        agent_name: impl Into<String>,
        expression: &str,
        declared_input: serde_json::Value,
        invoker: Arc<dyn AgentInvoker>,
        integration: Option<Arc<dyn IntegrationContext>>,
    ) -> Result<Self, CronTriggerError> {
        let schedule = cron::Schedule::from_str(expression).map_err(|e| CronTriggerError::InvalidExpression(e.to_string()))?;
        Ok(Self { agent_name: agent_name.into(), schedule, declared_input, invoker, integration })
    }

    /// Merges live channel context (recent messages, member list) from any
    /// bound integration into the declared trigger input (spec.md §4.8
    /// "collect channel context and member list ... merge them into the
    /// declared trigger input").
    fn context_merged_input(&self) -> serde_json::Value {
        let Some(integration) = &self.integration else {
            return self.declared_input.clone();
        };
        let context = serde_json::json!({
            "recentMessages": integration.recent_messages(),
            "channelMembers": integration.channel_members(),
        });
        merge_input(&self.declared_input, &context)
    }

    async fn fire_once(&self) {
        let input = self.context_merged_input();
        let session_id = cron_session_id(&self.agent_name);
        match self.invoker.invoke(&self.agent_name, input, Some(session_id)).await {
            Ok(result) => {
                if let Some(integration) = &self.integration {
                    let text = match &result.output {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    if let Err(e) = integration.post(&text).await {
                        warn!(agent = %self.agent_name, error = %e, "cron trigger failed to post result back");
                    }
                }
            }
            Err(e) => warn!(agent = %self.agent_name, error = %e, "cron trigger invocation failed"),
        }
    }

    /// Sleeps until the schedule's next fire time, then returns. `None`
    /// when the schedule has no more occurrences (never true for a
    /// well-formed recurring expression, but guards against pathological
    /// inputs).
    async fn sleep_until_next_fire(&self) -> bool {
        let Some(next) = self.schedule.upcoming(Utc).next() else {
            return false;
        };
        let now = Utc::now();
        if next > now {
            let duration = (next - now).to_std().unwrap_or(std::time::Duration::ZERO);
            tokio::time::sleep(duration).await;
        }
        true
    }
}

#[async_trait]
impl BackgroundService for CronTrigger {
    fn service_name(&self) -> &str {
        "cron_trigger"
    }

    async fn run(self: Arc<Self>, cancel: CancelToken) {
        while !cancel.is_cancelled() {
            if !self.sleep_until_next_fire().await {
                break;
            }
            if cancel.is_cancelled() {
                break;
            }
            self.fire_once().await;
        }
        debug!(agent = %self.agent_name, "cron trigger stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::definition::{AgentResult, AgentResultMetadata};
    use crate::error::AgentError;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    struct MockInvoker {
        calls: StdMutex<Vec<(String, serde_json::Value, Option<String>)>>,
    }

    #[async_trait]
    impl AgentInvoker for MockInvoker {
        async fn invoke(
            &self,
            agent_name: &str,
            input: serde_json::Value,
            session_id: Option<String>,
        ) -> Result<AgentResult, AgentError> {
            self.calls.lock().unwrap().push((agent_name.to_string(), input, session_id));
            Ok(AgentResult {
                output: json!("ok"),
                metadata: AgentResultMetadata {
                    duration_ms: 0,
                    tool_calls: vec![],
                    session_id: None,
                    messages_in_session: None,
                    structured_output_valid: None,
                },
            })
        }
    }

    struct MockIntegration {
        posted: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl IntegrationContext for MockIntegration {
        fn recent_messages(&self) -> Vec<String> {
            vec!["hi".to_string()]
        }
        fn channel_members(&self) -> Vec<String> {
            vec!["alice".to_string()]
        }
        async fn post(&self, text: &str) -> Result<(), AgentError> {
            self.posted.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn fire_once_uses_stable_session_id_and_merges_context() {
        let invoker = Arc::new(MockInvoker { calls: StdMutex::new(Vec::new()) });
        let integration = Arc::new(MockIntegration { posted: StdMutex::new(Vec::new()) });
        let trigger = CronTrigger::new(
            "reporter",
            "0 0 * * * *",
            json!({"topic": "status"}),
            invoker.clone(),
            Some(integration.clone()),
        )
        .unwrap();

        trigger.fire_once().await;
        trigger.fire_once().await;

        let calls = invoker.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "reporter");
        assert_eq!(calls[0].2.as_deref(), Some("trigger-reporter-cron"));
        assert_eq!(calls[1].2.as_deref(), Some("trigger-reporter-cron"));
        assert_eq!(calls[0].1["topic"], json!("status"));
        assert_eq!(calls[0].1["channelMembers"], json!(["alice"]));

        assert_eq!(*integration.posted.lock().unwrap(), vec!["ok".to_string(), "ok".to_string()]);
    }

    #[test]
    fn invalid_expression_is_rejected() {
        let invoker = Arc::new(MockInvoker { calls: StdMutex::new(Vec::new()) });
        let result = CronTrigger::new("x", "not a cron expr", json!({}), invoker, None);
        assert!(result.is_err());
    }
}
