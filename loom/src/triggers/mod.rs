//! Trigger dispatcher (C9, spec.md §4.8): cron and webhook invokers that
//! submit agent runs with deterministic session ids.

pub mod cron;
pub mod webhook;

pub use cron::CronTrigger;
pub use webhook::{WebhookRegistrationError, WebhookRegistry, WebhookTrigger};

use async_trait::async_trait;

use crate::agent::definition::AgentResult;
use crate::error::AgentError;

/// The orchestrator-side entry point a trigger submits through. Concrete
/// implementations look the named agent up and run it to completion
/// (spec.md §4.8 "submit the agent with session id ...").
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(
        &self,
        agent_name: &str,
        input: serde_json::Value,
        session_id: Option<String>,
    ) -> Result<AgentResult, AgentError>;
}

/// `trigger-<agent>-cron` — stable across fires so the cron conversation is
/// one continuous session (spec.md §4.8).
pub fn cron_session_id(agent_name: &str) -> String {
    format!("trigger-{agent_name}-cron")
}

/// `trigger-<agent>-webhook-<timestamp>` — one session per request
/// (spec.md §4.8).
pub fn webhook_session_id(agent_name: &str, timestamp: i64) -> String {
    format!("trigger-{agent_name}-webhook-{timestamp}")
}

/// Merges `overlay` over `base` object-wise: overlay keys win, base keys
/// not present in overlay are kept (spec.md §4.8 "merge them into the
/// declared trigger input" / "merge body over declared trigger input").
pub fn merge_input(base: &serde_json::Value, overlay: &serde_json::Value) -> serde_json::Value {
    match (base, overlay) {
        (serde_json::Value::Object(b), serde_json::Value::Object(o)) => {
            let mut merged = b.clone();
            for (k, v) in o {
                merged.insert(k.clone(), v.clone());
            }
            serde_json::Value::Object(merged)
        }
        _ => overlay.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn session_id_formats_match_spec() {
        assert_eq!(cron_session_id("billing"), "trigger-billing-cron");
        assert_eq!(webhook_session_id("billing", 12345), "trigger-billing-webhook-12345");
    }

    #[test]
    fn merge_input_overlay_wins_on_key_collision() {
        let base = json!({"a": 1, "b": 2});
        let overlay = json!({"b": 99, "c": 3});
        let merged = merge_input(&base, &overlay);
        assert_eq!(merged, json!({"a": 1, "b": 99, "c": 3}));
    }

    #[test]
    fn merge_input_falls_back_to_overlay_when_not_both_objects() {
        let merged = merge_input(&json!([1, 2]), &json!("x"));
        assert_eq!(merged, json!("x"));
    }
}
