//! Integration connectors (C8, spec.md §4.7): long-lived objects binding an
//! agent to an external conversation surface. Both connector kinds share
//! two disciplines specified in §4.7: a single-flight dispatch queue (one
//! in-flight agent invocation per connector, inbound events enqueue behind
//! it) and exposure of `getRecentMessages`/`getChannelMembers` for context
//! injection into triggers and agent input variables.

pub mod channel;
pub mod email;

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::error::AgentError;

/// Caps the rolling message log at `max_chars`, evicting the oldest
/// entries first (spec.md §4.7 "rolling message log capped at 4,000
/// characters, oldest-first eviction").
pub struct RollingLog {
    entries: Mutex<VecDeque<String>>,
    max_chars: usize,
}

impl RollingLog {
    pub fn new(max_chars: usize) -> Self {
        Self { entries: Mutex::new(VecDeque::new()), max_chars }
    }

    pub fn push(&self, entry: String) {
        let mut guard = self.entries.lock().expect("rolling log mutex poisoned");
        guard.push_back(entry);
        let mut total: usize = guard.iter().map(|e| e.chars().count()).sum();
        while total > self.max_chars {
            let Some(front) = guard.pop_front() else { break };
            total -= front.chars().count();
        }
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.entries.lock().expect("rolling log mutex poisoned").iter().cloned().collect()
    }
}

/// Splits `text` into chunks of at most `max_chars`, breaking at the last
/// newline within range when possible so chunk boundaries don't sever a
/// line (spec.md §4.7 "Long responses are split into <=7,500-char chunks
/// and sent sequentially").
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }
    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + max_chars).min(chars.len());
        let slice = &chars[start..end];
        let break_at = if end < chars.len() {
            slice.iter().rposition(|c| *c == '\n').map(|i| i + 1).unwrap_or(slice.len())
        } else {
            slice.len()
        };
        let break_at = if break_at == 0 { slice.len() } else { break_at };
        chunks.push(slice[..break_at].iter().collect());
        start += break_at;
    }
    chunks
}

/// The external dispatch target for one connector invocation: body text,
/// sender identifier, and arbitrary metadata (spec.md §4.7 `onCommand(body,
/// sender, meta) → response_text`).
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, body: String, sender: String, meta: serde_json::Value) -> Result<String, AgentError>;
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

struct DispatchJob {
    body: String,
    sender: String,
    meta: serde_json::Value,
    handler: std::sync::Arc<dyn CommandHandler>,
    reply: oneshot::Sender<Result<String, AgentError>>,
}

/// Single in-flight agent invocation per connector; additional inbound
/// events enqueue behind it and run strictly in arrival order once the
/// current one completes (spec.md §4.7 "Common discipline").
///
/// Backed by one worker task consuming a single mpsc receiver: because
/// only one job is ever pulled off the queue at a time, serialization is
/// structural rather than lock-based.
pub struct SingleFlightDispatcher {
    tx: mpsc::Sender<DispatchJob>,
    _worker: tokio::task::JoinHandle<()>,
}

impl SingleFlightDispatcher {
    pub fn new(queue_capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<DispatchJob>(queue_capacity);
        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let result = job.handler.handle(job.body, job.sender, job.meta).await;
                let _ = job.reply.send(result);
            }
        });
        Self { tx, _worker: worker }
    }

    /// Enqueues one dispatch and awaits its result. Returns
    /// [`AgentError::Other`] if the worker task is gone.
    pub async fn submit(
        &self,
        body: String,
        sender: String,
        meta: serde_json::Value,
        handler: std::sync::Arc<dyn CommandHandler>,
    ) -> Result<String, AgentError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(DispatchJob { body, sender, meta, handler, reply: reply_tx })
            .await
            .map_err(|_| AgentError::other("dispatcher worker is gone"))?;
        reply_rx.await.map_err(|_| AgentError::other("dispatcher worker dropped the reply channel"))?
    }
}

/// Context a trigger (C9) pulls from an integration connector: recent
/// transcript and member list, plus a way to post the trigger's result
/// back (spec.md §4.8 "collect channel context and member list from any
/// integration connectors the agent has").
#[async_trait]
pub trait IntegrationContext: Send + Sync {
    fn recent_messages(&self) -> Vec<String>;
    fn channel_members(&self) -> Vec<String>;
    async fn post(&self, text: &str) -> Result<(), AgentError>;
}

/// A long-lived background process an [`crate::orchestrator::Orchestrator`]
/// starts and stops uniformly, regardless of concrete kind (channel
/// connector, email connector, cron trigger).
#[async_trait]
pub trait BackgroundService: Send + Sync {
    fn service_name(&self) -> &str;
    async fn run(self: std::sync::Arc<Self>, cancel: crate::llm::CancelToken);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_log_evicts_oldest_past_char_cap() {
        let log = RollingLog::new(10);
        log.push("12345".to_string());
        log.push("67890".to_string());
        log.push("x".to_string());
        let snap = log.snapshot();
        assert_eq!(snap.join(""), "67890x");
    }

    #[test]
    fn chunk_text_under_cap_is_single_chunk() {
        assert_eq!(chunk_text("hello", 10), vec!["hello".to_string()]);
    }

    #[test]
    fn chunk_text_splits_at_cap_preferring_newline_boundary() {
        let text = "aaaa\nbbbb\ncccc";
        let chunks = chunk_text(text, 6);
        assert_eq!(chunks.concat(), text);
        assert!(chunks.iter().all(|c| c.chars().count() <= 6));
    }

    struct EchoHandler;
    #[async_trait]
    impl CommandHandler for EchoHandler {
        async fn handle(&self, body: String, _sender: String, _meta: serde_json::Value) -> Result<String, AgentError> {
            Ok(format!("echo: {body}"))
        }
    }

    #[tokio::test]
    async fn dispatcher_serializes_concurrent_submits() {
        let dispatcher = std::sync::Arc::new(SingleFlightDispatcher::new(8));
        let handler: std::sync::Arc<dyn CommandHandler> = std::sync::Arc::new(EchoHandler);

        let mut handles = Vec::new();
        for i in 0..5 {
            let dispatcher = dispatcher.clone();
            let handler = handler.clone();
            handles.push(tokio::spawn(async move {
                dispatcher.submit(format!("m{i}"), "s".into(), serde_json::json!({}), handler).await
            }));
        }
        for (i, h) in handles.into_iter().enumerate() {
            assert_eq!(h.await.unwrap().unwrap(), format!("echo: m{i}"));
        }
    }
}
