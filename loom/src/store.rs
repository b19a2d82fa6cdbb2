//! In-memory per-session conversation store with FIFO bounds and TTL
//! eviction (C3, spec.md §4.5).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::message::Message;

/// `{messages, createdAt, lastAccessedAt}` (spec.md §3).
#[derive(Clone, Debug)]
pub struct ConversationSession {
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

impl ConversationSession {
    fn new() -> Self {
        let now = Utc::now();
        Self { messages: Vec::new(), created_at: now, last_accessed_at: now }
    }
}

struct Inner {
    sessions: HashMap<String, ConversationSession>,
}

/// `sessionId → bounded message history`. Every `add` creates the session
/// lazily, appends, then truncates from the head until `|messages| <=
/// max_messages_per_session`. Internally synchronized: all operations and
/// the TTL sweeper share a single mutex over the session map (spec.md §5).
pub struct ConversationStore {
    inner: Arc<Mutex<Inner>>,
    max_messages_per_session: usize,
    session_ttl: Option<Duration>,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

impl ConversationStore {
    pub fn new(max_messages_per_session: usize, session_ttl: Option<Duration>) -> Arc<Self> {
        let store = Arc::new(Self {
            inner: Arc::new(Mutex::new(Inner { sessions: HashMap::new() })),
            max_messages_per_session,
            session_ttl,
            sweeper: Mutex::new(None),
        });
        if session_ttl.is_some() {
            store.clone().spawn_sweeper();
        }
        store
    }

    fn spawn_sweeper(self: Arc<Self>) {
        let inner = Arc::clone(&self.inner);
        let ttl = self.session_ttl.expect("sweeper only spawned when ttl is set");
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let now = Utc::now();
                let mut guard = inner.lock().await;
                let before = guard.sessions.len();
                guard.sessions.retain(|_, s| {
                    now.signed_duration_since(s.last_accessed_at).to_std().unwrap_or(Duration::ZERO) <= ttl
                });
                let evicted = before - guard.sessions.len();
                if evicted > 0 {
                    info!(evicted, "conversation store TTL sweep evicted sessions");
                }
            }
        });
        // `spawn_sweeper` can only be called once per store (from `new`), so this never
        // has to cope with a pre-existing handle.
        if let Ok(mut guard) = self.sweeper.try_lock() {
            *guard = Some(handle);
        }
    }

    /// Defensive copy: mutating the returned `Vec` never affects the
    /// store's internal state (spec.md §8 round-trip invariant). A read of
    /// a session that has never been written to does not create one
    /// (spec.md §3: sessions are "created on first write"); it just
    /// returns an empty history.
    pub async fn get(&self, session_id: &str) -> Vec<Message> {
        let mut guard = self.inner.lock().await;
        let Some(session) = guard.sessions.get_mut(session_id) else {
            return Vec::new();
        };
        session.last_accessed_at = Utc::now();
        session.messages.clone()
    }

    pub async fn add(&self, session_id: &str, message: Message) {
        let mut guard = self.inner.lock().await;
        let session = guard
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(ConversationSession::new);
        session.messages.push(message);
        session.last_accessed_at = Utc::now();
        if session.messages.len() > self.max_messages_per_session {
            let overflow = session.messages.len() - self.max_messages_per_session;
            session.messages.drain(0..overflow);
        }
    }

    pub async fn has(&self, session_id: &str) -> bool {
        self.inner.lock().await.sessions.contains_key(session_id)
    }

    pub async fn count(&self, session_id: &str) -> usize {
        self.inner
            .lock()
            .await
            .sessions
            .get(session_id)
            .map(|s| s.messages.len())
            .unwrap_or(0)
    }

    pub async fn clear(&self, session_id: &str) -> Result<(), StoreError> {
        let mut guard = self.inner.lock().await;
        guard.sessions.remove(session_id);
        Ok(())
    }

    /// Runs one TTL sweep immediately (exposed for tests and explicit
    /// callers; the background sweeper calls the same logic every 60s).
    pub async fn cleanup(&self) {
        let Some(ttl) = self.session_ttl else { return };
        let now = Utc::now();
        let mut guard = self.inner.lock().await;
        guard.sessions.retain(|_, s| {
            now.signed_duration_since(s.last_accessed_at).to_std().unwrap_or(Duration::ZERO) <= ttl
        });
    }

    /// Stops the TTL sweeper task. Idempotent.
    pub async fn destroy(&self) {
        if let Some(handle) = self.sweeper.lock().await.take() {
            handle.abort();
            debug!("conversation store sweeper stopped");
        }
    }
}
