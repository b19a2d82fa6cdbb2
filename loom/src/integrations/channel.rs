//! Channel connector: a persistent, auto-reconnecting bidirectional
//! connection to a chat room (spec.md §4.7 "Channel connector").
//!
//! The room/presence protocol itself is an out-of-scope collaborator; this
//! module only needs [`ChannelTransport`], the narrow interface a concrete
//! implementation satisfies. [`WsChannelTransport`] is one such concrete
//! implementation: a small JSON-over-WebSocket framing, grounded on the
//! same `tokio-tungstenite` usage the pack's other WebSocket-backed
//! examples follow.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{chunk_text, BackgroundService, CommandHandler, IntegrationContext, RollingLog, SingleFlightDispatcher};
use crate::error::AgentError;
use crate::llm::CancelToken;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(3);
const MESSAGE_LOG_CAP_CHARS: usize = 4_000;
const OUTGOING_CHUNK_CHARS: usize = 7_500;

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("display name already taken")]
    NameTaken,
    #[error("connection closed")]
    Disconnected,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Member {
    pub user_id: String,
    pub name: String,
}

#[derive(Clone, Debug)]
pub struct Mention {
    pub name: String,
    pub user_id: String,
}

/// Opaque handle to the channel/room the connector has joined.
#[derive(Clone, Debug)]
pub struct ChannelHandle(pub String);

/// Events the transport surfaces as they arrive.
#[derive(Clone, Debug)]
pub enum ChannelEvent {
    Joined { user_id: String, name: String },
    Left { name: String },
    Chat { sender_user_id: String, sender_name: String, text: String },
    Disconnected,
}

/// The wire-level operations a channel connector needs (spec.md §4.7): set
/// a display name, find-or-create and join a room, request its member
/// list, send text with resolved mentions, and surface the next inbound
/// event. A concrete implementation owns the actual socket.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn connect(&self) -> Result<(), ConnectorError>;
    /// Attempts to claim `name` as the bot's display name. Returns
    /// `Err(NameTaken)` on collision so the caller can retry with a suffix.
    async fn set_display_name(&self, name: &str) -> Result<(), ConnectorError>;
    async fn find_or_create_channel(&self, name: &str, password: Option<&str>) -> Result<ChannelHandle, ConnectorError>;
    async fn join(&self, channel: &ChannelHandle) -> Result<(), ConnectorError>;
    async fn request_member_list(&self, channel: &ChannelHandle) -> Result<Vec<Member>, ConnectorError>;
    async fn send_text(&self, channel: &ChannelHandle, text: &str, mentions: &[Mention]) -> Result<(), ConnectorError>;
    /// Blocks until the next event arrives, or returns
    /// `Err(Disconnected)`/`Ok(ChannelEvent::Disconnected)` when the
    /// connection drops.
    async fn next_event(&self, channel: &ChannelHandle) -> Result<ChannelEvent, ConnectorError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// JSON-over-WebSocket [`ChannelTransport`]: every call sends one `{"op":
/// ...}` frame and, except `send_text`, awaits exactly one JSON reply.
/// Setup (`connect`/`set_display_name`/`find_or_create_channel`/`join`/
/// `request_member_list`) happens strictly sequentially before
/// [`ChannelConnector::connect_once`] starts polling [`Self::next_event`],
/// so one socket, guarded by one mutex, never needs concurrent readers.
pub struct WsChannelTransport {
    url: String,
    socket: AsyncMutex<Option<WsStream>>,
}

impl WsChannelTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), socket: AsyncMutex::new(None) }
    }

    async fn send_frame(&self, frame: serde_json::Value) -> Result<(), ConnectorError> {
        let mut guard = self.socket.lock().await;
        let socket = guard.as_mut().ok_or_else(|| ConnectorError::Transport("not connected".into()))?;
        socket.send(WsMessage::Text(frame.to_string())).await.map_err(|e| ConnectorError::Transport(e.to_string()))
    }

    async fn recv_frame(&self) -> Result<serde_json::Value, ConnectorError> {
        let mut guard = self.socket.lock().await;
        let socket = guard.as_mut().ok_or_else(|| ConnectorError::Transport("not connected".into()))?;
        loop {
            match socket.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    return serde_json::from_str(&text).map_err(|e| ConnectorError::Transport(e.to_string()))
                }
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(ConnectorError::Transport(e.to_string())),
                None => return Err(ConnectorError::Disconnected),
            }
        }
    }
}

#[async_trait]
impl ChannelTransport for WsChannelTransport {
    async fn connect(&self) -> Result<(), ConnectorError> {
        let (ws, _response) = connect_async(&self.url).await.map_err(|e| ConnectorError::Transport(e.to_string()))?;
        *self.socket.lock().await = Some(ws);
        Ok(())
    }

    async fn set_display_name(&self, name: &str) -> Result<(), ConnectorError> {
        self.send_frame(serde_json::json!({"op": "set_display_name", "name": name})).await?;
        match self.recv_frame().await?.get("ok").and_then(serde_json::Value::as_bool) {
            Some(true) => Ok(()),
            Some(false) => Err(ConnectorError::NameTaken),
            None => Err(ConnectorError::Transport("malformed set_display_name reply".into())),
        }
    }

    async fn find_or_create_channel(&self, name: &str, password: Option<&str>) -> Result<ChannelHandle, ConnectorError> {
        self.send_frame(serde_json::json!({"op": "find_or_create_channel", "name": name, "password": password})).await?;
        self.recv_frame()
            .await?
            .get("channel_id")
            .and_then(serde_json::Value::as_str)
            .map(|s| ChannelHandle(s.to_string()))
            .ok_or_else(|| ConnectorError::Transport("malformed find_or_create_channel reply".into()))
    }

    async fn join(&self, channel: &ChannelHandle) -> Result<(), ConnectorError> {
        self.send_frame(serde_json::json!({"op": "join", "channel_id": channel.0})).await?;
        match self.recv_frame().await?.get("ok").and_then(serde_json::Value::as_bool) {
            Some(true) => Ok(()),
            _ => Err(ConnectorError::Transport("join rejected".into())),
        }
    }

    async fn request_member_list(&self, channel: &ChannelHandle) -> Result<Vec<Member>, ConnectorError> {
        self.send_frame(serde_json::json!({"op": "member_list", "channel_id": channel.0})).await?;
        let reply = self.recv_frame().await?;
        let members = reply
            .get("members")
            .and_then(serde_json::Value::as_array)
            .ok_or_else(|| ConnectorError::Transport("malformed member_list reply".into()))?;
        Ok(members
            .iter()
            .filter_map(|m| {
                Some(Member { user_id: m.get("user_id")?.as_str()?.to_string(), name: m.get("name")?.as_str()?.to_string() })
            })
            .collect())
    }

    async fn send_text(&self, channel: &ChannelHandle, text: &str, mentions: &[Mention]) -> Result<(), ConnectorError> {
        let mentions: Vec<_> =
            mentions.iter().map(|m| serde_json::json!({"user_id": m.user_id, "name": m.name})).collect();
        self.send_frame(serde_json::json!({"op": "send", "channel_id": channel.0, "text": text, "mentions": mentions})).await
    }

    async fn next_event(&self, _channel: &ChannelHandle) -> Result<ChannelEvent, ConnectorError> {
        let frame = self.recv_frame().await?;
        Ok(match frame.get("type").and_then(serde_json::Value::as_str) {
            Some("joined") => ChannelEvent::Joined {
                user_id: frame.get("user_id").and_then(serde_json::Value::as_str).unwrap_or_default().to_string(),
                name: frame.get("name").and_then(serde_json::Value::as_str).unwrap_or_default().to_string(),
            },
            Some("left") => {
                ChannelEvent::Left { name: frame.get("name").and_then(serde_json::Value::as_str).unwrap_or_default().to_string() }
            }
            Some("chat") => ChannelEvent::Chat {
                sender_user_id: frame.get("sender_user_id").and_then(serde_json::Value::as_str).unwrap_or_default().to_string(),
                sender_name: frame.get("sender_name").and_then(serde_json::Value::as_str).unwrap_or_default().to_string(),
                text: frame.get("text").and_then(serde_json::Value::as_str).unwrap_or_default().to_string(),
            },
            other => {
                if let Some(kind) = other {
                    warn!(kind, "unhandled channel transport event");
                }
                ChannelEvent::Disconnected
            }
        })
    }
}

struct State {
    channel: Option<ChannelHandle>,
    display_name: String,
    members: HashMap<String, String>,
}

/// Binds one agent to one chat room. Reconnects on a fixed 3s backoff
/// (spec.md §4.7); serializes inbound dispatch through a
/// [`SingleFlightDispatcher`].
pub struct ChannelConnector {
    transport: Arc<dyn ChannelTransport>,
    base_name: String,
    room_name: String,
    password: Option<String>,
    handler: Arc<dyn CommandHandler>,
    dispatcher: SingleFlightDispatcher,
    state: Mutex<State>,
    recent: RollingLog,
}

impl ChannelConnector {
    pub fn new(
        transport: Arc<dyn ChannelTransport>,
        base_name: impl Into<String>,
        room_name: impl Into<String>,
        password: Option<String>,
        handler: Arc<dyn CommandHandler>,
    ) -> Self {
        let base_name = base_name.into();
        Self {
            transport,
            base_name: base_name.clone(),
            room_name: room_name.into(),
            password,
            handler,
            dispatcher: SingleFlightDispatcher::new(64),
            state: Mutex::new(State { channel: None, display_name: base_name, members: HashMap::new() }),
            recent: RollingLog::new(MESSAGE_LOG_CAP_CHARS),
        }
    }

    pub fn get_recent_messages(&self) -> Vec<String> {
        self.recent.snapshot()
    }

    pub fn get_channel_members(&self) -> Vec<Member> {
        self.state
            .lock()
            .expect("channel connector state mutex poisoned")
            .members
            .iter()
            .map(|(name, user_id)| Member { name: name.clone(), user_id: user_id.clone() })
            .collect()
    }

    /// Claims a display name, retrying with a `-<n>` suffix on collision
    /// (spec.md §4.7).
    async fn claim_display_name(&self) -> Result<String, ConnectorError> {
        let mut attempt = 0u32;
        loop {
            let candidate = if attempt == 0 { self.base_name.clone() } else { format!("{}-{}", self.base_name, attempt + 1) };
            match self.transport.set_display_name(&candidate).await {
                Ok(()) => return Ok(candidate),
                Err(ConnectorError::NameTaken) => {
                    attempt += 1;
                    if attempt > 1_000 {
                        return Err(ConnectorError::NameTaken);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One full connect → join → event loop. Returns when the connection
    /// drops or a transport error occurs, so the caller can apply the
    /// reconnect backoff.
    async fn connect_once(&self) -> Result<(), ConnectorError> {
        self.transport.connect().await?;
        let display_name = self.claim_display_name().await?;
        let channel = self.transport.find_or_create_channel(&self.room_name, self.password.as_deref()).await?;
        self.transport.join(&channel).await?;
        let members = self.transport.request_member_list(&channel).await?;

        {
            let mut state = self.state.lock().expect("channel connector state mutex poisoned");
            state.display_name = display_name;
            state.members = members.into_iter().map(|m| (m.name, m.user_id)).collect();
            state.channel = Some(channel.clone());
        }
        info!(room = %self.room_name, "channel connector joined");

        loop {
            let event = self.transport.next_event(&channel).await?;
            match event {
                ChannelEvent::Joined { user_id, name } => {
                    self.state.lock().expect("channel connector state mutex poisoned").members.insert(name, user_id);
                }
                ChannelEvent::Left { name } => {
                    self.state.lock().expect("channel connector state mutex poisoned").members.remove(&name);
                }
                ChannelEvent::Chat { sender_user_id, sender_name, text } => {
                    self.on_chat(&channel, sender_user_id, sender_name, text).await;
                }
                ChannelEvent::Disconnected => return Err(ConnectorError::Disconnected),
            }
        }
    }

    async fn on_chat(&self, channel: &ChannelHandle, sender_user_id: String, sender_name: String, text: String) {
        self.recent.push(format!("{sender_name}: {text}"));

        let own_name = self.state.lock().expect("channel connector state mutex poisoned").display_name.clone();
        if sender_name == own_name {
            return;
        }

        let Some(command) = strip_leading_mention(&text, &own_name) else { return };

        let meta = serde_json::json!({"sender_user_id": sender_user_id});
        let result = self.dispatcher.submit(command, sender_name.clone(), meta, self.handler.clone()).await;
        match result {
            Ok(reply) => {
                if let Err(e) = self.send(channel, &reply).await {
                    warn!(error = %e, "channel connector failed to send reply");
                }
            }
            Err(e) => warn!(error = %e, "channel connector command handler failed"),
        }
    }

    /// Resolves `@name` tokens against the member map and sends the text
    /// in <= 7,500-char chunks, sequentially (spec.md §4.7).
    async fn send(&self, channel: &ChannelHandle, text: &str) -> Result<(), ConnectorError> {
        let mentions = {
            let state = self.state.lock().expect("channel connector state mutex poisoned");
            resolve_mentions(text, &state.members)
        };
        for chunk in chunk_text(text, OUTGOING_CHUNK_CHARS) {
            self.transport.send_text(channel, &chunk, &mentions).await?;
        }
        Ok(())
    }

    /// Runs the reconnect loop until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancelToken) {
        while !cancel.is_cancelled() {
            if let Err(e) = self.connect_once().await {
                warn!(error = %e, "channel connector disconnected, retrying");
                tokio::time::sleep(RECONNECT_BACKOFF).await;
            }
        }
        debug!("channel connector stopped");
    }
}

#[async_trait]
impl BackgroundService for ChannelConnector {
    fn service_name(&self) -> &str {
        "channel_connector"
    }

    async fn run(self: Arc<Self>, cancel: CancelToken) {
        ChannelConnector::run(self, cancel).await
    }
}

#[async_trait]
impl IntegrationContext for ChannelConnector {
    fn recent_messages(&self) -> Vec<String> {
        self.get_recent_messages()
    }

    fn channel_members(&self) -> Vec<String> {
        self.get_channel_members().into_iter().map(|m| m.name).collect()
    }

    async fn post(&self, text: &str) -> Result<(), AgentError> {
        let state = self.state.lock().expect("channel connector state mutex poisoned");
        let Some(channel) = state.channel.clone() else {
            return Err(AgentError::other("channel connector has no active channel"));
        };
        drop(state);
        self.send(&channel, text).await.map_err(|e| AgentError::other(e.to_string()))
    }
}

/// Strips a leading `@name` mention token and returns the remaining
/// command text, or `None` if the bot isn't mentioned (spec.md §4.7:
/// "Inbound chat events reach onCommand only when the bot is mentioned").
fn strip_leading_mention(text: &str, bot_name: &str) -> Option<String> {
    let trimmed = text.trim_start();
    let token = format!("@{bot_name}");
    let rest = trimmed.strip_prefix(&token)?;
    Some(rest.trim_start().to_string())
}

/// Scans `text` for `@name` tokens and resolves each against the member
/// map, producing the mentions to attach to the outgoing message (spec.md
/// §4.7).
fn resolve_mentions(text: &str, members: &HashMap<String, String>) -> Vec<Mention> {
    let mut mentions = Vec::new();
    for word in text.split_whitespace() {
        let Some(name) = word.strip_prefix('@') else { continue };
        let name = name.trim_end_matches(|c: char| !c.is_alphanumeric() && c != '_' && c != '-');
        if let Some(user_id) = members.get(name) {
            mentions.push(Mention { name: name.to_string(), user_id: user_id.clone() });
        }
    }
    mentions
}
