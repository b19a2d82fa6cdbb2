//! Crate-wide error types.
//!
//! `AgentError` is the only error type that crosses the ReAct loop / agent
//! executor boundary. Tool errors never surface here directly (spec §7:
//! tool errors are recoverable and handed back to the model as context);
//! `AgentError` is reserved for transport failures, cancellation, and the
//! distinguished `UserInterrupt`.

use thiserror::Error;

/// Errors that can terminate a ReAct loop turn or an agent invocation.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The caller's cancel token fired. Checked at every suspension point
    /// (model call, tool call, stream step).
    #[error("Request was aborted")]
    Cancelled,

    /// The chat-model adapter's transport failed (network, auth, rate limit).
    #[error("model transport error: {0}")]
    ModelTransport(String),

    /// A tool raised a distinguished interrupt requesting human input.
    /// Propagates past the ReAct loop unchanged; the caller persists the
    /// in-flight state and is responsible for resumption.
    #[error("user interrupt: {0}")]
    UserInterrupt(String),

    /// Any other unexpected failure (serialization, io, etc).
    #[error("{0}")]
    Other(String),
}

impl AgentError {
    pub fn other(msg: impl Into<String>) -> Self {
        AgentError::Other(msg.into())
    }
}

/// Errors raised by a [`crate::tools::Tool`] invocation.
///
/// Never propagated to the caller of [`crate::agent::AgentExecutor`] — the
/// ReAct loop catches these and appends a tool message with
/// `Error: <message>` (spec §4.2 step 5c), except [`ToolSourceError::Interrupt`]
/// which is rethrown as [`AgentError::UserInterrupt`].
#[derive(Debug, Error)]
pub enum ToolSourceError {
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("user interrupt: {0}")]
    Interrupt(String),
}

/// Errors raised by [`crate::store::ConversationStore`] operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(String),
}

/// Errors raised by [`crate::memory::LongTermMemory`] operations.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
