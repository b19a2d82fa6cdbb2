//! Loom: declarative agent orchestration core.
//!
//! This crate is the subsystem spec.md §1 calls "the core": given an
//! [`agent::AgentDefinition`] and a user input, it produces a response —
//! including multi-turn tool use, streaming, session memory, structured
//! output, long-term memory persistence, and cancellation. It does not
//! discover agent declarations from a workspace, serve HTTP, run a
//! sandbox, or speak to vector stores or MCP peers; those are named
//! interfaces the core consumes ([`tools::Tool`], [`agent::ToolResolver`],
//! [`agent::SkillLoader`], [`agent::SandboxToolSource`],
//! [`tools::KnowledgeSearch`]) and are wired in by whatever embeds this
//! crate.
//!
//! Module map, mirroring spec.md §2's component table:
//!
//! | Component | Module |
//! |---|---|
//! | C1 Message & Tool types | [`message`], [`tools`] |
//! | C2 ChatModel adapters | [`llm`] |
//! | C3 ConversationStore | [`store`] |
//! | C4 LongTermMemory | [`memory`] |
//! | C5 ToolRegistry & built-ins | [`tools`] |
//! | C6 ReAct loop | [`agent::react`] |
//! | C7 AgentExecutor | [`agent::executor`] |
//! | C8 Integration connectors | [`integrations`] |
//! | C9 Trigger dispatcher | [`triggers`] |
//! | C10 Orchestrator | [`orchestrator`] |

pub mod agent;
pub mod error;
pub mod integrations;
pub mod llm;
pub mod memory;
pub mod message;
pub mod orchestrator;
pub mod store;
pub mod stream;
pub mod tools;
pub mod triggers;

pub use agent::{AgentDefinition, AgentExecutor, AgentResult, InvokeInput};
pub use error::{AgentError, MemoryError, StoreError, ToolSourceError};
pub use llm::{CancelToken, ChatModel, ChatModelResponse, ModelConfig, ModelFactory};
pub use memory::LongTermMemory;
pub use message::{Content, Message, Part, ToolCall};
pub use orchestrator::Orchestrator;
pub use store::ConversationStore;
pub use stream::Frame;
pub use tools::{Tool, ToolRegistry};
