//! Agent construction and execution (C6/C7, spec.md §4.2 / §4.3).

pub mod definition;
pub mod executor;
pub mod react;
pub mod structured_output;

pub use definition::{
    AgentDefinition, AgentResult, AgentResultMetadata, IntegrationConfig, LlmRef, MemoryConfig,
    OutputConfig, OutputFormat, PromptConfig, SkillsConfig, ToolCallSummary, ToolDeclaration,
    TriggerConfig,
};
pub use executor::{
    AgentExecutor, AgentExecutorDeps, InvokeInput, ResolvedSkills, SandboxToolSource, SkillLoader,
    ToolResolver,
};
pub use react::{run_react, run_react_stream, ReactOptions};
