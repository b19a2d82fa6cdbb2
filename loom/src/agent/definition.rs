//! Declarative agent records (spec.md §3 `AgentDefinition`/`AgentResult`,
//! §6 "Agent declaration (YAML, abbreviated)").
//!
//! These are owned by the orchestrator and immutable within a run; the
//! executor only ever borrows one.

use serde::{Deserialize, Serialize};

fn default_version() -> String {
    "1.0.0".into()
}

fn default_true() -> bool {
    true
}

fn default_max_lines() -> usize {
    100
}

/// A named agent as declared in workspace YAML. Field names follow the
/// declaration's own vocabulary (`llm`, `output`, `memory`) rather than
/// the internal `*Config` type names.
#[derive(Clone, Debug, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub llm: LlmRef,
    pub prompt: PromptConfig,
    #[serde(default)]
    pub tools: Vec<ToolDeclaration>,
    #[serde(default)]
    pub skills: Option<SkillsConfig>,
    #[serde(default)]
    pub output: Option<OutputConfig>,
    #[serde(default)]
    pub memory: Option<MemoryConfig>,
    #[serde(default)]
    pub integrations: Vec<IntegrationConfig>,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
}

/// `llm: <string>` or `llm: {name, temperature?}` (spec.md §6).
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum LlmRef {
    Name(String),
    Detailed {
        name: String,
        #[serde(default)]
        temperature: Option<f32>,
    },
}

impl LlmRef {
    pub fn config_name(&self) -> &str {
        match self {
            LlmRef::Name(name) => name,
            LlmRef::Detailed { name, .. } => name,
        }
    }

    /// The model factory's cache key component; 0.7 when unspecified.
    pub fn effective_temperature(&self) -> f32 {
        match self {
            LlmRef::Name(_) => 0.7,
            LlmRef::Detailed { temperature, .. } => temperature.unwrap_or(0.7),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct PromptConfig {
    pub system: String,
    #[serde(default, rename = "inputVariables")]
    pub input_variables: Vec<String>,
}

/// `tools: [<string> | {name, source, config?}]` (spec.md §6).
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum ToolDeclaration {
    Name(String),
    Detailed {
        name: String,
        #[serde(default)]
        source: Option<String>,
        #[serde(default)]
        config: Option<serde_json::Value>,
    },
}

impl ToolDeclaration {
    pub fn name(&self) -> &str {
        match self {
            ToolDeclaration::Name(name) => name,
            ToolDeclaration::Detailed { name, .. } => name,
        }
    }
}

/// `skills: {mode: "all"} | [<string>]` (spec.md §6).
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum SkillsConfig {
    All { mode: String },
    Named(Vec<String>),
}

#[derive(Clone, Debug, Deserialize)]
pub struct OutputConfig {
    pub format: OutputFormat,
    #[serde(default)]
    pub schema: Option<serde_json::Value>,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Text,
    Json,
    Structured,
}

/// `memory: <bool> | {enabled, maxLines}` (spec.md §6). Default `maxLines`
/// is 100 (spec.md §6 "Long-term memory on disk").
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum MemoryConfig {
    Enabled(bool),
    Detailed {
        #[serde(default = "default_true")]
        enabled: bool,
        #[serde(default = "default_max_lines", rename = "maxLines")]
        max_lines: usize,
    },
}

impl MemoryConfig {
    pub fn is_enabled(&self) -> bool {
        match self {
            MemoryConfig::Enabled(enabled) => *enabled,
            MemoryConfig::Detailed { enabled, .. } => *enabled,
        }
    }

    pub fn max_lines(&self) -> usize {
        match self {
            MemoryConfig::Enabled(_) => default_max_lines(),
            MemoryConfig::Detailed { max_lines, .. } => *max_lines,
        }
    }
}

/// Connector-specific fields are resolved by the integrations module;
/// the definition only needs to know which kind and carry its settings.
#[derive(Clone, Debug, Deserialize)]
pub struct IntegrationConfig {
    pub kind: String,
    #[serde(flatten)]
    pub settings: serde_json::Value,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TriggerConfig {
    pub kind: String,
    #[serde(flatten)]
    pub settings: serde_json::Value,
}

/// Per-invocation outcome (spec.md §3 `AgentResult`).
#[derive(Clone, Debug, Serialize)]
pub struct AgentResult {
    pub output: serde_json::Value,
    pub metadata: AgentResultMetadata,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct AgentResultMetadata {
    pub duration_ms: u64,
    pub tool_calls: Vec<ToolCallSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages_in_session: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_output_valid: Option<bool>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ToolCallSummary {
    pub name: String,
    pub input: serde_json::Value,
    pub output: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
name: greeter
description: says hello
llm: gpt4
prompt:
  system: "You are friendly."
  inputVariables: [message]
tools:
  - echo
  - name: search
    source: knowledge
memory:
  enabled: true
  maxLines: 50
"#;

    #[test]
    fn parses_abbreviated_yaml_declaration() {
        let def: AgentDefinition = serde_yaml::from_str(YAML).unwrap();
        assert_eq!(def.name, "greeter");
        assert_eq!(def.version, "1.0.0");
        assert_eq!(def.llm.config_name(), "gpt4");
        assert_eq!(def.llm.effective_temperature(), 0.7);
        assert_eq!(def.prompt.input_variables, vec!["message".to_string()]);
        assert_eq!(def.tools.len(), 2);
        assert_eq!(def.tools[0].name(), "echo");
        assert_eq!(def.tools[1].name(), "search");
        let memory = def.memory.unwrap();
        assert!(memory.is_enabled());
        assert_eq!(memory.max_lines(), 50);
    }

    #[test]
    fn bare_boolean_memory_uses_default_max_lines() {
        let yaml = "name: a\nllm: gpt4\nprompt:\n  system: s\nmemory: true\n";
        let def: AgentDefinition = serde_yaml::from_str(yaml).unwrap();
        let memory = def.memory.unwrap();
        assert!(memory.is_enabled());
        assert_eq!(memory.max_lines(), 100);
    }

    #[test]
    fn detailed_llm_ref_carries_temperature() {
        let yaml = "name: a\nllm:\n  name: gpt4\n  temperature: 0.2\nprompt:\n  system: s\n";
        let def: AgentDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(def.llm.config_name(), "gpt4");
        assert_eq!(def.llm.effective_temperature(), 0.2);
    }
}
