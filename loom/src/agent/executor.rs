//! Per-invocation supervisor (C7, spec.md §4.3): assembles the prompt,
//! history, and tools for one [`AgentDefinition`]; drives the ReAct loop
//! (C6) non-streaming and streaming; persists session and long-term
//! memory; emits structured output.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use super::definition::{
    AgentDefinition, AgentResult, AgentResultMetadata, OutputConfig, OutputFormat, ToolCallSummary,
    ToolDeclaration,
};
use super::react::{self, ReactOptions};
use super::structured_output;
use crate::error::AgentError;
use crate::llm::{CancelToken, ChatModel, LlmUsage, ModelFactory, ToolChoiceMode};
use crate::memory::{memory_instruction_block, LongTermMemory};
use crate::message::{Message, Part};
use crate::store::ConversationStore;
use crate::stream::{Frame, LoopEvent};
use crate::tools::{
    integration_post_tool, knowledge_search_tool, save_memory_tool, IntegrationSink,
    KnowledgeSearch, Tool, ToolCallContext, ToolRegistry,
};

/// Empty-answer sentinel surfaced when the ReAct loop's iteration cap was
/// exceeded without a final ai message (spec.md §7 `IterationCapExceeded`,
/// "not an error": the loop just returns the accumulated messages). The
/// exact wording isn't specified by spec.md; this is the implementer's
/// choice, recorded in DESIGN.md.
const EMPTY_ANSWER_SENTINEL: &str = "(no response: iteration cap exceeded)";

/// Resolves one declared tool entry to a concrete [`Tool`], or `None` if
/// the name/source isn't known to this resolver (logged and skipped by
/// the executor, not fatal). The open sum of tool sources (MCP peers,
/// local code, sandbox executors, knowledge stores) only needs to
/// implement this one interface (spec.md §9).
#[async_trait]
pub trait ToolResolver: Send + Sync {
    async fn resolve(&self, decl: &ToolDeclaration) -> Option<Arc<dyn Tool>>;
}

/// Outcome of resolving an agent's `skills` declaration: a prompt block to
/// append and whether any resolved skill requires sandbox tools.
#[derive(Clone, Debug, Default)]
pub struct ResolvedSkills {
    pub prompt_block: String,
    pub needs_sandbox: bool,
}

#[async_trait]
pub trait SkillLoader: Send + Sync {
    async fn resolve(&self, skills: &super::definition::SkillsConfig) -> Result<ResolvedSkills, AgentError>;
}

/// Mints the sandbox tool set auto-injected when a skill requires one
/// (spec.md §4.3 step 6b). The sandbox container manager itself is an
/// out-of-scope collaborator (spec.md §1); this is the narrow interface
/// the executor consumes.
pub trait SandboxToolSource: Send + Sync {
    fn tools(&self) -> Vec<Arc<dyn Tool>>;
}

/// Collaborators an [`AgentExecutor`] is built from. Every field is
/// optional except the model factory: an agent with no skills, memory,
/// integrations, or sandbox requirement still constructs cleanly.
#[derive(Clone, Default)]
pub struct AgentExecutorDeps {
    pub tool_resolver: Option<Arc<dyn ToolResolver>>,
    pub skill_loader: Option<Arc<dyn SkillLoader>>,
    pub sandbox_tools: Option<Arc<dyn SandboxToolSource>>,
    pub memory: Option<Arc<LongTermMemory>>,
    pub store: Option<Arc<ConversationStore>>,
    pub integration_sink: Option<Arc<dyn IntegrationSink>>,
    pub knowledge: Option<Arc<dyn KnowledgeSearch>>,
}

/// Invocation input: either a plain input-variables object, or the full
/// options record with an explicit session and cancel token (spec.md §4.3
/// "Invocation input").
pub enum InvokeInput {
    Plain(Value),
    Options { input: Value, session_id: Option<String>, cancel: Option<CancelToken> },
}

impl From<Value> for InvokeInput {
    fn from(v: Value) -> Self {
        InvokeInput::Plain(v)
    }
}

impl InvokeInput {
    fn decompose(self) -> (Value, Option<String>, CancelToken) {
        match self {
            InvokeInput::Plain(v) => (v, None, CancelToken::new()),
            InvokeInput::Options { input, session_id, cancel } => (input, session_id, cancel.unwrap_or_default()),
        }
    }
}

/// Assembled, ready-to-invoke agent. Construction (`new`) performs the six
/// steps of spec.md §4.3: skills, memory, model binding, structured
/// output, tool resolution, built-in auto-injection.
pub struct AgentExecutor {
    definition: AgentDefinition,
    system_prompt: String,
    model: Box<dyn ChatModel>,
    tools: ToolRegistry,
    store: Option<Arc<ConversationStore>>,
    max_iterations: usize,
}

impl AgentExecutor {
    pub async fn new(
        definition: AgentDefinition,
        model_factory: &ModelFactory,
        deps: AgentExecutorDeps,
    ) -> Result<Self, AgentError> {
        let mut system_prompt = definition.prompt.system.clone();

        let mut needs_sandbox = false;
        if let (Some(skills), Some(loader)) = (&definition.skills, &deps.skill_loader) {
            let resolved = loader.resolve(skills).await?;
            if !resolved.prompt_block.is_empty() {
                system_prompt.push_str("\n\n");
                system_prompt.push_str(&resolved.prompt_block);
            }
            needs_sandbox = resolved.needs_sandbox;
        }

        let memory_enabled = definition.memory.as_ref().map(|m| m.is_enabled()).unwrap_or(false);
        let max_lines = definition.memory.as_ref().map(|m| m.max_lines()).unwrap_or(100);
        let memory = if memory_enabled { deps.memory.clone() } else { None };

        if let Some(mem) = &memory {
            let content = mem.load(&definition.name).await.map_err(|e| AgentError::other(e.to_string()))?;
            system_prompt.push_str("\n\n");
            system_prompt.push_str(&memory_instruction_block(&content, max_lines));
        }

        let base_model = model_factory
            .get(definition.llm.config_name(), definition.llm.effective_temperature())
            .map_err(|e| AgentError::other(e.to_string()))?;

        let mut tools = ToolRegistry::new();
        if let Some(resolver) = &deps.tool_resolver {
            for decl in &definition.tools {
                match resolver.resolve(decl).await {
                    Some(tool) => tools.register(tool),
                    None => warn!(agent = %definition.name, tool = decl.name(), "tool declaration could not be resolved; skipping"),
                }
            }
        }

        if let Some(mem) = &memory {
            if !tools.contains("save_memory") {
                tools.register(save_memory_tool(mem.clone(), definition.name.clone(), max_lines));
            }
        }
        if needs_sandbox {
            if let Some(sandbox) = &deps.sandbox_tools {
                for t in sandbox.tools() {
                    if !tools.contains(t.name()) {
                        tools.register(t);
                    }
                }
            }
        }
        if !definition.integrations.is_empty() {
            if let Some(sink) = &deps.integration_sink {
                if !tools.contains("integration_post") {
                    tools.register(integration_post_tool(sink.clone()));
                }
            }
        }
        if let Some(knowledge) = &deps.knowledge {
            if !tools.contains("knowledge_search") {
                tools.register(knowledge_search_tool(knowledge.clone()));
            }
        }

        // Advertise the resolved tools to the model before any structured-output
        // wrap (spec.md §4.2): the model only ever emits tool_calls for tools
        // it was bound to.
        let bound_model: Box<dyn ChatModel> = if tools.is_empty() {
            Box::new(base_model.clone())
        } else {
            base_model.bind_tools(tools.specs(), ToolChoiceMode::Auto)
        };

        let model: Box<dyn ChatModel> = match &definition.output {
            Some(OutputConfig { format: OutputFormat::Structured, schema: Some(schema) }) => {
                bound_model.with_structured_output(schema.clone())
            }
            Some(OutputConfig { format: OutputFormat::Structured, schema: None }) => {
                warn!(agent = %definition.name, "structured output configured without a schema; leaving model unwrapped");
                bound_model
            }
            _ => bound_model,
        };

        Ok(Self { definition, system_prompt, model, tools, store: deps.store, max_iterations: 200 })
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    async fn load_history(&self, session_id: Option<&str>) -> Vec<Message> {
        match (&self.store, session_id) {
            (Some(store), Some(sid)) => store.get(sid).await,
            _ => Vec::new(),
        }
    }

    /// Drives model + tools to completion. The ReAct loop generalizes both
    /// of spec.md §4.3's "execution paths": with an empty [`ToolRegistry`]
    /// it is equivalent to one `model.invoke` plus one final ai message
    /// (spec.md §8 round-trip invariant), so one code path serves both.
    async fn run_to_completion(
        &self,
        session_id: Option<&str>,
        human_message: Message,
        cancel: &CancelToken,
    ) -> Result<Vec<Message>, AgentError> {
        let history = self.load_history(session_id).await;
        let ctx = ToolCallContext { recent_messages: history.clone(), session_id: session_id.map(str::to_string) };
        let mut input_messages = history;
        input_messages.push(human_message);
        let options = ReactOptions { max_iterations: self.max_iterations, cancel: cancel.clone() };
        react::run_react(self.model.as_ref(), &self.tools, &self.system_prompt, input_messages, &ctx, &options).await
    }

    /// Non-streaming invocation. Never returns a raw error except
    /// [`AgentError::UserInterrupt`], which propagates unchanged so the
    /// caller can persist the in-flight state and arrange resumption
    /// (spec.md §7). Every other failure becomes an `AgentResult` with a
    /// diagnostic `output` string.
    pub async fn invoke(&self, input: impl Into<InvokeInput>) -> Result<AgentResult, AgentError> {
        let started = Instant::now();
        let (input_value, session_id, cancel) = input.into().decompose();
        let text = render_user_text(&self.definition.prompt.input_variables, &input_value);
        let human_message = build_human_message(&text, &input_value);

        if let (Some(store), Some(sid)) = (&self.store, session_id.as_deref()) {
            store.add(sid, Message::human(text.clone())).await;
        }

        match self.run_to_completion(session_id.as_deref(), human_message, &cancel).await {
            Ok(messages) => Ok(self.finalize(&messages, session_id, started).await),
            Err(AgentError::UserInterrupt(msg)) => Err(AgentError::UserInterrupt(msg)),
            Err(err) => Ok(self.diagnostic_result(&err.to_string(), session_id, started)),
        }
    }

    fn diagnostic_result(&self, message: &str, session_id: Option<String>, started: Instant) -> AgentResult {
        AgentResult {
            output: Value::String(format!("Agent error: {message}")),
            metadata: AgentResultMetadata {
                duration_ms: started.elapsed().as_millis() as u64,
                tool_calls: Vec::new(),
                session_id,
                messages_in_session: None,
                structured_output_valid: None,
            },
        }
    }

    /// Persists the ai turn and assembles the public result from the
    /// loop's final message chain.
    async fn finalize(&self, messages: &[Message], session_id: Option<String>, started: Instant) -> AgentResult {
        let cap_exceeded = !matches!(messages.last(), Some(Message::Ai { .. }));
        let final_text =
            if cap_exceeded { EMPTY_ANSWER_SENTINEL.to_string() } else { messages.last().unwrap().content_to_text() };

        let summaries = extract_tool_summaries(messages);
        let (output, structured_valid) = self.compose_result_value(&final_text);
        let persisted = composed_session_text(&self.definition, &final_text, &summaries, &output);

        if let (Some(store), Some(sid)) = (&self.store, session_id.as_deref()) {
            store.add(sid, Message::ai(persisted)).await;
        }

        let messages_in_session = match (&self.store, session_id.as_deref()) {
            (Some(store), Some(sid)) => Some(store.count(sid).await),
            _ => None,
        };

        AgentResult {
            output,
            metadata: AgentResultMetadata {
                duration_ms: started.elapsed().as_millis() as u64,
                tool_calls: summaries,
                session_id,
                messages_in_session,
                structured_output_valid: structured_valid,
            },
        }
    }

    fn compose_result_value(&self, final_text: &str) -> (Value, Option<bool>) {
        match &self.definition.output {
            Some(OutputConfig { format: OutputFormat::Json, .. }) => {
                (structured_output::extract(&serde_json::json!({"content": final_text})), None)
            }
            Some(OutputConfig { format: OutputFormat::Structured, schema }) => {
                let extracted = structured_output::extract(&serde_json::json!({"content": final_text}));
                let valid = schema.as_ref().map(|s| structured_output::validate_shape(&extracted, s));
                (extracted, valid)
            }
            _ => (Value::String(final_text.to_string()), None),
        }
    }

    /// Streaming invocation. Mirrors `invoke`'s persistence discipline but
    /// emits a sequence of [`Frame`]s (spec.md §4.3 "Streaming"). Requires
    /// `Arc<Self>` because the ReAct loop runs on a spawned task while the
    /// generator forwards its events.
    pub fn stream(self: Arc<Self>, input: impl Into<InvokeInput>) -> Pin<Box<dyn Stream<Item = Frame> + Send>> {
        let (input_value, session_id, cancel) = input.into().decompose();
        let text = render_user_text(&self.definition.prompt.input_variables, &input_value);
        let human_message = build_human_message(&text, &input_value);

        Box::pin(async_stream::stream! {
            if let (Some(store), Some(sid)) = (&self.store, session_id.as_deref()) {
                store.add(sid, Message::human(text.clone())).await;
            }

            let history = self.load_history(session_id.as_deref()).await;
            let ctx = ToolCallContext { recent_messages: history.clone(), session_id: session_id.clone() };
            let mut input_messages = history;
            input_messages.push(human_message);
            let options = ReactOptions { max_iterations: self.max_iterations, cancel: cancel.clone() };

            let (event_tx, mut event_rx) = mpsc::channel::<LoopEvent>(64);
            let exec = Arc::clone(&self);
            let join = tokio::spawn(async move {
                react::run_react_stream(
                    exec.model.as_ref(),
                    &exec.tools,
                    &exec.system_prompt,
                    input_messages,
                    &ctx,
                    &options,
                    event_tx,
                )
                .await
            });

            let mut accumulated_text = String::new();
            let mut usage_total = LlmUsage::default();
            let mut pending_tool_inputs: HashMap<String, (String, Value)> = HashMap::new();
            let mut summaries: Vec<ToolCallSummary> = Vec::new();

            while let Some(event) = event_rx.recv().await {
                match event {
                    LoopEvent::ModelChunk(chunk) => {
                        if let Some(c) = chunk.content {
                            if !c.is_empty() {
                                accumulated_text.push_str(&c);
                                yield Frame::Content { content: c };
                            }
                        }
                        if let Some(r) = chunk.reasoning {
                            if !r.is_empty() {
                                yield Frame::Thinking { content: r };
                            }
                        }
                    }
                    LoopEvent::ModelEnd { usage, .. } => {
                        if let Some(u) = usage {
                            usage_total = usage_total + u;
                        }
                    }
                    LoopEvent::ToolStart { run_id, name, input } => {
                        pending_tool_inputs.insert(run_id.clone(), (name.clone(), input.clone()));
                        yield Frame::ToolStart { run_id, name, input };
                    }
                    LoopEvent::ToolEnd { run_id, name, output } => {
                        if let Some((tname, tinput)) = pending_tool_inputs.remove(&run_id) {
                            summaries.push(ToolCallSummary { name: tname, input: tinput, output: output.clone() });
                        }
                        yield Frame::ToolEnd { run_id, name, output };
                    }
                }
            }

            yield Frame::Usage { usage: usage_total };

            match join.await {
                Ok(Ok(messages)) => {
                    let result = self.finalize(&messages, session_id.clone(), Instant::now()).await;
                    if matches!(
                        self.definition.output.as_ref().map(|o| o.format),
                        Some(OutputFormat::Json) | Some(OutputFormat::Structured)
                    ) {
                        yield Frame::Result { output: result.output };
                    }
                }
                Ok(Err(AgentError::UserInterrupt(msg))) => {
                    yield Frame::Error { error: format!("user interrupt: {msg}") };
                }
                Ok(Err(err)) => {
                    let persisted = if accumulated_text.is_empty() && summaries.is_empty() {
                        "(agent encountered an error)".to_string()
                    } else if summaries.is_empty() {
                        accumulated_text.clone()
                    } else {
                        format!(
                            "{accumulated_text}\n\n<tool_history>\n{}\n</tool_history>",
                            compose_tool_history(&summaries)
                        )
                    };
                    if let (Some(store), Some(sid)) = (&self.store, session_id.as_deref()) {
                        store.add(sid, Message::ai(persisted)).await;
                    }
                    yield Frame::Error { error: err.to_string() };
                }
                Err(join_err) => {
                    yield Frame::Error { error: join_err.to_string() };
                }
            }
        })
    }
}

/// Renders the user-visible message text from declared input variables
/// (spec.md §4.3 "Invocation input"): zero variables JSON-encodes the
/// whole input; one variable renders its value as a plain string; many
/// variables render `"var: value"` lines.
fn render_user_text(input_variables: &[String], input: &Value) -> String {
    match input_variables.len() {
        0 => serde_json::to_string(input).unwrap_or_else(|_| "{}".to_string()),
        1 => input.get(&input_variables[0]).map(value_to_plain_string).unwrap_or_default(),
        _ => input_variables
            .iter()
            .map(|var| format!("{var}: {}", input.get(var).map(value_to_plain_string).unwrap_or_default()))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn value_to_plain_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Promotes the human message to multipart content when the input carries
/// an `attachments` array of `{data, mediaType}` image entries (spec.md
/// §4.3). Attachments are never persisted to the session — only the text
/// is stored.
fn build_human_message(text: &str, input: &Value) -> Message {
    let attachments = input.get("attachments").and_then(Value::as_array).filter(|a| !a.is_empty());
    let Some(attachments) = attachments else {
        return Message::human(text);
    };

    let mut parts = vec![Part::Text { text: text.to_string() }];
    for att in attachments {
        if let (Some(data), Some(media_type)) =
            (att.get("data").and_then(Value::as_str), att.get("mediaType").and_then(Value::as_str))
        {
            parts.push(Part::Image { image_base64: data.to_string(), media_type: media_type.to_string() });
        }
    }
    Message::human_parts(parts)
}

/// Joins each ai message's tool_calls to the matching tool message by
/// `tool_call_id` (spec.md §4.3 "with tools" path, §8 invariant).
fn extract_tool_summaries(messages: &[Message]) -> Vec<ToolCallSummary> {
    let mut summaries = Vec::new();
    for msg in messages {
        if let Message::Ai { tool_calls, .. } = msg {
            for call in tool_calls {
                let output = messages.iter().find_map(|m| match m {
                    Message::Tool { content, tool_call_id, .. } if tool_call_id == &call.id => Some(content.to_text()),
                    _ => None,
                });
                if let Some(output) = output {
                    summaries.push(ToolCallSummary { name: call.name.clone(), input: call.args.clone(), output });
                }
            }
        }
    }
    summaries
}

/// `[Tool: name] Input: <200> → Output: <500>` lines, one per call
/// (spec.md §6 "Stored session message format for a tool-using turn").
fn compose_tool_history(summaries: &[ToolCallSummary]) -> String {
    summaries
        .iter()
        .map(|s| format!("[Tool: {}] Input: {} → Output: {}", s.name, truncate(&s.input.to_string(), 200), truncate(&s.output, 500)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Truncates to at most `max` chars, appending a trailing `...` marker
/// when the limit is exceeded (spec.md §6).
fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    if max <= 3 {
        return s.chars().take(max).collect();
    }
    let head: String = s.chars().take(max - 3).collect();
    format!("{head}...")
}

/// The ai message actually written to the session. When no tools were
/// called, this is the response string (or its JSON encoding for
/// json/structured output, spec.md §4.3 "without tools" path); when tools
/// were called, this is always the raw final text plus `<tool_history>`,
/// regardless of output format (spec.md §4.3 "with tools" path — the
/// stored transcript stays human-readable even when the public result is
/// structured).
fn composed_session_text(
    definition: &AgentDefinition,
    final_text: &str,
    summaries: &[ToolCallSummary],
    output: &Value,
) -> String {
    if summaries.is_empty() {
        match &definition.output {
            Some(OutputConfig { format: OutputFormat::Json, .. })
            | Some(OutputConfig { format: OutputFormat::Structured, .. }) => {
                serde_json::to_string(output).unwrap_or_else(|_| final_text.to_string())
            }
            _ => final_text.to_string(),
        }
    } else {
        format!("{final_text}\n\n<tool_history>\n{}\n</tool_history>", compose_tool_history(summaries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::definition::{LlmRef, PromptConfig};
    use crate::error::ToolSourceError;
    use crate::llm::MockLlm;
    use crate::tools::{ToolOutput, ToolSpec};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn base_definition(input_variables: Vec<&str>) -> AgentDefinition {
        AgentDefinition {
            name: "greeter".into(),
            description: String::new(),
            version: "1.0.0".into(),
            llm: LlmRef::Name("mock".into()),
            prompt: PromptConfig {
                system: "be nice".into(),
                input_variables: input_variables.into_iter().map(String::from).collect(),
            },
            tools: Vec::new(),
            skills: None,
            output: None,
            memory: None,
            integrations: Vec::new(),
            triggers: Vec::new(),
        }
    }

    fn executor_with_model(definition: AgentDefinition, model: Box<dyn ChatModel>) -> AgentExecutor {
        AgentExecutor { definition, system_prompt: "be nice".into(), model, tools: ToolRegistry::new(), store: None, max_iterations: 200 }
    }

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn spec(&self) -> ToolSpec {
            ToolSpec { name: "echo".into(), description: "echoes".into(), schema: serde_json::json!({}) }
        }
        async fn call(&self, args: Value, _ctx: &ToolCallContext) -> Result<ToolOutput, ToolSourceError> {
            Ok(ToolOutput::text(args.get("text").and_then(Value::as_str).unwrap_or("").to_string()))
        }
    }

    #[tokio::test]
    async fn tool_less_single_turn_returns_plain_output() {
        let model = MockLlm::with_no_tool_calls("hello");
        let executor = executor_with_model(base_definition(vec!["q"]), Box::new(model));

        let result = executor.invoke(serde_json::json!({"q": "hi"})).await.unwrap();

        assert_eq!(result.output, Value::String("hello".into()));
        assert!(result.metadata.session_id.is_none());
        assert!(result.metadata.tool_calls.is_empty());
    }

    #[tokio::test]
    async fn two_turn_tool_use_composes_tool_history() {
        let model = MockLlm::first_tool_call_then("echo", serde_json::json!({"text": "x"}), "got x");
        let mut executor = executor_with_model(base_definition(vec![]), Box::new(model));
        executor.tools.register(Arc::new(EchoTool));

        let result = executor.invoke(serde_json::json!({})).await.unwrap();

        assert_eq!(result.output, Value::String("got x".into()));
        assert_eq!(result.metadata.tool_calls.len(), 1);
        assert_eq!(result.metadata.tool_calls[0].output, "x");
    }

    #[tokio::test]
    async fn session_continuity_grows_fifo_across_two_calls() {
        let model = MockLlm::new(vec![
            crate::llm::ChatModelResponse { content: "hello".into(), reasoning: None, tool_calls: vec![], usage: None },
            crate::llm::ChatModelResponse { content: "hi again".into(), reasoning: None, tool_calls: vec![], usage: None },
        ]);
        let mut executor = executor_with_model(base_definition(vec!["q"]), Box::new(model));
        let store = ConversationStore::new(100, None);
        executor.store = Some(store.clone());

        let opts1 = InvokeInput::Options { input: serde_json::json!({"q": "hi"}), session_id: Some("s1".into()), cancel: None };
        let r1 = executor.invoke(opts1).await.unwrap();
        assert_eq!(r1.metadata.messages_in_session, Some(2));

        let opts2 =
            InvokeInput::Options { input: serde_json::json!({"q": "again"}), session_id: Some("s1".into()), cancel: None };
        let r2 = executor.invoke(opts2).await.unwrap();
        assert_eq!(r2.metadata.messages_in_session, Some(4));

        let history = store.get("s1").await;
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].content_to_text(), "hi");
        assert_eq!(history[1].content_to_text(), "hello");
        assert_eq!(history[2].content_to_text(), "again");
        assert_eq!(history[3].content_to_text(), "hi again");
    }

    #[test]
    fn render_user_text_empty_input_zero_variables_is_empty_object() {
        assert_eq!(render_user_text(&[], &serde_json::json!({})), "{}");
    }

    #[test]
    fn render_user_text_single_variable_missing_value_is_empty_string() {
        assert_eq!(render_user_text(&["q".to_string()], &serde_json::json!({})), "");
    }

    #[test]
    fn render_user_text_multiple_variables_join_with_newlines() {
        let input = serde_json::json!({"a": "1", "b": "2"});
        assert_eq!(render_user_text(&["a".to_string(), "b".to_string()], &input), "a: 1\nb: 2");
    }

    #[tokio::test]
    async fn max_iterations_one_with_forced_tool_call_ends_on_tool_message() {
        let model = MockLlm::new(vec![crate::llm::ChatModelResponse {
            content: String::new(),
            reasoning: None,
            tool_calls: vec![crate::message::ToolCall { id: "c".into(), name: "echo".into(), args: serde_json::json!({"text": "x"}) }],
            usage: None,
        }]);
        let mut executor = executor_with_model(base_definition(vec![]), Box::new(model));
        executor.tools.register(Arc::new(EchoTool));
        executor.max_iterations = 1;

        let result = executor.invoke(serde_json::json!({})).await.unwrap();

        // Iteration cap hit without a final ai message -> empty-answer sentinel.
        assert_eq!(result.output, Value::String(EMPTY_ANSWER_SENTINEL.into()));
    }

    #[tokio::test]
    async fn cancellation_surfaces_diagnostic_output_without_throwing() {
        let model = MockLlm::with_no_tool_calls("never reached");
        let executor = executor_with_model(base_definition(vec!["q"]), Box::new(model));
        let cancel = CancelToken::new();
        cancel.cancel();

        let opts = InvokeInput::Options { input: serde_json::json!({"q": "hi"}), session_id: None, cancel: Some(cancel) };
        let result = executor.invoke(opts).await.unwrap();

        assert_eq!(result.output, Value::String("Agent error: Request was aborted".into()));
    }

    #[tokio::test]
    async fn user_interrupt_propagates_as_error_not_a_result() {
        struct InterruptingTool;
        #[async_trait]
        impl Tool for InterruptingTool {
            fn name(&self) -> &str {
                "ask_human"
            }
            fn spec(&self) -> ToolSpec {
                ToolSpec { name: "ask_human".into(), description: "".into(), schema: serde_json::json!({}) }
            }
            async fn call(&self, _args: Value, _ctx: &ToolCallContext) -> Result<ToolOutput, ToolSourceError> {
                Err(ToolSourceError::Interrupt("need approval".into()))
            }
        }

        let model = MockLlm::first_tool_call_then("ask_human", serde_json::json!({}), "unreachable");
        let mut executor = executor_with_model(base_definition(vec![]), Box::new(model));
        executor.tools.register(Arc::new(InterruptingTool));

        let err = executor.invoke(serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, AgentError::UserInterrupt(msg) if msg == "need approval"));
    }

    #[tokio::test]
    async fn structured_output_validity_matches_schema() {
        let model = MockLlm::with_no_tool_calls(r#"{"name":"Alice","age":"30"}"#);
        let mut definition = base_definition(vec![]);
        definition.output = Some(OutputConfig {
            format: OutputFormat::Structured,
            schema: Some(serde_json::json!({
                "required": ["name"],
                "properties": {"name": {"type": "string"}, "age": {"type": "number"}}
            })),
        });
        let executor = executor_with_model(definition, Box::new(model));

        let result = executor.invoke(serde_json::json!({})).await.unwrap();

        assert_eq!(result.metadata.structured_output_valid, Some(false));
        assert_eq!(result.output, serde_json::json!({"name": "Alice", "age": "30"}));
    }

    #[tokio::test]
    async fn streaming_emits_content_then_usage_then_result() {
        let model = MockLlm::with_no_tool_calls("streamed").with_stream_by_char();
        let mut definition = base_definition(vec![]);
        definition.output = Some(OutputConfig { format: OutputFormat::Json, schema: None });
        let executor = Arc::new(executor_with_model(definition, Box::new(model)));

        use futures::StreamExt;
        let mut frames = executor.stream(serde_json::json!({}));
        let mut saw_content = false;
        let mut saw_usage = false;
        let mut saw_result = false;
        let got_result = AtomicBool::new(false);
        while let Some(frame) = frames.next().await {
            match frame {
                Frame::Content { .. } => saw_content = true,
                Frame::Usage { .. } => saw_usage = true,
                Frame::Result { output } => {
                    saw_result = true;
                    got_result.store(output == serde_json::json!({"content": "streamed"}), Ordering::SeqCst);
                }
                _ => {}
            }
        }
        assert!(saw_content && saw_usage && saw_result);
        assert!(got_result.load(Ordering::SeqCst));
    }
}
