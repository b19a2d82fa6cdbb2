//! The bounded think/act loop (C6, spec.md §4.2): drives a [`ChatModel`]
//! against a [`ToolRegistry`] until the model stops requesting tools, the
//! iteration cap is hit, or a tool raises a user interrupt.

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::{AgentError, ToolSourceError};
use crate::llm::{CancelToken, ChatModel};
use crate::message::{Message, ToolCall};
use crate::stream::{LoopEvent, ModelChunk};
use crate::tools::{ToolCallContext, ToolRegistry};

/// Loop-level knobs threaded through both the non-streaming and streaming
/// variants.
#[derive(Clone, Debug)]
pub struct ReactOptions {
    /// Exceeding this terminates the loop without a final ai message
    /// (spec.md §4.2 "Iteration cap"). Defaults to 200.
    pub max_iterations: usize,
    pub cancel: CancelToken,
}

impl Default for ReactOptions {
    fn default() -> Self {
        Self { max_iterations: 200, cancel: CancelToken::new() }
    }
}

/// Runs the loop to completion, returning the full message history
/// (system message, then the alternating ai/tool turns). Non-streaming:
/// the model is called with `invoke`.
pub async fn run_react(
    model: &dyn ChatModel,
    tools: &ToolRegistry,
    system_prompt: &str,
    input_messages: Vec<Message>,
    ctx: &ToolCallContext,
    options: &ReactOptions,
) -> Result<Vec<Message>, AgentError> {
    let mut messages = Vec::with_capacity(input_messages.len() + 1);
    messages.push(Message::system(system_prompt));
    messages.extend(input_messages);

    for iteration in 0..options.max_iterations {
        if options.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        trace!(iteration, message_count = messages.len(), "react: invoking model");
        let response = model.invoke(&messages).await?;
        messages.push(Message::ai_with_tool_calls(response.content.clone(), response.tool_calls.clone()));

        if response.tool_calls.is_empty() {
            debug!(iteration, "react: no tool_calls, terminating with final answer");
            return Ok(messages);
        }

        for call in &response.tool_calls {
            if options.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            messages.push(dispatch_tool_call(tools, ctx, call).await?);
        }
    }

    warn!(max_iterations = options.max_iterations, "react: iteration cap exceeded without a final answer");
    Ok(messages)
}

/// Same algorithm, driven via `model.stream` and emitting [`LoopEvent`]s
/// as the loop progresses. Returns the final message history once the
/// loop terminates, same as [`run_react`].
pub async fn run_react_stream(
    model: &dyn ChatModel,
    tools: &ToolRegistry,
    system_prompt: &str,
    input_messages: Vec<Message>,
    ctx: &ToolCallContext,
    options: &ReactOptions,
    events: mpsc::Sender<LoopEvent>,
) -> Result<Vec<Message>, AgentError> {
    let mut messages = Vec::with_capacity(input_messages.len() + 1);
    messages.push(Message::system(system_prompt));
    messages.extend(input_messages);

    for iteration in 0..options.max_iterations {
        if options.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        trace!(iteration, message_count = messages.len(), "react: streaming model turn");
        let response = stream_one_turn(model, &messages, &options.cancel, &events).await?;
        messages.push(Message::ai_with_tool_calls(response.0.clone(), response.1.clone()));

        if response.1.is_empty() {
            debug!(iteration, "react: no tool_calls, terminating with final answer");
            return Ok(messages);
        }

        for call in &response.1 {
            if options.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            let run_id = Uuid::new_v4().to_string();
            let _ = events
                .send(LoopEvent::ToolStart { run_id: run_id.clone(), name: call.name.clone(), input: call.args.clone() })
                .await;

            let tool_message = dispatch_tool_call(tools, ctx, call).await?;
            let output = tool_message.content_to_text();
            let _ = events.send(LoopEvent::ToolEnd { run_id, name: call.name.clone(), output }).await;

            messages.push(tool_message);
        }
    }

    warn!(max_iterations = options.max_iterations, "react: iteration cap exceeded without a final answer");
    Ok(messages)
}

/// Drives one `model.stream` call, forwarding content/reasoning deltas as
/// [`LoopEvent::ModelChunk`]s and emitting a single [`LoopEvent::ModelEnd`]
/// once the turn completes. Tool-call argument fragments are not forwarded
/// as loop events; only the accumulated `tool_calls` on `model_end` matter
/// to callers (spec.md §4.2 event table).
async fn stream_one_turn(
    model: &dyn ChatModel,
    messages: &[Message],
    cancel: &CancelToken,
    events: &mpsc::Sender<LoopEvent>,
) -> Result<(String, Vec<ToolCall>), AgentError> {
    let (chunk_tx, mut chunk_rx) = mpsc::channel::<ModelChunk>(32);
    let forward_events = events.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(chunk) = chunk_rx.recv().await {
            let _ = forward_events.send(LoopEvent::ModelChunk(chunk)).await;
        }
    });

    let result = model.stream(messages, Some(chunk_tx), None, cancel).await;
    let _ = forwarder.await;
    let response = result?;

    let _ = events
        .send(LoopEvent::ModelEnd {
            full_content: response.content.clone(),
            tool_calls: response.tool_calls.clone(),
            usage: response.usage,
        })
        .await;

    Ok((response.content, response.tool_calls))
}

/// Resolves and invokes a single tool call, translating the outcome into
/// the tool message the model sees next turn (spec.md §4.2 step 5).
/// `Err` only for [`ToolSourceError::Interrupt`], rethrown as
/// [`AgentError::UserInterrupt`] for the caller to persist and resume.
async fn dispatch_tool_call(
    tools: &ToolRegistry,
    ctx: &ToolCallContext,
    call: &ToolCall,
) -> Result<Message, AgentError> {
    let Some(tool) = tools.get(&call.name) else {
        return Ok(Message::tool(format!("Tool \"{}\" not found", call.name), call.id.clone(), call.name.clone()));
    };

    match tool.call(call.args.clone(), ctx).await {
        Ok(output) => Ok(Message::tool(output.to_text(), call.id.clone(), call.name.clone())),
        Err(ToolSourceError::Interrupt(msg)) => Err(AgentError::UserInterrupt(msg)),
        Err(err) => Ok(Message::tool(format!("Error: {err}"), call.id.clone(), call.name.clone())),
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::llm::MockLlm;
    use crate::tools::{Tool, ToolOutput, ToolSpec};

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn spec(&self) -> ToolSpec {
            ToolSpec { name: "echo".into(), description: "echoes input".into(), schema: serde_json::json!({}) }
        }

        async fn call(&self, args: serde_json::Value, _ctx: &ToolCallContext) -> Result<ToolOutput, ToolSourceError> {
            Ok(ToolOutput::text(args.to_string()))
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "boom"
        }

        fn spec(&self) -> ToolSpec {
            ToolSpec { name: "boom".into(), description: "always fails".into(), schema: serde_json::json!({}) }
        }

        async fn call(&self, _args: serde_json::Value, _ctx: &ToolCallContext) -> Result<ToolOutput, ToolSourceError> {
            Err(ToolSourceError::Execution("kaboom".into()))
        }
    }

    struct InterruptingTool;

    #[async_trait]
    impl Tool for InterruptingTool {
        fn name(&self) -> &str {
            "ask_human"
        }

        fn spec(&self) -> ToolSpec {
            ToolSpec { name: "ask_human".into(), description: "needs a human".into(), schema: serde_json::json!({}) }
        }

        async fn call(&self, _args: serde_json::Value, _ctx: &ToolCallContext) -> Result<ToolOutput, ToolSourceError> {
            Err(ToolSourceError::Interrupt("need approval".into()))
        }
    }

    #[tokio::test]
    async fn terminates_immediately_when_no_tool_calls() {
        let model = MockLlm::with_no_tool_calls("hi there");
        let tools = ToolRegistry::new();
        let ctx = ToolCallContext::default();
        let options = ReactOptions::default();

        let messages =
            run_react(&model, &tools, "be nice", vec![Message::human("hello")], &ctx, &options).await.unwrap();

        assert_eq!(messages.len(), 3); // system, human, ai
        assert!(messages.last().unwrap().is_ai());
        assert_eq!(messages.last().unwrap().content_to_text(), "hi there");
    }

    #[tokio::test]
    async fn dispatches_tool_then_returns_final_answer() {
        let model = MockLlm::first_tool_call_then("echo", serde_json::json!({"x": 1}), "done");
        let mut tools = ToolRegistry::new();
        tools.register(std::sync::Arc::new(EchoTool));
        let ctx = ToolCallContext::default();
        let options = ReactOptions::default();

        let messages =
            run_react(&model, &tools, "sys", vec![Message::human("go")], &ctx, &options).await.unwrap();

        // system, human, ai(tool_call), tool, ai(final)
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[3].content_to_text(), "{\"x\":1}");
        assert_eq!(messages[4].content_to_text(), "done");
    }

    #[tokio::test]
    async fn unknown_tool_name_produces_not_found_message_and_continues() {
        let model = MockLlm::first_tool_call_then("missing", serde_json::json!({}), "fallback");
        let tools = ToolRegistry::new();
        let ctx = ToolCallContext::default();
        let options = ReactOptions::default();

        let messages =
            run_react(&model, &tools, "sys", vec![Message::human("go")], &ctx, &options).await.unwrap();

        assert_eq!(messages[3].content_to_text(), "Tool \"missing\" not found");
        assert_eq!(messages[4].content_to_text(), "fallback");
    }

    #[tokio::test]
    async fn failing_tool_produces_error_message_and_continues() {
        let model = MockLlm::first_tool_call_then("boom", serde_json::json!({}), "recovered");
        let mut tools = ToolRegistry::new();
        tools.register(std::sync::Arc::new(FailingTool));
        let ctx = ToolCallContext::default();
        let options = ReactOptions::default();

        let messages =
            run_react(&model, &tools, "sys", vec![Message::human("go")], &ctx, &options).await.unwrap();

        assert_eq!(messages[3].content_to_text(), "Error: execution failed: kaboom");
        assert_eq!(messages[4].content_to_text(), "recovered");
    }

    #[tokio::test]
    async fn interrupting_tool_rethrows_as_user_interrupt() {
        let model = MockLlm::first_tool_call_then("ask_human", serde_json::json!({}), "unreachable");
        let mut tools = ToolRegistry::new();
        tools.register(std::sync::Arc::new(InterruptingTool));
        let ctx = ToolCallContext::default();
        let options = ReactOptions::default();

        let err = run_react(&model, &tools, "sys", vec![Message::human("go")], &ctx, &options).await.unwrap_err();
        assert!(matches!(err, AgentError::UserInterrupt(msg) if msg == "need approval"));
    }

    #[tokio::test]
    async fn exceeding_iteration_cap_stops_without_final_answer() {
        // Every turn returns a tool_call, so the loop never sees an empty
        // tool_calls response and must be stopped by the cap instead.
        let model = MockLlm::new(vec![crate::llm::ChatModelResponse {
            content: String::new(),
            reasoning: None,
            tool_calls: vec![ToolCall { id: "c".into(), name: "echo".into(), args: serde_json::json!({}) }],
            usage: None,
        }]);
        let mut tools = ToolRegistry::new();
        tools.register(std::sync::Arc::new(EchoTool));
        let ctx = ToolCallContext::default();
        let options = ReactOptions { max_iterations: 3, cancel: CancelToken::new() };

        let messages =
            run_react(&model, &tools, "sys", vec![Message::human("go")], &ctx, &options).await.unwrap();

        // 1 system + 1 human + 3 * (ai + tool), no trailing final-answer ai.
        assert_eq!(messages.len(), 2 + 3 * 2);
        assert!(!messages.last().unwrap().is_ai());
    }

    #[tokio::test]
    async fn cancel_before_first_iteration_raises_cancelled() {
        let model = MockLlm::with_no_tool_calls("never reached");
        let tools = ToolRegistry::new();
        let ctx = ToolCallContext::default();
        let cancel = CancelToken::new();
        cancel.cancel();
        let options = ReactOptions { max_iterations: 200, cancel };

        let err = run_react(&model, &tools, "sys", vec![Message::human("go")], &ctx, &options).await.unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }

    #[tokio::test]
    async fn streaming_variant_emits_model_chunks_and_tool_events() {
        let model = MockLlm::first_tool_call_then("echo", serde_json::json!({"a": 1}), "all done").with_stream_by_char();
        let mut tools = ToolRegistry::new();
        tools.register(std::sync::Arc::new(EchoTool));
        let ctx = ToolCallContext::default();
        let options = ReactOptions::default();
        let (tx, mut rx) = mpsc::channel(64);

        let messages = run_react_stream(&model, &tools, "sys", vec![Message::human("go")], &ctx, &options, tx)
            .await
            .unwrap();
        assert_eq!(messages.last().unwrap().content_to_text(), "all done");

        let mut saw_tool_start = false;
        let mut saw_tool_end = false;
        let mut saw_model_end = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                LoopEvent::ToolStart { name, .. } => {
                    assert_eq!(name, "echo");
                    saw_tool_start = true;
                }
                LoopEvent::ToolEnd { name, output, .. } => {
                    assert_eq!(name, "echo");
                    assert_eq!(output, "{\"a\":1}");
                    saw_tool_end = true;
                }
                LoopEvent::ModelEnd { .. } => saw_model_end = true,
                LoopEvent::ModelChunk(_) => {}
            }
        }
        assert!(saw_tool_start && saw_tool_end && saw_model_end);
    }
}
