//! Uniform message representation shared by every chat-model adapter.
//!
//! Mirrors spec.md §3's `Message` record: one of four roles, content that
//! is either plain text or a sequence of tagged parts, and an optional
//! tool-call payload. This is deliberately a discriminated union rather
//! than a role hierarchy — see DESIGN.md.

use serde::{Deserialize, Serialize};

/// One tool invocation requested by the model, to be dispatched by the
/// ReAct loop's act phase. `id` is assigned by the model adapter and is
/// echoed back on the corresponding tool message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: serde_json::Value,
}

/// One part of a multipart message body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text { text: String },
    Image { image_base64: String, media_type: String },
}

/// Message content: either plain text or a sequence of tagged parts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<Part>),
}

impl Content {
    pub fn text(s: impl Into<String>) -> Self {
        Content::Text(s.into())
    }

    /// Concatenation of all text parts; image parts contribute nothing
    /// (spec.md §3).
    pub fn to_text(&self) -> String {
        match self {
            Content::Text(s) => s.clone(),
            Content::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    Part::Text { text } => Some(text.as_str()),
                    Part::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Content::Text(s) => s.is_empty(),
            Content::Parts(parts) => parts.is_empty(),
        }
    }
}

/// A single message in a conversation.
///
/// Invariant (spec.md §3): a `Tool` message MUST carry a `tool_call_id`
/// matching a prior `Ai` message's tool_call. An `Ai` message MAY carry
/// both text content and tool_calls (e.g. reasoning text plus a tool
/// request) or tool_calls with empty text.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    System { content: Content },
    Human { content: Content },
    Ai {
        content: Content,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        content: Content,
        tool_call_id: String,
        name: String,
    },
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Message::System { content: Content::text(text) }
    }

    pub fn human(text: impl Into<String>) -> Self {
        Message::Human { content: Content::text(text) }
    }

    pub fn human_parts(parts: Vec<Part>) -> Self {
        Message::Human { content: Content::Parts(parts) }
    }

    pub fn ai(text: impl Into<String>) -> Self {
        Message::Ai { content: Content::text(text), tool_calls: Vec::new() }
    }

    pub fn ai_with_tool_calls(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Message::Ai { content: Content::text(text), tool_calls }
    }

    pub fn tool(content: impl Into<String>, tool_call_id: impl Into<String>, name: impl Into<String>) -> Self {
        Message::Tool {
            content: Content::text(content),
            tool_call_id: tool_call_id.into(),
            name: name.into(),
        }
    }

    pub fn content(&self) -> &Content {
        match self {
            Message::System { content }
            | Message::Human { content }
            | Message::Ai { content, .. }
            | Message::Tool { content, .. } => content,
        }
    }

    pub fn content_to_text(&self) -> String {
        self.content().to_text()
    }

    pub fn tool_calls(&self) -> &[ToolCall] {
        match self {
            Message::Ai { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }

    pub fn is_ai(&self) -> bool {
        matches!(self, Message::Ai { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_to_text_ignores_image_parts() {
        let c = Content::Parts(vec![
            Part::Text { text: "a".into() },
            Part::Image { image_base64: "xx".into(), media_type: "image/png".into() },
            Part::Text { text: "b".into() },
        ]);
        assert_eq!(c.to_text(), "ab");
    }

    #[test]
    fn ai_message_can_carry_tool_calls_with_empty_text() {
        let m = Message::ai_with_tool_calls(
            "",
            vec![ToolCall { id: "1".into(), name: "echo".into(), args: serde_json::json!({}) }],
        );
        assert_eq!(m.content_to_text(), "");
        assert_eq!(m.tool_calls().len(), 1);
    }

    #[test]
    fn serde_round_trip_preserves_role_tag() {
        let m = Message::tool("x", "call-1", "echo");
        let json = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(m, back);
    }
}
