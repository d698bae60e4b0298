//! Transcript message model (provider-agnostic).
//!
//! Every message replayed to a model is one of these variants. Content is
//! modeled as tagged unions so the sanitizer can match exhaustively
//! instead of probing object shapes at runtime.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry in an ordered transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum TurnMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: Vec<AssistantBlock>,
    },
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        content: Vec<ResultBlock>,
        #[serde(default)]
        is_error: bool,
    },
}

/// A content block inside an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum AssistantBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ToolCall {
        id: String,
        name: String,
        /// Materialized arguments. `None` means the call never finished
        /// streaming its input.
        #[serde(skip_serializing_if = "Option::is_none")]
        arguments: Option<Value>,
        /// Raw streamed JSON fragment, kept only while a call is in flight.
        #[serde(skip_serializing_if = "Option::is_none")]
        partial_json: Option<String>,
    },
}

/// A content block inside a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ResultBlock {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
    },
}

// ── Convenience constructors ───────────────────────────────────────

impl TurnMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self::System { content: text.into() }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::User { content: text.into() }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::Assistant {
            content: vec![AssistantBlock::Text { text: text.into() }],
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self::ToolResult {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            content: vec![ResultBlock::Text { text: text.into() }],
            is_error: false,
        }
    }

    /// Tool-call ids introduced by this message, in block order.
    /// Empty for non-assistant messages.
    pub fn tool_call_ids(&self) -> Vec<&str> {
        match self {
            Self::Assistant { content } => content
                .iter()
                .filter_map(|b| match b {
                    AssistantBlock::ToolCall { id, .. } => Some(id.as_str()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// True when this message carries at least one tool-call block.
    pub fn has_tool_calls(&self) -> bool {
        matches!(
            self,
            Self::Assistant { content }
                if content.iter().any(|b| matches!(b, AssistantBlock::ToolCall { .. }))
        )
    }
}

impl AssistantBlock {
    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: Value,
    ) -> Self {
        Self::ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: Some(arguments),
            partial_json: None,
        }
    }

    /// A tool call is incomplete when its only argument evidence is a
    /// streamed `partial_json` fragment: no materialized arguments, or an
    /// empty argument object. Such calls must never be replayed.
    pub fn is_incomplete_tool_call(&self) -> bool {
        match self {
            Self::ToolCall {
                arguments,
                partial_json,
                ..
            } => {
                partial_json.is_some()
                    && match arguments {
                        None => true,
                        Some(Value::Object(map)) => map.is_empty(),
                        Some(_) => false,
                    }
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn incomplete_call_detection() {
        let complete = AssistantBlock::tool_call("t1", "read", json!({"path": "/tmp"}));
        assert!(!complete.is_incomplete_tool_call());

        let partial_no_args = AssistantBlock::ToolCall {
            id: "t2".into(),
            name: "read".into(),
            arguments: None,
            partial_json: Some("{\"pa".into()),
        };
        assert!(partial_no_args.is_incomplete_tool_call());

        let partial_empty_args = AssistantBlock::ToolCall {
            id: "t3".into(),
            name: "read".into(),
            arguments: Some(json!({})),
            partial_json: Some("{}".into()),
        };
        assert!(partial_empty_args.is_incomplete_tool_call());

        // No partial fragment at all — treated as complete even with
        // empty arguments (some tools take no input).
        let no_partial = AssistantBlock::ToolCall {
            id: "t4".into(),
            name: "ping".into(),
            arguments: Some(json!({})),
            partial_json: None,
        };
        assert!(!no_partial.is_incomplete_tool_call());
    }

    #[test]
    fn tool_call_ids_in_block_order() {
        let msg = TurnMessage::Assistant {
            content: vec![
                AssistantBlock::Text { text: "on it".into() },
                AssistantBlock::tool_call("a", "read", json!({})),
                AssistantBlock::tool_call("b", "write", json!({})),
            ],
        };
        assert_eq!(msg.tool_call_ids(), vec!["a", "b"]);
        assert!(msg.has_tool_calls());
        assert!(!TurnMessage::user("hi").has_tool_calls());
    }

    #[test]
    fn serde_round_trip_tagged_roles() {
        let msg = TurnMessage::tool_result("call_1", "read", "ok");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "toolResult");
        assert_eq!(json["toolCallId"], "call_1");
        assert_eq!(json["toolName"], "read");
        let back: TurnMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn serde_block_fields_are_camel_case() {
        let block = AssistantBlock::ToolCall {
            id: "t1".into(),
            name: "read".into(),
            arguments: None,
            partial_json: Some("{\"pa".into()),
        };
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["partialJson"], "{\"pa");

        let image = ResultBlock::Image {
            data: "abcd".into(),
            media_type: Some("image/png".into()),
        };
        let json = serde_json::to_value(&image).unwrap();
        assert_eq!(json["mediaType"], "image/png");
    }
}
