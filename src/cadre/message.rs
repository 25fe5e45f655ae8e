//! Shared message primitives.
//!
//! The provider interface, the agent runtime, and agent memory all speak one
//! message shape.  A [`Message`] is a single conversation turn; when the model
//! requests tools (or a tool replies), the turn additionally carries
//! structured [`ContentBlock`]s that round-trip through the persistent store
//! unchanged.
//!
//! # Wire format
//!
//! Content blocks serialise with a `type` tag:
//!
//! ```json
//! {"type": "text", "text": "..."}
//! {"type": "tool_use", "id": "tc_1", "name": "grep", "input": {"pattern": "fn main"}}
//! {"type": "tool_result", "tool_use_id": "tc_1", "content": "...", "is_error": true}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Conversation role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A user authored message (prompts and folded tool results).
    User,
    /// A model authored message.
    Assistant,
    /// A system priming message.
    System,
    /// A standalone tool message (used by stores that keep tool turns separate).
    Tool,
}

impl Role {
    /// Wire name of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

/// A structured piece of message content.
///
/// Plain prose, a model-issued tool request, or the reply to a prior
/// `tool_use` block.  Tool inputs are carried as raw JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain prose.
    Text { text: String },
    /// The model requests a tool invocation.
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// Reply to a prior [`ContentBlock::ToolUse`] with the same id.
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

impl ContentBlock {
    /// Build a `text` block.
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    /// Build a `tool_result` block.  `is_error` is omitted from the wire when false.
    pub fn tool_result(
        tool_use_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        ContentBlock::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: if is_error { Some(true) } else { None },
        }
    }

    /// Character count contributing to the token estimate.
    fn chars(&self) -> usize {
        match self {
            ContentBlock::Text { text } => text.len(),
            ContentBlock::ToolUse { name, input, .. } => name.len() + input.to_string().len(),
            ContentBlock::ToolResult { content, .. } => content.len(),
        }
    }
}

/// A single conversation turn.
///
/// Messages are append-only value objects: memories clone them freely and the
/// persistent store writes them through verbatim.  The optional tool metadata
/// fields are populated by stores that record tool turns individually.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Author of the turn.
    pub role: Role,
    /// Plain text content.  Ignored by providers when `content_blocks` is set.
    pub content: String,
    /// Creation timestamp (UTC).
    pub timestamp: DateTime<Utc>,
    /// Structured blocks, present on tool-bearing turns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_blocks: Option<Vec<ContentBlock>>,
    /// Name of the tool this turn relates to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Provider-assigned call id correlating a result to its request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Raw JSON input of the related tool call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<serde_json::Value>,
}

impl Message {
    /// Create a message with the given role and plain content.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            content_blocks: None,
            tool_name: None,
            tool_call_id: None,
            tool_input: None,
        }
    }

    /// A `user` turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// An `assistant` turn.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// A `system` turn.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Attach structured content blocks (builder pattern).
    pub fn with_blocks(mut self, blocks: Vec<ContentBlock>) -> Self {
        self.content_blocks = Some(blocks);
        self
    }

    /// Whether this turn carries any `tool_use` block.
    pub fn has_tool_use(&self) -> bool {
        self.content_blocks
            .as_ref()
            .map(|blocks| {
                blocks
                    .iter()
                    .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
            })
            .unwrap_or(false)
    }

    /// Approximate token cost of this turn: `ceil(total_characters / 4)`,
    /// never less than 1.
    pub fn estimated_tokens(&self) -> usize {
        let block_chars: usize = self
            .content_blocks
            .as_ref()
            .map(|blocks| blocks.iter().map(ContentBlock::chars).sum())
            .unwrap_or(0);
        let chars = self.content.len() + block_chars;
        chars.div_ceil(4).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn roles_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
        assert_eq!(serde_json::to_string(&Role::Tool).unwrap(), "\"tool\"");
    }

    #[test]
    fn content_blocks_round_trip() {
        let blocks = vec![
            ContentBlock::text("thinking..."),
            ContentBlock::ToolUse {
                id: "tc_1".into(),
                name: "grep".into(),
                input: json!({"pattern": "fn main"}),
            },
            ContentBlock::tool_result("tc_1", "src/main.rs:1", false),
            ContentBlock::tool_result("tc_2", "no such tool", true),
        ];
        let encoded = serde_json::to_string(&blocks).unwrap();
        let decoded: Vec<ContentBlock> = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, blocks);
        // is_error is omitted when false, present when true
        assert!(!encoded.contains("\"is_error\":false"));
        assert!(encoded.contains("\"is_error\":true"));
    }

    #[test]
    fn tagged_block_shape_matches_wire_table() {
        let block = ContentBlock::ToolUse {
            id: "tc_9".into(),
            name: "shell".into(),
            input: json!({"command": "ls"}),
        };
        let value = serde_json::to_value(&block).unwrap();
        assert_eq!(value["type"], "tool_use");
        assert_eq!(value["id"], "tc_9");
        assert_eq!(value["input"]["command"], "ls");
    }

    #[test]
    fn token_estimate_is_ceil_chars_over_four() {
        assert_eq!(Message::user("abcd").estimated_tokens(), 1);
        assert_eq!(Message::user("abcde").estimated_tokens(), 2);
        // empty content still costs one token
        assert_eq!(Message::user("").estimated_tokens(), 1);
    }

    #[test]
    fn has_tool_use_detects_blocks() {
        let plain = Message::assistant("done");
        assert!(!plain.has_tool_use());

        let tooled = Message::assistant("").with_blocks(vec![ContentBlock::ToolUse {
            id: "tc_1".into(),
            name: "shell".into(),
            input: json!({}),
        }]);
        assert!(tooled.has_tool_use());
    }
}
