use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inbound `/v1/messages` body. Only the fields the proxy inspects are
/// typed; everything else rides along in `extra` and is forwarded verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    /// String or array of system blocks; kept raw for hashing and counting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<Value>,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub stream: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

fn is_false(v: &bool) -> bool {
    !*v
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    /// String shorthand or array of content blocks, exactly as received.
    pub content: Value,
}

/// Content block projection. Unknown block types keep their raw JSON so the
/// proxy stays forward-compatible without schema updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image { source: Value },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
    },
    #[serde(untagged)]
    Unknown(Value),
}

/// A reconstructed tool invocation, in response order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub id: String,
    pub input: Value,
}

impl Message {
    /// View the content as blocks. A bare string is one text block.
    pub fn content_blocks(&self) -> Vec<ContentBlock> {
        match &self.content {
            Value::String(s) => vec![ContentBlock::Text { text: s.clone() }],
            Value::Array(items) => items
                .iter()
                .map(|v| {
                    serde_json::from_value(v.clone())
                        .unwrap_or_else(|_| ContentBlock::Unknown(v.clone()))
                })
                .collect(),
            other => vec![ContentBlock::Unknown(other.clone())],
        }
    }

    /// Concatenated text blocks, newline-joined.
    pub fn text(&self) -> String {
        let parts: Vec<String> = self
            .content_blocks()
            .into_iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text),
                _ => None,
            })
            .collect();
        parts.join("\n")
    }
}

impl MessagesRequest {
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// System messages = top-level `system` entries (string counts 1, array
    /// counts its elements) plus messages whose role is `system`.
    pub fn system_message_count(&self) -> usize {
        let top = match &self.system {
            Some(Value::String(_)) => 1,
            Some(Value::Array(items)) => items.len(),
            Some(_) => 1,
            None => 0,
        };
        top + self
            .messages
            .iter()
            .filter(|m| m.role == "system")
            .count()
    }

    /// The last user message, if any.
    pub fn last_user_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == "user")
    }

    /// Text of the last user message (empty when there is none).
    pub fn last_user_text(&self) -> String {
        self.last_user_message().map(|m| m.text()).unwrap_or_default()
    }
}
