//! Bounded prompt assembly for conversation analysis.
//!
//! A conversation can be far larger than any model context. The builder
//! keeps the opening and the most recent turns, marks the cut with a single
//! synthetic message, and hard-truncates pathological single messages.

use serde_json::Value;

use prism_storage::TranscriptRow;

pub const TRUNCATION_MARKER: &str = "[…conversation truncated…]";
pub const CONTENT_TRUNCATED_SUFFIX: &str = "[CONTENT TRUNCATED]";

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptMessage {
    pub role: String,
    pub content: String,
}

impl TranscriptMessage {
    fn new(role: &str, content: String) -> Self {
        Self {
            role: role.to_string(),
            content,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TruncationParams {
    pub head: usize,
    pub tail: usize,
    pub budget_tokens: u64,
}

/// Rough token estimate: four characters per token plus per-message
/// overhead. The configured safety margin absorbs the estimate error.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64) / 4 + 2
}

fn total_tokens(messages: &[TranscriptMessage]) -> u64 {
    messages.iter().map(|m| estimate_tokens(&m.content)).sum()
}

/// Flatten persisted rows into user/assistant turns, ascending by time,
/// keeping at most the `max_messages` most recent messages.
pub fn build_transcript(rows: &[TranscriptRow], max_messages: usize) -> Vec<TranscriptMessage> {
    let mut messages: Vec<TranscriptMessage> = Vec::new();
    for row in rows {
        if let Some(user) = row.input_body.as_ref().and_then(last_user_text) {
            if !user.is_empty() {
                messages.push(TranscriptMessage::new("user", user));
            }
        }
        if let Some(assistant) = row.response_body.as_ref().and_then(response_text) {
            if !assistant.is_empty() {
                messages.push(TranscriptMessage::new("assistant", assistant));
            }
        }
    }
    if messages.len() > max_messages {
        messages.drain(..messages.len() - max_messages);
    }
    messages
}

/// Text of the last `user` message in a persisted request body.
fn last_user_text(input_body: &Value) -> Option<String> {
    let messages = input_body.get("messages")?.as_array()?;
    let last_user = messages
        .iter()
        .rev()
        .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))?;
    Some(content_text(last_user.get("content")?))
}

/// Assistant text from a persisted response body: either the upstream
/// Messages shape (`content` array of blocks) or the relay's assembled form
/// (`content` string).
fn response_text(response_body: &Value) -> Option<String> {
    Some(content_text(response_body.get("content")?))
}

fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => {
            let texts: Vec<&str> = blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect();
            texts.join("\n")
        }
        _ => String::new(),
    }
}

/// Bound a transcript to the head/tail shape and the token budget.
pub fn truncate(mut messages: Vec<TranscriptMessage>, params: TruncationParams) -> Vec<TranscriptMessage> {
    // Shape cut: first H and last T with one marker between.
    if messages.len() > params.head + params.tail {
        let tail_start = messages.len() - params.tail;
        let mut shaped: Vec<TranscriptMessage> = messages[..params.head].to_vec();
        shaped.push(TranscriptMessage::new("user", TRUNCATION_MARKER.to_string()));
        shaped.extend_from_slice(&messages[tail_start..]);
        messages = shaped;
    } else if total_tokens(&messages) > params.budget_tokens && messages.len() > 1 {
        // Over budget without exceeding the head/tail shape: mark the cut
        // where budget-driven drops will happen.
        let keep_head = params.head.min(messages.len() - 1);
        messages.insert(
            keep_head,
            TranscriptMessage::new("user", TRUNCATION_MARKER.to_string()),
        );
    }

    // Budget cut: drop head messages first, then eat into the tail's head.
    // The marker stays; only real messages are dropped.
    while total_tokens(&messages) > params.budget_tokens {
        let drop_index = messages
            .iter()
            .position(|m| m.content != TRUNCATION_MARKER);
        match drop_index {
            Some(index) if messages.len() > 1 => {
                messages.remove(index);
            }
            _ => break,
        }
    }

    // A single message can still blow the budget on its own.
    if messages.len() == 1 && total_tokens(&messages) > params.budget_tokens {
        let message = &mut messages[0];
        let keep_chars = (params.budget_tokens * 4) as usize;
        message.content = message
            .content
            .chars()
            .take(keep_chars.saturating_sub(CONTENT_TRUNCATED_SUFFIX.len()))
            .collect();
        message.content.push_str(CONTENT_TRUNCATED_SUFFIX);
    }

    messages
}
