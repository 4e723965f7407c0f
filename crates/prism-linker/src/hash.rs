//! Canonical-JSON SHA-256 hashing of message histories.
//!
//! Canonical form: object keys sorted, no insignificant whitespace. Bulky
//! payloads (image sources, tool-result bodies) are collapsed to their own
//! digests before the outer hash, so two histories differing only in an
//! attachment's bytes still hash apart without hashing megabytes twice.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use prism_protocol::{ContentBlock, Message};

/// Serialize a JSON value canonically: sorted keys, no whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("string serializes"));
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        // scalars already have a single serde_json rendering
        other => out.push_str(&serde_json::to_string(other).expect("scalar serializes")),
    }
}

pub fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

fn hash_value(value: &Value) -> String {
    sha256_hex(&canonical_json(value))
}

/// Hash of the normalized system field. A bare string normalizes to a single
/// text block so `"x"` and `[{"type":"text","text":"x"}]` hash identically.
pub fn system_hash(system: Option<&Value>) -> Option<String> {
    let system = system?;
    let normalized = match system {
        Value::String(s) => Value::Array(vec![serde_json::json!({
            "type": "text",
            "text": s,
        })]),
        other => other.clone(),
    };
    Some(hash_value(&normalized))
}

/// Canonical projection of one message: role plus per-block projections.
fn project_message(message: &Message) -> Value {
    let blocks: Vec<Value> = message
        .content_blocks()
        .iter()
        .map(project_block)
        .collect();
    serde_json::json!({
        "role": message.role,
        "content": blocks,
    })
}

fn project_block(block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text { text } => serde_json::json!({
            "type": "text",
            "text": text,
        }),
        ContentBlock::Image { source } => serde_json::json!({
            "type": "image",
            "source_hash": hash_value(source),
        }),
        ContentBlock::ToolUse { id, name, input } => serde_json::json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": input,
        }),
        ContentBlock::ToolResult {
            tool_use_id,
            content,
        } => serde_json::json!({
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "content_hash": hash_value(content),
        }),
        ContentBlock::Unknown(raw) => raw.clone(),
    }
}

/// Hash over the projected prefix `messages[0..len]`.
pub fn message_prefix_hash(messages: &[Message]) -> Option<String> {
    if messages.is_empty() {
        return None;
    }
    let projected: Vec<Value> = messages.iter().map(project_message).collect();
    Some(hash_value(&Value::Array(projected)))
}

/// Hash over the full input message list.
pub fn current_message_hash(messages: &[Message]) -> Option<String> {
    message_prefix_hash(messages)
}

/// Hash over everything before the last user/assistant turn: the trailing
/// user message and, when present, the assistant message that precedes it
/// are dropped. `None` marks the conversation's first turn.
pub fn parent_message_hash(messages: &[Message]) -> Option<String> {
    let mut end = messages.len();
    if end > 0 && messages[end - 1].role == "user" {
        end -= 1;
    }
    if end > 0 && messages[end - 1].role == "assistant" {
        end -= 1;
    }
    message_prefix_hash(&messages[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(role: &str, content: Value) -> Message {
        Message {
            role: role.to_string(),
            content,
        }
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let v = json!({"b": 1, "a": {"d": 2, "c": [3, null, true]}});
        assert_eq!(
            canonical_json(&v),
            r#"{"a":{"c":[3,null,true],"d":2},"b":1}"#
        );
    }

    #[test]
    fn hashing_is_deterministic() {
        let messages = vec![
            msg("user", json!("a")),
            msg("assistant", json!("b")),
            msg("user", json!([{"type": "text", "text": "c"}])),
        ];
        assert_eq!(
            current_message_hash(&messages),
            current_message_hash(&messages.clone())
        );
        assert_eq!(
            parent_message_hash(&messages),
            parent_message_hash(&messages.clone())
        );
    }

    #[test]
    fn system_string_and_block_array_hash_identically() {
        let s = json!("be terse");
        let a = json!([{"type": "text", "text": "be terse"}]);
        assert_eq!(system_hash(Some(&s)), system_hash(Some(&a)));
        assert_eq!(system_hash(None), None);
    }

    #[test]
    fn parent_hash_drops_the_last_turn() {
        // [U:"a", A:"b", U:"c"]: parent state is [U:"a"]
        let history = vec![
            msg("user", json!("a")),
            msg("assistant", json!("b")),
            msg("user", json!("c")),
        ];
        let first_turn = vec![msg("user", json!("a"))];
        assert_eq!(
            parent_message_hash(&history),
            current_message_hash(&first_turn)
        );
    }

    #[test]
    fn first_turn_has_no_parent() {
        let history = vec![msg("user", json!("a"))];
        assert_eq!(parent_message_hash(&history), None);
    }

    #[test]
    fn image_bytes_change_the_hash() {
        let a = vec![msg(
            "user",
            json!([{"type": "image", "source": {"type": "base64", "data": "AAAA"}}]),
        )];
        let b = vec![msg(
            "user",
            json!([{"type": "image", "source": {"type": "base64", "data": "BBBB"}}]),
        )];
        assert_ne!(current_message_hash(&a), current_message_hash(&b));
    }

    #[test]
    fn tool_result_hashed_by_id_and_payload() {
        let a = vec![msg(
            "user",
            json!([{"type": "tool_result", "tool_use_id": "t1", "content": "ok"}]),
        )];
        let b = vec![msg(
            "user",
            json!([{"type": "tool_result", "tool_use_id": "t2", "content": "ok"}]),
        )];
        assert_ne!(current_message_hash(&a), current_message_hash(&b));
    }
}
