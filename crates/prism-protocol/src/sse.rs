//! Line-level SSE parsing for the Anthropic streaming Messages API.
//! SSE format: `event: <type>\ndata: <json>\n\n`; comment lines start with
//! `:` (heartbeats) and are relayed but carry no payload.

use serde::Deserialize;

use crate::usage::PartialUsage;

/// One meaningful SSE line.
#[derive(Debug, PartialEq, Eq)]
pub enum SseParsed {
    Event(String),
    Data(String),
    /// Heartbeat/comment line (`: ...`). Forwarded, never interpreted.
    Comment,
}

/// Parse a single SSE line. Returns `None` for blank frame separators.
pub fn parse_sse_line(line: &str) -> Option<SseParsed> {
    if line.is_empty() {
        return None;
    }
    if line.starts_with(':') {
        return Some(SseParsed::Comment);
    }
    if let Some(event_type) = line.strip_prefix("event: ") {
        return Some(SseParsed::Event(event_type.to_string()));
    }
    line.strip_prefix("data: ")
        .map(|data| SseParsed::Data(data.to_string()))
}

/// Splits a byte stream into complete lines, holding the trailing partial
/// line until its newline arrives. Mirrors how upstream chunks arrive with
/// frames split at arbitrary byte boundaries.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every newline-terminated line (without the
    /// terminator). Invalid UTF-8 chunks are skipped; the Messages API only
    /// emits UTF-8 frames.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let Ok(text) = std::str::from_utf8(chunk) else {
            return Vec::new();
        };
        self.buf.push_str(text);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let mut line: String = self.buf.drain(..=pos).collect();
            line.pop(); // trailing \n
            if line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
        }
        lines
    }

    /// Whatever is left without a terminating newline.
    pub fn remainder(&self) -> &str {
        &self.buf
    }
}

// ── streaming event payloads ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct MessageStart {
    pub message: MessageStartInner,
}

#[derive(Debug, Deserialize)]
pub struct MessageStartInner {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub usage: PartialUsage,
}

#[derive(Debug, Deserialize)]
pub struct ContentBlockStart {
    #[serde(default)]
    pub index: usize,
    pub content_block: ContentBlockMeta,
}

#[derive(Debug, Deserialize)]
pub struct ContentBlockMeta {
    #[serde(rename = "type")]
    pub block_type: String,
    /// Populated for `tool_use` blocks: the tool call id.
    pub id: Option<String>,
    /// Populated for `tool_use` blocks: the tool name.
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ContentBlockDelta {
    #[serde(default)]
    pub index: usize,
    pub delta: DeltaContent,
}

#[derive(Debug, Deserialize)]
pub struct DeltaContent {
    #[serde(rename = "type")]
    pub delta_type: String,
    /// Populated for `text_delta` events.
    pub text: Option<String>,
    /// Populated for `input_json_delta` events (tool input streaming).
    pub partial_json: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MessageDelta {
    #[serde(default)]
    pub delta: MessageDeltaInner,
    #[serde(default)]
    pub usage: PartialUsage,
}

#[derive(Debug, Default, Deserialize)]
pub struct MessageDeltaInner {
    pub stop_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_event_and_data_lines() {
        assert_eq!(
            parse_sse_line("event: message_start"),
            Some(SseParsed::Event("message_start".into()))
        );
        assert_eq!(
            parse_sse_line("data: {\"x\":1}"),
            Some(SseParsed::Data("{\"x\":1}".into()))
        );
        assert_eq!(parse_sse_line(": ping"), Some(SseParsed::Comment));
        assert_eq!(parse_sse_line(""), None);
    }

    #[test]
    fn line_buffer_holds_partial_lines() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"event: content_bl").is_empty());
        let lines = buf.push(b"ock_delta\ndata: {\"a\"");
        assert_eq!(lines, vec!["event: content_block_delta".to_string()]);
        assert_eq!(buf.remainder(), "data: {\"a\"");
        let lines = buf.push(b":1}\n\n");
        assert_eq!(lines, vec!["data: {\"a\":1}".to_string(), String::new()]);
        assert!(buf.remainder().is_empty());
    }

    #[test]
    fn line_buffer_strips_crlf() {
        let mut buf = LineBuffer::new();
        let lines = buf.push(b"data: x\r\n");
        assert_eq!(lines, vec!["data: x".to_string()]);
    }
}
