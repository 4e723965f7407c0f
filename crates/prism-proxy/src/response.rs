//! Response interpretation: buffered JSON parsing and the streaming SSE
//! state machine. Both produce the same [`ProxyResponse`] summary used for
//! persistence, metrics, and notifications; the bytes the client sees are
//! never touched.

use serde_json::Value;
use tracing::warn;

use prism_protocol::sse::{
    self, ContentBlockDelta, ContentBlockStart, MessageDelta, MessageStart, SseParsed,
};
use prism_protocol::{ContentBlock, ToolCall, Usage};

/// Summary of one upstream response.
#[derive(Debug, Default, Clone)]
pub struct ProxyResponse {
    pub usage: Usage,
    /// Newline-joined text blocks.
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub tool_call_count: u32,
    pub model: Option<String>,
    pub stop_reason: Option<String>,
    /// Raw usage object for durable storage, as last reported upstream.
    pub full_usage_data: Option<Value>,
}

impl ProxyResponse {
    /// Parse a fully buffered (non-streaming) Messages response body.
    /// Unparseable bodies yield an empty summary; the client still receives
    /// the original bytes.
    pub fn from_buffered(body: &[u8]) -> Self {
        let Ok(value) = serde_json::from_slice::<Value>(body) else {
            return Self::default();
        };

        let mut resp = Self {
            model: value
                .get("model")
                .and_then(Value::as_str)
                .map(str::to_string),
            stop_reason: value
                .get("stop_reason")
                .and_then(Value::as_str)
                .map(str::to_string),
            ..Self::default()
        };

        if let Some(usage) = value.get("usage") {
            resp.full_usage_data = Some(usage.clone());
            if let Ok(parsed) = serde_json::from_value::<Usage>(usage.clone()) {
                resp.usage = parsed;
            }
        }

        let mut texts: Vec<String> = Vec::new();
        if let Some(blocks) = value.get("content").and_then(Value::as_array) {
            for raw in blocks {
                let block: ContentBlock = serde_json::from_value(raw.clone())
                    .unwrap_or_else(|_| ContentBlock::Unknown(raw.clone()));
                match block {
                    ContentBlock::Text { text } => texts.push(text),
                    ContentBlock::ToolUse { id, name, input } => {
                        resp.tool_call_count += 1;
                        resp.tool_calls.push(ToolCall { name, id, input });
                    }
                    _ => {}
                }
            }
        }
        resp.content = texts.join("\n");
        resp
    }

    /// Task tool invocations, in response order, as the persisted JSON array.
    pub fn task_invocations(&self) -> Option<Value> {
        let tasks: Vec<&ToolCall> = self
            .tool_calls
            .iter()
            .filter(|call| call.name == "Task")
            .collect();
        if tasks.is_empty() {
            return None;
        }
        serde_json::to_value(tasks).ok()
    }
}

/// A tool-use block being reassembled from `input_json_delta` fragments.
#[derive(Debug)]
struct OpenTool {
    name: String,
    id: String,
    input_json: String,
}

/// Per-request streaming state machine. Owned by the forwarding task; fed
/// every upstream chunk in arrival order.
#[derive(Debug, Default)]
pub struct StreamState {
    lines: sse::LineBuffer,
    current_event: String,
    open_tool: Option<OpenTool>,
    response: ProxyResponse,
    done: bool,
}

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one upstream chunk (exactly the bytes relayed to the client).
    pub fn feed(&mut self, chunk: &[u8]) {
        for line in self.lines.push(chunk) {
            match sse::parse_sse_line(&line) {
                Some(SseParsed::Event(event)) => self.current_event = event,
                Some(SseParsed::Data(data)) => {
                    let event = std::mem::take(&mut self.current_event);
                    self.handle(&event, &data);
                }
                Some(SseParsed::Comment) | None => {}
            }
        }
    }

    /// True once `message_stop` was seen.
    pub fn is_complete(&self) -> bool {
        self.done
    }

    pub fn into_response(self) -> ProxyResponse {
        self.response
    }

    pub fn response(&self) -> &ProxyResponse {
        &self.response
    }

    fn handle(&mut self, event: &str, data: &str) {
        match event {
            "message_start" => {
                if let Ok(start) = serde_json::from_str::<MessageStart>(data) {
                    self.response.usage.merge_delta(&start.message.usage);
                    if !start.message.model.is_empty() {
                        self.response.model = Some(start.message.model);
                    }
                }
                // seed the raw usage object from the original frame
                if let Ok(value) = serde_json::from_str::<Value>(data) {
                    if let Some(usage) = value.pointer("/message/usage") {
                        self.response.full_usage_data = Some(usage.clone());
                    }
                }
            }

            "content_block_start" => {
                if let Ok(start) = serde_json::from_str::<ContentBlockStart>(data) {
                    if start.content_block.block_type == "tool_use" {
                        self.response.tool_call_count += 1;
                        self.open_tool = Some(OpenTool {
                            name: start.content_block.name.unwrap_or_default(),
                            id: start.content_block.id.unwrap_or_default(),
                            input_json: String::new(),
                        });
                    }
                }
            }

            "content_block_delta" => {
                if let Ok(delta) = serde_json::from_str::<ContentBlockDelta>(data) {
                    match delta.delta.delta_type.as_str() {
                        "text_delta" => {
                            if let Some(text) = delta.delta.text {
                                self.response.content.push_str(&text);
                            }
                        }
                        "input_json_delta" => {
                            if let (Some(tool), Some(partial)) =
                                (self.open_tool.as_mut(), delta.delta.partial_json)
                            {
                                tool.input_json.push_str(&partial);
                            }
                        }
                        _ => {}
                    }
                }
            }

            "content_block_stop" => {
                if let Some(tool) = self.open_tool.take() {
                    let input = match serde_json::from_str::<Value>(&tool.input_json) {
                        Ok(parsed) => parsed,
                        Err(e) => {
                            // keep the literal string so nothing is lost
                            warn!(
                                tool = %tool.name,
                                error = %e,
                                accumulator = %tool.input_json,
                                "tool input JSON did not parse; storing literal"
                            );
                            Value::String(tool.input_json.clone())
                        }
                    };
                    self.response.tool_calls.push(ToolCall {
                        name: tool.name,
                        id: tool.id,
                        input,
                    });
                }
            }

            "message_delta" => {
                if let Ok(delta) = serde_json::from_str::<MessageDelta>(data) {
                    self.response.usage.merge_delta(&delta.usage);
                    if let Some(reason) = delta.delta.stop_reason {
                        self.response.stop_reason = Some(reason);
                    }
                }
                if let Ok(value) = serde_json::from_str::<Value>(data) {
                    if let Some(usage) = value.get("usage") {
                        merge_usage_object(&mut self.response.full_usage_data, usage);
                    }
                }
            }

            "message_stop" => {
                self.done = true;
            }

            _ => {}
        }
    }
}

/// Overlay the latest usage fields onto the stored raw object.
fn merge_usage_object(existing: &mut Option<Value>, latest: &Value) {
    match existing {
        Some(Value::Object(map)) => {
            if let Value::Object(updates) = latest {
                for (key, value) in updates {
                    map.insert(key.clone(), value.clone());
                }
            }
        }
        _ => *existing = Some(latest.clone()),
    }
}
