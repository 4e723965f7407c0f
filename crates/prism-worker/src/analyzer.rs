//! Analysis model client: renders the bounded transcript into one Messages
//! call and validates the structured JSON the model returns.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{Result, WorkerError};
use crate::prompt::TranscriptMessage;

const ANALYSIS_TIMEOUT: Duration = Duration::from_secs(60);
const API_VERSION: &str = "2023-06-01";
const MAX_OUTPUT_TOKENS: u64 = 4096;

const SYSTEM_PROMPT: &str = "You are a conversation analyst. Read the transcript and respond \
with a single JSON object, no prose, matching exactly: \
{\"summary\": string, \"key_topics\": string[], \"sentiment\": \"positive\"|\"neutral\"|\"negative\", \
\"user_intent\": string, \"outcomes\": string[], \"action_items\": string[], \
\"technical_details\": string[], \"conversation_quality\": \"poor\"|\"average\"|\"good\"|\"excellent\"}";

/// Schema the model's reply must satisfy. A mismatch is a transient failure:
/// the job retries and usually succeeds on the next attempt.
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct AnalysisOutput {
    pub summary: String,
    #[serde(default)]
    pub key_topics: Vec<String>,
    pub sentiment: String,
    #[serde(default)]
    pub user_intent: String,
    #[serde(default)]
    pub outcomes: Vec<String>,
    #[serde(default)]
    pub action_items: Vec<String>,
    #[serde(default)]
    pub technical_details: Vec<String>,
    #[serde(default)]
    pub conversation_quality: String,
}

/// Token usage of the analysis call itself (persisted with the result).
#[derive(Debug, Default, Clone, Copy)]
pub struct AnalysisUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
}

pub struct Analyzer {
    http: reqwest::Client,
    messages_url: String,
    api_key: Option<String>,
    model: String,
}

impl Analyzer {
    pub fn new(base_url: &str, api_key: Option<String>, model: &str) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(ANALYSIS_TIMEOUT)
                .build()
                .expect("reqwest client builds"),
            messages_url: format!("{}/v1/messages", base_url.trim_end_matches('/')),
            api_key,
            model: model.to_string(),
        }
    }

    pub async fn analyze(
        &self,
        transcript: &[TranscriptMessage],
    ) -> Result<(AnalysisOutput, AnalysisUsage)> {
        let rendered = render_transcript(transcript);
        let body = json!({
            "model": self.model,
            "max_tokens": MAX_OUTPUT_TOKENS,
            "system": SYSTEM_PROMPT,
            "messages": [{"role": "user", "content": rendered}],
        });

        let mut request = self
            .http
            .post(&self.messages_url)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json");
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }

        let resp = request
            .json(&body)
            .send()
            .await
            .map_err(|e| WorkerError::Model(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %text, "analysis model error");
            return Err(WorkerError::Model(format!("status {status}")));
        }

        let reply: Value = resp
            .json()
            .await
            .map_err(|e| WorkerError::Model(e.to_string()))?;

        let usage = AnalysisUsage {
            input_tokens: reply
                .pointer("/usage/input_tokens")
                .and_then(Value::as_i64)
                .unwrap_or(0),
            output_tokens: reply
                .pointer("/usage/output_tokens")
                .and_then(Value::as_i64)
                .unwrap_or(0),
        };

        let text = reply
            .get("content")
            .and_then(Value::as_array)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        let output = parse_analysis(&text)?;
        debug!(summary_len = output.summary.len(), "analysis parsed");
        Ok((output, usage))
    }
}

/// Parse the model's reply against the schema. Tolerates markdown fencing
/// around the JSON object, nothing else.
pub fn parse_analysis(text: &str) -> Result<AnalysisOutput> {
    let trimmed = text.trim();
    let stripped = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);

    serde_json::from_str::<AnalysisOutput>(stripped)
        .map_err(|e| WorkerError::Schema(e.to_string()))
}

fn render_transcript(transcript: &[TranscriptMessage]) -> String {
    let mut out = String::from("Analyze this conversation:\n\n");
    for message in transcript {
        out.push_str(&format!("[{}]\n{}\n\n", message.role, message.content));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_analysis_parses() {
        let text = r#"{
            "summary": "User debugged a failing build.",
            "key_topics": ["rust", "ci"],
            "sentiment": "neutral",
            "user_intent": "fix the build",
            "outcomes": ["build fixed"],
            "action_items": [],
            "technical_details": ["missing feature flag"],
            "conversation_quality": "good"
        }"#;
        let output = parse_analysis(text).unwrap();
        assert_eq!(output.summary, "User debugged a failing build.");
        assert_eq!(output.key_topics, vec!["rust", "ci"]);
    }

    #[test]
    fn fenced_json_is_accepted() {
        let text = "```json\n{\"summary\": \"s\", \"sentiment\": \"neutral\"}\n```";
        let output = parse_analysis(text).unwrap();
        assert_eq!(output.summary, "s");
    }

    #[test]
    fn missing_required_fields_fail_schema() {
        assert!(matches!(
            parse_analysis(r#"{"key_topics": []}"#),
            Err(WorkerError::Schema(_))
        ));
        assert!(matches!(
            parse_analysis("I could not analyze this."),
            Err(WorkerError::Schema(_))
        ));
    }

    #[test]
    fn transcript_rendering_tags_roles() {
        let rendered = render_transcript(&[
            TranscriptMessage {
                role: "user".into(),
                content: "q".into(),
            },
            TranscriptMessage {
                role: "assistant".into(),
                content: "a".into(),
            },
        ]);
        assert!(rendered.contains("[user]\nq"));
        assert!(rendered.contains("[assistant]\na"));
    }
}
