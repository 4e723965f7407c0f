//! Request-type classification.
//!
//! The system-message count separates helper traffic (hook evaluations,
//! title generation) from real agent turns; only `inference` requests reach
//! the notification hook.

use std::fmt;

use prism_protocol::MessagesRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    QueryEvaluation,
    Inference,
    Quota,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::QueryEvaluation => "query_evaluation",
            RequestType::Inference => "inference",
            RequestType::Quota => "quota",
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an inbound request.
///
/// A trimmed last-user-content of `"quota"` (case-insensitive) short-circuits
/// to a usage report and is never forwarded. Fewer than two system messages
/// marks helper traffic.
pub fn classify(request: &MessagesRequest) -> RequestType {
    if request.last_user_text().trim().eq_ignore_ascii_case("quota") {
        return RequestType::Quota;
    }
    if request.system_message_count() < 2 {
        RequestType::QueryEvaluation
    } else {
        RequestType::Inference
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn req(v: serde_json::Value) -> MessagesRequest {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn quota_probe_short_circuits() {
        for text in ["quota", "QUOTA", "  Quota \n"] {
            let r = req(json!({
                "model": "m",
                "system": ["a", "b"],
                "messages": [{"role": "user", "content": text}],
            }));
            assert_eq!(classify(&r), RequestType::Quota);
        }
    }

    #[test]
    fn few_system_messages_is_query_evaluation() {
        let r = req(json!({
            "model": "m",
            "system": "only one",
            "messages": [{"role": "user", "content": "hi"}],
        }));
        assert_eq!(classify(&r), RequestType::QueryEvaluation);

        let r = req(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
        }));
        assert_eq!(classify(&r), RequestType::QueryEvaluation);
    }

    #[test]
    fn two_or_more_system_messages_is_inference() {
        let r = req(json!({
            "model": "m",
            "system": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}],
            "messages": [{"role": "user", "content": "hi"}],
        }));
        assert_eq!(classify(&r), RequestType::Inference);
    }

    #[test]
    fn quota_must_be_the_whole_message() {
        let r = req(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "what is my quota?"}],
        }));
        assert_eq!(classify(&r), RequestType::QueryEvaluation);
    }
}
