use thiserror::Error;

/// Process-wide error taxonomy. Each variant maps to a client-facing error
/// type string and an HTTP status; upstream errors carry the original status
/// and body so they can pass through unchanged.
#[derive(Debug, Error)]
pub enum PrismError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Forbidden: {0}")]
    Authorization(String),

    #[error("Rate-limit exhausted: {0}")]
    RateLimitExhausted(String),

    #[error("Upstream error ({status})")]
    Upstream {
        status: u16,
        body: String,
        /// True only before the first response byte (connect/DNS/5xx at the
        /// header exchange); governs the retry policy.
        retryable: bool,
    },

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Client disconnected")]
    Cancelled,

    #[error("Request timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PrismError {
    /// Anthropic-style error `type` string used in the JSON envelope.
    pub fn error_type(&self) -> &'static str {
        match self {
            PrismError::Validation(_) | PrismError::Serialization(_) => "invalid_request",
            PrismError::Authentication(_) => "authentication_error",
            PrismError::Authorization(_) => "permission_error",
            PrismError::RateLimitExhausted(_) => "rate_limit_error",
            PrismError::Upstream { .. } => "upstream_error",
            PrismError::Timeout { .. } => "timeout_error",
            PrismError::Cancelled => "cancelled",
            PrismError::Config(_)
            | PrismError::Credential(_)
            | PrismError::Persistence(_)
            | PrismError::Io(_)
            | PrismError::Internal(_) => "api_error",
        }
    }

    /// HTTP status returned to the client for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            PrismError::Validation(_) | PrismError::Serialization(_) => 400,
            PrismError::Authentication(_) => 401,
            PrismError::Authorization(_) => 403,
            PrismError::RateLimitExhausted(_) => 429,
            PrismError::Upstream { status, .. } => *status,
            PrismError::Timeout { .. } => 504,
            // Nginx convention for a client that went away.
            PrismError::Cancelled => 499,
            PrismError::Config(_)
            | PrismError::Credential(_)
            | PrismError::Persistence(_)
            | PrismError::Io(_)
            | PrismError::Internal(_) => 500,
        }
    }

    /// Serialize into the client-facing JSON envelope. `request_id` is always
    /// present so failures can be correlated with persisted rows.
    pub fn to_envelope(&self, request_id: &str) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
            },
            "request_id": request_id,
        })
    }
}

pub type Result<T> = std::result::Result<T, PrismError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(PrismError::Validation("x".into()).http_status(), 400);
        assert_eq!(PrismError::Authentication("x".into()).http_status(), 401);
        assert_eq!(PrismError::RateLimitExhausted("x".into()).http_status(), 429);
        assert_eq!(PrismError::Cancelled.http_status(), 499);
        assert_eq!(
            PrismError::Upstream {
                status: 529,
                body: String::new(),
                retryable: false
            }
            .http_status(),
            529
        );
    }

    #[test]
    fn envelope_always_carries_request_id() {
        let env = PrismError::Credential("refresh failed".into()).to_envelope("req-1");
        assert_eq!(env["request_id"], "req-1");
        assert_eq!(env["error"]["type"], "api_error");
        // the message must never include raw secrets; this variant only ever
        // receives masked descriptions
        assert!(env["error"]["message"].as_str().unwrap().contains("refresh failed"));
    }
}
