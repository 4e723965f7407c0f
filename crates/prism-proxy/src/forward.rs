//! Upstream forwarder: outbound header construction, the idempotent-only
//! retry policy, and the buffered request path.

use std::time::Duration;

use axum::http::HeaderMap;
use bytes::Bytes;
use reqwest::header::{HeaderMap as OutHeaderMap, HeaderName, HeaderValue};
use tracing::{debug, warn};

use prism_core::error::PrismError;
use prism_credentials::AuthMaterial;

const API_VERSION: &str = "2023-06-01";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Backoff schedule for pre-first-byte failures (connect/DNS/5xx at the
/// header exchange). Two retries, then the last answer stands.
const RETRY_DELAYS: [Duration; 2] = [Duration::from_millis(250), Duration::from_secs(1)];

/// Inbound headers that never cross to the upstream: the client's own
/// credentials (the proxy picks the upstream credential), connection
/// plumbing, and `accept-encoding` (the relay parses SSE in flight, so the
/// upstream must answer unencoded).
const STRIPPED: &[&str] = &[
    "host",
    "authorization",
    "x-api-key",
    "content-length",
    "connection",
    "transfer-encoding",
    "accept-encoding",
    "upgrade",
    "te",
];

pub struct Forwarder {
    client: reqwest::Client,
    messages_url: String,
}

impl Forwarder {
    pub fn new(upstream_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .expect("reqwest client builds");
        Self {
            client,
            messages_url: format!("{}/v1/messages", upstream_url.trim_end_matches('/')),
        }
    }

    /// Outbound header set: passthrough minus [`STRIPPED`], then the fixed
    /// proxy headers and the chosen credential material on top.
    pub fn build_headers(inbound: &HeaderMap, material: &AuthMaterial) -> OutHeaderMap {
        let mut out = OutHeaderMap::new();
        for (name, value) in inbound {
            let lower = name.as_str().to_ascii_lowercase();
            if STRIPPED.contains(&lower.as_str()) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(lower.as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                out.append(name, value);
            }
        }

        out.insert("content-type", HeaderValue::from_static("application/json"));
        out.insert("anthropic-version", HeaderValue::from_static(API_VERSION));
        for (name, value) in &material.headers {
            if let Ok(value) = HeaderValue::from_str(value) {
                out.insert(*name, value);
            }
        }
        out
    }

    /// POST the body upstream. Retries only failures where no response byte
    /// was seen: transport errors and 5xx statuses observed at the header
    /// exchange. Everything else (including 4xx) passes through untouched.
    pub async fn send(
        &self,
        headers: OutHeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response, PrismError> {
        let mut attempt = 0;
        loop {
            let result = self
                .client
                .post(&self.messages_url)
                .headers(headers.clone())
                .body(body.clone())
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_server_error() && attempt < RETRY_DELAYS.len() => {
                    warn!(status = resp.status().as_u16(), attempt, "upstream 5xx; retrying");
                }
                Ok(resp) => {
                    debug!(status = resp.status().as_u16(), attempt, "upstream responded");
                    return Ok(resp);
                }
                Err(e) if attempt < RETRY_DELAYS.len() => {
                    warn!(error = %e, attempt, "upstream connect failed; retrying");
                }
                Err(e) => {
                    return Err(PrismError::Upstream {
                        status: 502,
                        body: format!(r#"{{"error":{{"type":"upstream_error","message":"{e}"}}}}"#),
                        retryable: false,
                    });
                }
            }

            tokio::time::sleep(RETRY_DELAYS[attempt]).await;
            attempt += 1;
        }
    }

    /// Buffered (non-streaming) path: send and read the whole body under the
    /// request deadline.
    pub async fn send_buffered(
        &self,
        headers: OutHeaderMap,
        body: Bytes,
        deadline: Duration,
    ) -> Result<(reqwest::StatusCode, OutHeaderMap, Bytes), PrismError> {
        let deadline_ms = deadline.as_millis() as u64;
        let work = async {
            let resp = self.send(headers, body).await?;
            let status = resp.status();
            let headers = resp.headers().clone();
            let bytes = resp
                .bytes()
                .await
                .map_err(|e| PrismError::Upstream {
                    status: 502,
                    body: format!(r#"{{"error":{{"type":"upstream_error","message":"{e}"}}}}"#),
                    retryable: false,
                })?;
            Ok::<_, PrismError>((status, headers, bytes))
        };

        tokio::time::timeout(deadline, work)
            .await
            .map_err(|_| PrismError::Timeout { ms: deadline_ms })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn material() -> AuthMaterial {
        AuthMaterial {
            headers: vec![("x-api-key", "sk-upstream".to_string())],
        }
    }

    #[test]
    fn client_credentials_never_cross() {
        let mut inbound = HeaderMap::new();
        inbound.insert("host", "tenant.example.com".parse().unwrap());
        inbound.insert("authorization", "Bearer client-key".parse().unwrap());
        inbound.insert("x-api-key", "client-api-key".parse().unwrap());
        inbound.insert("anthropic-beta", "tools-2024".parse().unwrap());
        inbound.insert("user-agent", "claude-cli/2.0".parse().unwrap());

        let out = Forwarder::build_headers(&inbound, &material());

        assert!(out.get("authorization").is_none());
        assert_eq!(out.get("x-api-key").unwrap(), "sk-upstream");
        assert!(out.get("host").is_none());
        // optional headers pass through
        assert_eq!(out.get("anthropic-beta").unwrap(), "tools-2024");
        assert_eq!(out.get("user-agent").unwrap(), "claude-cli/2.0");
        assert_eq!(out.get("anthropic-version").unwrap(), API_VERSION);
        assert_eq!(out.get("content-type").unwrap(), "application/json");
    }

    #[test]
    fn oauth_material_overrides_client_beta_header() {
        let mut inbound = HeaderMap::new();
        inbound.insert("anthropic-beta", "tools-2024".parse().unwrap());
        let material = AuthMaterial {
            headers: vec![
                ("authorization", "Bearer upstream-token".to_string()),
                ("anthropic-beta", "oauth-2025-04-20".to_string()),
            ],
        };

        let out = Forwarder::build_headers(&inbound, &material);
        assert_eq!(out.get("authorization").unwrap(), "Bearer upstream-token");
        assert_eq!(out.get("anthropic-beta").unwrap(), "oauth-2025-04-20");
    }
}
