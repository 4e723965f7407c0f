use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use prism_core::PrismConfig;
use prism_credentials::{CredentialManager, StickyMap};
use prism_storage::{RequestStore, WriterHandle};

use crate::forward::Forwarder;
use crate::metrics::TokenCounter;
use crate::notify::Notifier;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: PrismConfig,
    pub credentials: CredentialManager,
    pub forwarder: Forwarder,
    pub sticky: StickyMap,
    pub metrics: TokenCounter,
    pub notifier: Notifier,
    /// Read path for the conversation linker. Absent when storage is off.
    pub store: Option<RequestStore>,
    /// Async persistence queue. Absent when storage is off.
    pub writer: Option<WriterHandle>,
}

impl AppState {
    pub fn new(
        config: PrismConfig,
        store: Option<RequestStore>,
        writer: Option<WriterHandle>,
    ) -> Self {
        Self {
            credentials: CredentialManager::new(&config.credentials_dir),
            forwarder: Forwarder::new(&config.upstream_url),
            sticky: StickyMap::new(),
            metrics: TokenCounter::new(config.pool_window_seconds),
            notifier: Notifier::new(config.notify_webhook_url.clone()),
            store,
            writer,
            config,
        }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/v1/messages",
            post(crate::http::messages::messages_handler)
                .options(crate::http::messages::preflight_handler),
        )
        .route("/health", get(crate::http::health::health_handler))
        .route("/token-stats", get(crate::http::health::token_stats_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

// The offline surface: everything here must work without an upstream or a
// database, so these requests stop before the forwarder.
#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn router_with_descriptor(dir: &std::path::Path) -> Router {
        std::fs::write(
            dir.join("example.com.credentials.json"),
            r#"{"kind": "api_key", "client_api_key": "ck-valid", "account_id": "acct-1",
                "api_key": "sk-upstream"}"#,
        )
        .unwrap();
        let config = PrismConfig {
            storage_enabled: false,
            credentials_dir: dir.display().to_string(),
            ..PrismConfig::default()
        };
        build_router(Arc::new(AppState::new(config, None, None)))
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let dir = tempfile::tempdir().unwrap();
        let response = router_with_descriptor(dir.path())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn preflight_answers_204_with_cors_headers() {
        let dir = tempfile::tempdir().unwrap();
        let response = router_with_descriptor(dir.path())
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/v1/messages")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let headers = response.headers();
        assert_eq!(headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
        assert_eq!(
            headers.get(header::ACCESS_CONTROL_ALLOW_METHODS).unwrap(),
            "GET, POST, OPTIONS"
        );
        assert_eq!(headers.get(header::ACCESS_CONTROL_MAX_AGE).unwrap(), "86400");
    }

    #[tokio::test]
    async fn missing_bearer_is_rejected_with_challenge() {
        let dir = tempfile::tempdir().unwrap();
        let response = router_with_descriptor(dir.path())
            .oneshot(
                Request::post("/v1/messages")
                    .header("host", "example.com")
                    .body(Body::from(r#"{"model":"m","messages":[]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert_eq!(challenge, "Bearer realm=\"example.com\"");
        // the envelope always carries a request id
        assert!(body_json(response).await["request_id"].is_string());
    }

    #[tokio::test]
    async fn wrong_client_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let response = router_with_descriptor(dir.path())
            .oneshot(
                Request::post("/v1/messages")
                    .header("host", "example.com")
                    .header("authorization", "Bearer ck-wrong")
                    .body(Body::from(r#"{"model":"m","messages":[]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_domain_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let response = router_with_descriptor(dir.path())
            .oneshot(
                Request::post("/v1/messages")
                    .header("host", "other.example.com")
                    .header("authorization", "Bearer ck-valid")
                    .body(Body::from(r#"{"model":"m","messages":[]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn quota_probe_is_answered_without_forwarding() {
        let dir = tempfile::tempdir().unwrap();
        let response = router_with_descriptor(dir.path())
            .oneshot(
                Request::post("/v1/messages")
                    .header("host", "example.com")
                    .header("authorization", "Bearer ck-valid")
                    .body(Body::from(
                        r#"{"model":"m","messages":[{"role":"user","content":"quota"}]}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-request-id").is_some());
        assert!(response.headers().get("x-conversation-id").is_some());
        let body = body_json(response).await;
        assert_eq!(body["request_type"], "quota");
        assert_eq!(body["domain"], "example.com");
        assert!(body["usage"]["output_tokens"].is_u64());
    }

    #[tokio::test]
    async fn malformed_body_is_invalid_request() {
        let dir = tempfile::tempdir().unwrap();
        let response = router_with_descriptor(dir.path())
            .oneshot(
                Request::post("/v1/messages")
                    .header("host", "example.com")
                    .header("authorization", "Bearer ck-valid")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["type"], "invalid_request");
    }
}
