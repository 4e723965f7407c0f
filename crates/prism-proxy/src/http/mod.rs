//! HTTP surface: the messages relay, health, and token stats.

pub mod health;
pub mod messages;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use prism_core::error::PrismError;

/// A request that failed before (or instead of) producing an upstream
/// response. Renders the Anthropic-style envelope; upstream errors pass
/// through with their original status and body.
pub struct ApiFailure {
    pub error: PrismError,
    pub request_id: Uuid,
    /// Realm for the `WWW-Authenticate` header on 401s.
    pub realm: Option<String>,
}

impl ApiFailure {
    pub fn new(error: PrismError, request_id: Uuid) -> Self {
        Self {
            error,
            request_id,
            realm: None,
        }
    }

    pub fn with_realm(error: PrismError, request_id: Uuid, realm: &str) -> Self {
        Self {
            error,
            request_id,
            realm: Some(realm.to_string()),
        }
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.error.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let body = match &self.error {
            // pass the upstream's own error body through unchanged
            PrismError::Upstream { body, .. } => body.clone(),
            other => other.to_envelope(&self.request_id.to_string()).to_string(),
        };

        let mut response = Response::new(body.into());
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(id) = HeaderValue::from_str(&self.request_id.to_string()) {
            response.headers_mut().insert("x-request-id", id);
        }
        if status == StatusCode::UNAUTHORIZED {
            let realm = self.realm.as_deref().unwrap_or("prism");
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer realm=\"{realm}\"")) {
                response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
            }
        }
        response
    }
}
