//! POST /v1/messages — the transparent relay.
//!
//! Pipeline: host binding → client auth → classification (quota probes are
//! answered locally) → conversation linkage → account selection → upstream
//! forward (buffered or streaming) → async persistence + metrics + the
//! notification hook. Response bytes are the upstream's, untouched.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use prism_core::error::PrismError;
use prism_credentials::{
    select_account, verify::client_key_matches, CredentialError, CredentialKind,
};
use prism_linker::{link, LinkStore, Linkage, PriorRequest, TaskMatch};
use prism_protocol::MessagesRequest;

use crate::app::AppState;
use crate::auth;
use crate::classify::{classify, RequestType};
use crate::forward::Forwarder;
use crate::http::ApiFailure;
use crate::notify::Notifier;
use crate::record::{finalize, PersistContext};
use crate::relay::{passthrough_headers, relay_streaming};
use crate::response::ProxyResponse;

/// OPTIONS /v1/messages — CORS preflight.
pub async fn preflight_handler() -> impl IntoResponse {
    (
        StatusCode::NO_CONTENT,
        [
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (header::ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, OPTIONS"),
            (
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                "Content-Type, Authorization, X-API-Key",
            ),
            (header::ACCESS_CONTROL_MAX_AGE, "86400"),
        ],
    )
}

pub async fn messages_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = Uuid::new_v4();
    match handle(state, headers, body, request_id).await {
        Ok(response) => response,
        Err(failure) => failure.into_response(),
    }
}

async fn handle(
    state: Arc<AppState>,
    headers: HeaderMap,
    body: Bytes,
    request_id: Uuid,
) -> Result<Response, ApiFailure> {
    let started = Instant::now();
    let timestamp = Utc::now();

    // ── host binding + client auth ───────────────────────────────────────
    let host = auth::extract_host(&headers).map_err(|e| ApiFailure::new(e, request_id))?;

    let descriptor = state
        .credentials
        .descriptor_for_host(&host)
        .await
        .map_err(|e| match e {
            CredentialError::UnknownDomain(_) => ApiFailure::with_realm(
                PrismError::Authentication("unknown domain".into()),
                request_id,
                &host,
            ),
            other => ApiFailure::new(PrismError::Credential(other.to_string()), request_id),
        })?;

    if state.config.enable_client_auth {
        let token =
            auth::bearer_token(&headers).map_err(|e| ApiFailure::with_realm(e, request_id, &host))?;
        if !client_key_matches(&token, &descriptor.client_api_key) {
            return Err(ApiFailure::with_realm(
                PrismError::Authentication("invalid client key".into()),
                request_id,
                &host,
            ));
        }
    }

    // ── parse + classify ─────────────────────────────────────────────────
    let request: MessagesRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiFailure::new(PrismError::Validation(e.to_string()), request_id))?;
    let input_body: Value = serde_json::from_slice(&body)
        .map_err(|e| ApiFailure::new(PrismError::Validation(e.to_string()), request_id))?;
    let request_type = classify(&request);

    // ── conversation linkage ─────────────────────────────────────────────
    let linkage = match &state.store {
        Some(store) => link(store, &request, timestamp).await,
        None => link(&Unlinked, &request, timestamp).await,
    }
    .map_err(|e| ApiFailure::new(PrismError::Internal(e.to_string()), request_id))?;

    // ── account selection + auth material ────────────────────────────────
    let (account_id, material) = match descriptor.kind {
        CredentialKind::Pool => {
            let pool = descriptor.pool.as_ref().ok_or_else(|| {
                ApiFailure::new(
                    PrismError::Credential("pool descriptor without members".into()),
                    request_id,
                )
            })?;
            let sticky = state.sticky.get(linkage.conversation_id, &linkage.branch_id);
            let account = select_account(
                pool,
                sticky.as_deref(),
                state.config.pool_output_token_budget,
                |id| state.metrics.account_output_tokens(id),
            )
            .map_err(|e| {
                ApiFailure::new(PrismError::RateLimitExhausted(e.to_string()), request_id)
            })?;
            state
                .sticky
                .pin(linkage.conversation_id, &linkage.branch_id, &account);

            let member = state
                .credentials
                .member_descriptor(&account)
                .await
                .map_err(|e| {
                    ApiFailure::new(PrismError::Credential(e.to_string()), request_id)
                })?;
            let material = state
                .credentials
                .auth_material(&account, &member)
                .await
                .map_err(|e| {
                    ApiFailure::new(PrismError::Credential(e.to_string()), request_id)
                })?;
            (account, material)
        }
        _ => {
            let material = state
                .credentials
                .auth_material(&host, &descriptor)
                .await
                .map_err(|e| {
                    ApiFailure::new(PrismError::Credential(e.to_string()), request_id)
                })?;
            (descriptor.account_id.clone(), material)
        }
    };

    let ctx = PersistContext {
        request_id,
        domain: host.clone(),
        timestamp,
        started,
        account_id: Some(account_id),
        model: request.model.clone(),
        request_type,
        input_body,
        message_count: request.message_count() as i32,
        linkage: linkage.clone(),
        notify_content: Notifier::notification_content(&request),
    };

    let id_headers = linkage_headers(request_id, &linkage);

    // ── quota short-circuit: answered from the rolling counter ───────────
    if request_type == RequestType::Quota {
        return Ok(quota_response(&state, ctx, id_headers));
    }

    info!(
        request_id = %request_id,
        domain = %host,
        model = %request.model,
        request_type = %request_type,
        streaming = request.stream,
        conversation_id = %linkage.conversation_id,
        branch_id = %linkage.branch_id,
        "forwarding request"
    );

    // ── forward ──────────────────────────────────────────────────────────
    let out_headers = Forwarder::build_headers(&headers, &material);
    let deadline = Duration::from_millis(state.config.claude_api_timeout_ms);

    if request.stream {
        let upstream = match state.forwarder.send(out_headers, body).await {
            Ok(upstream) => upstream,
            Err(e) => {
                let status = e.http_status();
                finalize(
                    &state,
                    ctx,
                    ProxyResponse::default(),
                    None,
                    status,
                    true,
                    Vec::new(),
                    None,
                    false,
                );
                return Err(ApiFailure::new(e, request_id));
            }
        };
        Ok(relay_streaming(state.clone(), ctx, upstream, deadline, id_headers))
    } else {
        let (status, resp_headers, resp_body) = match state
            .forwarder
            .send_buffered(out_headers, body, deadline)
            .await
        {
            Ok(ok) => ok,
            Err(e) => {
                let status = e.http_status();
                finalize(
                    &state,
                    ctx,
                    ProxyResponse::default(),
                    None,
                    status,
                    false,
                    Vec::new(),
                    None,
                    false,
                );
                return Err(ApiFailure::new(e, request_id));
            }
        };

        let summary = ProxyResponse::from_buffered(&resp_body);
        let response_body = serde_json::from_slice::<Value>(&resp_body).ok();
        if !status.is_success() {
            warn!(request_id = %request_id, status = status.as_u16(), "upstream error passed through");
        }
        finalize(
            &state,
            ctx,
            summary,
            response_body,
            status.as_u16(),
            false,
            Vec::new(),
            None,
            status.is_success(),
        );

        let mut headers_out = passthrough_headers(&resp_headers);
        headers_out.extend(id_headers);
        let mut response = Response::new(axum::body::Body::from(resp_body));
        *response.status_mut() =
            StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        *response.headers_mut() = headers_out;
        Ok(response)
    }
}

/// The identifying response headers every relay answer carries.
fn linkage_headers(request_id: Uuid, linkage: &Linkage) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let mut put = |name: &'static str, value: String| {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    };
    put("x-request-id", request_id.to_string());
    put("x-conversation-id", linkage.conversation_id.to_string());
    put("x-branch-id", linkage.branch_id.clone());
    if let Some(parent) = linkage.parent_request_id {
        put("x-parent-request-id", parent.to_string());
    }
    headers
}

/// Quota probes are answered locally from the writer's read path and still
/// persisted as `quota` rows.
fn quota_response(state: &AppState, ctx: PersistContext, id_headers: HeaderMap) -> Response {
    let totals = state.metrics.domain_totals(&ctx.domain);
    let body = json!({
        "request_type": "quota",
        "domain": ctx.domain,
        "window_seconds": state.config.pool_window_seconds,
        "usage": totals,
    });

    finalize(
        state,
        ctx,
        ProxyResponse::default(),
        Some(body.clone()),
        200,
        false,
        Vec::new(),
        None,
        false,
    );

    let mut response = Response::new(axum::body::Body::from(body.to_string()));
    *response.status_mut() = StatusCode::OK;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response.headers_mut().extend(id_headers);
    response
}

/// Link store used when storage is disabled: every request starts a fresh
/// conversation.
struct Unlinked;

#[async_trait]
impl LinkStore for Unlinked {
    async fn requests_with_current_hash(
        &self,
        _hash: &str,
    ) -> prism_linker::Result<Vec<PriorRequest>> {
        Ok(Vec::new())
    }

    async fn requests_with_parent_hash(
        &self,
        _hash: &str,
    ) -> prism_linker::Result<Vec<PriorRequest>> {
        Ok(Vec::new())
    }

    async fn find_task_invocation(
        &self,
        _prompt: &str,
        _since: DateTime<Utc>,
    ) -> prism_linker::Result<Option<TaskMatch>> {
        Ok(None)
    }
}
