//! Streaming relay: a byte-for-byte SSE pipe with in-flight parsing.
//!
//! The driver task owns the upstream connection and the per-request
//! [`StreamState`]. The handler returns a channel-backed body immediately;
//! when the client disconnects, the channel closes, the driver drops the
//! upstream read, and a partial record is still persisted with status 499.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::app::AppState;
use crate::record::{finalize, PersistContext};
use crate::response::StreamState;

/// Client abort, nginx convention.
const STATUS_CLIENT_CLOSED: u16 = 499;

/// Response headers never copied from upstream: the relay re-frames the
/// body, so length/encoding bookkeeping must come from our server.
const SKIPPED_RESPONSE_HEADERS: &[&str] =
    &["content-length", "transfer-encoding", "connection"];

pub fn passthrough_headers(upstream: &reqwest::header::HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in upstream {
        if SKIPPED_RESPONSE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.append(name, value);
        }
    }
    out
}

/// Relay an upstream SSE response to the client and persist the outcome.
pub fn relay_streaming(
    state: Arc<AppState>,
    ctx: PersistContext,
    upstream: reqwest::Response,
    deadline: Duration,
    extra_headers: HeaderMap,
) -> Response {
    let status = StatusCode::from_u16(upstream.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let mut headers = passthrough_headers(upstream.headers());
    headers.extend(extra_headers);

    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(32);
    tokio::spawn(drive(state, ctx, upstream, tx, deadline));

    let mut response = Response::new(Body::from_stream(ReceiverStream::new(rx)));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

async fn drive(
    state: Arc<AppState>,
    ctx: PersistContext,
    upstream: reqwest::Response,
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
    deadline: Duration,
) {
    let upstream_status = upstream.status().as_u16();
    let mut stream_state = StreamState::new();
    let mut chunks: Vec<String> = Vec::new();
    let mut first_token_ms: Option<i64> = None;
    let mut client_gone = false;

    let mut byte_stream = upstream.bytes_stream();
    loop {
        let Some(remaining) = deadline.checked_sub(ctx.started.elapsed()) else {
            warn!(request_id = %ctx.request_id, "request deadline reached mid-stream");
            break;
        };
        match tokio::time::timeout(remaining, byte_stream.next()).await {
            Err(_) => {
                warn!(request_id = %ctx.request_id, "request deadline reached mid-stream");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                warn!(request_id = %ctx.request_id, error = %e, "upstream stream error");
                break;
            }
            Ok(Some(Ok(bytes))) => {
                first_token_ms
                    .get_or_insert_with(|| ctx.started.elapsed().as_millis() as i64);
                chunks.push(String::from_utf8_lossy(&bytes).into_owned());
                stream_state.feed(&bytes);
                if tx.send(Ok(bytes)).await.is_err() {
                    debug!(request_id = %ctx.request_id, "client closed; cancelling upstream");
                    client_gone = true;
                    break;
                }
            }
        }
    }
    // Dropping the byte stream tears down the upstream connection.
    drop(byte_stream);

    let complete = stream_state.is_complete();
    let response_status = if client_gone {
        STATUS_CLIENT_CLOSED
    } else {
        upstream_status
    };
    let response = stream_state.into_response();

    // The assembled body is what dashboards read; raw chunks keep the exact
    // wire form.
    let response_body = if response.content.is_empty() && response.tool_calls.is_empty() {
        None
    } else {
        serde_json::to_value(AssembledBody {
            content: &response.content,
            tool_calls: &response.tool_calls,
            stop_reason: response.stop_reason.as_deref(),
            usage: response.full_usage_data.clone(),
        })
        .ok()
    };

    finalize(
        &state,
        ctx,
        response,
        response_body,
        response_status,
        true,
        chunks,
        first_token_ms,
        complete && !client_gone,
    );
}

#[derive(serde::Serialize)]
struct AssembledBody<'a> {
    content: &'a str,
    tool_calls: &'a [prism_protocol::ToolCall],
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_reason: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    usage: Option<serde_json::Value>,
}
