//! Persistence glue shared by the buffered and streaming paths: carries the
//! request-side facts through the forward, then turns the response summary
//! into one writer job plus metrics and the notification hook.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use prism_linker::Linkage;
use prism_storage::{ApiRequestRecord, WriteJob};

use crate::app::AppState;
use crate::classify::RequestType;
use crate::notify::NotificationContext;
use crate::response::ProxyResponse;

/// Everything known about a request before the upstream call.
pub struct PersistContext {
    pub request_id: Uuid,
    pub domain: String,
    pub timestamp: DateTime<Utc>,
    pub started: Instant,
    pub account_id: Option<String>,
    pub model: String,
    pub request_type: RequestType,
    pub input_body: Value,
    pub message_count: i32,
    pub linkage: Linkage,
    /// Precomputed so the notification hook never re-reads the body.
    pub notify_content: String,
}

/// Terminal bookkeeping for one request. Called exactly once per request,
/// whether it completed, failed upstream, or the client went away.
#[allow(clippy::too_many_arguments)]
pub fn finalize(
    state: &AppState,
    ctx: PersistContext,
    response: ProxyResponse,
    response_body: Option<Value>,
    response_status: u16,
    streaming: bool,
    chunks: Vec<String>,
    first_token_ms: Option<i64>,
    complete: bool,
) {
    let duration_ms = ctx.started.elapsed().as_millis() as i64;

    state
        .metrics
        .record(&ctx.domain, ctx.account_id.as_deref(), &response.usage);

    if let Some(writer) = &state.writer {
        let record = ApiRequestRecord {
            request_id: ctx.request_id,
            domain: ctx.domain.clone(),
            timestamp: ctx.timestamp,
            account_id: ctx.account_id.clone(),
            model: ctx.model.clone(),
            request_type: ctx.request_type.as_str().to_string(),
            input_body: Some(ctx.input_body.clone()),
            response_body,
            response_status: response_status as i32,
            response_streaming: streaming,
            input_tokens: response.usage.input_tokens as i64,
            output_tokens: response.usage.output_tokens as i64,
            cache_creation_input_tokens: response.usage.cache_creation_input_tokens as i64,
            cache_read_input_tokens: response.usage.cache_read_input_tokens as i64,
            tool_call_count: response.tool_call_count as i32,
            message_count: ctx.message_count,
            duration_ms: Some(duration_ms),
            first_token_ms,
            conversation_id: Some(ctx.linkage.conversation_id),
            branch_id: ctx.linkage.branch_id.clone(),
            current_message_hash: ctx.linkage.current_message_hash.clone(),
            parent_message_hash: ctx.linkage.parent_message_hash.clone(),
            system_hash: ctx.linkage.system_hash.clone(),
            parent_request_id: ctx.linkage.parent_request_id,
            parent_task_request_id: ctx.linkage.parent_task_request_id,
            is_subtask: ctx.linkage.is_subtask,
            task_tool_invocation: response.task_invocations(),
        };
        writer.enqueue(WriteJob { record, chunks });
    }

    // Only full inference responses notify; partial streams and helper
    // traffic stay quiet.
    if complete && ctx.request_type == RequestType::Inference {
        state.notifier.notify(
            NotificationContext {
                domain: &ctx.domain,
                request_id: &ctx.request_id.to_string(),
                conversation_id: &ctx.linkage.conversation_id.to_string(),
                branch_id: &ctx.linkage.branch_id,
                model: &ctx.model,
            },
            ctx.notify_content.clone(),
            &response,
        );
    }
}
