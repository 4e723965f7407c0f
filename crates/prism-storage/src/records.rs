//! Request/chunk rows and the read queries the proxy and worker need.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use prism_linker::{LinkError, LinkStore, PriorRequest, TaskMatch};

use crate::error::Result;

/// One row of `api_requests`, immutable once written.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApiRequestRecord {
    pub request_id: Uuid,
    pub domain: String,
    pub timestamp: DateTime<Utc>,
    pub account_id: Option<String>,
    pub model: String,
    pub request_type: String,
    pub input_body: Option<Value>,
    pub response_body: Option<Value>,
    pub response_status: i32,
    pub response_streaming: bool,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_input_tokens: i64,
    pub cache_read_input_tokens: i64,
    pub tool_call_count: i32,
    pub message_count: i32,
    pub duration_ms: Option<i64>,
    pub first_token_ms: Option<i64>,
    pub conversation_id: Option<Uuid>,
    pub branch_id: String,
    pub current_message_hash: Option<String>,
    pub parent_message_hash: Option<String>,
    pub system_hash: Option<String>,
    pub parent_request_id: Option<Uuid>,
    pub parent_task_request_id: Option<Uuid>,
    pub is_subtask: bool,
    pub task_tool_invocation: Option<Value>,
}

/// One conversation row reduced to what the analysis prompt builder needs.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TranscriptRow {
    pub timestamp: DateTime<Utc>,
    pub input_body: Option<Value>,
    pub response_body: Option<Value>,
}

#[derive(Clone)]
pub struct RequestStore {
    pool: PgPool,
}

impl RequestStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert one request row. Idempotent on `request_id`: replays after a
    /// crash hit the conflict arm and report `false`.
    pub async fn insert_request(&self, r: &ApiRequestRecord) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO api_requests
             (request_id, domain, timestamp, account_id, model, request_type,
              input_body, response_body, response_status, response_streaming,
              input_tokens, output_tokens, cache_creation_input_tokens,
              cache_read_input_tokens, tool_call_count, message_count,
              duration_ms, first_token_ms, conversation_id, branch_id,
              current_message_hash, parent_message_hash, system_hash,
              parent_request_id, parent_task_request_id, is_subtask,
              task_tool_invocation)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,
                     $17,$18,$19,$20,$21,$22,$23,$24,$25,$26,$27)
             ON CONFLICT (request_id) DO NOTHING",
        )
        .bind(r.request_id)
        .bind(&r.domain)
        .bind(r.timestamp)
        .bind(&r.account_id)
        .bind(&r.model)
        .bind(&r.request_type)
        .bind(&r.input_body)
        .bind(&r.response_body)
        .bind(r.response_status)
        .bind(r.response_streaming)
        .bind(r.input_tokens)
        .bind(r.output_tokens)
        .bind(r.cache_creation_input_tokens)
        .bind(r.cache_read_input_tokens)
        .bind(r.tool_call_count)
        .bind(r.message_count)
        .bind(r.duration_ms)
        .bind(r.first_token_ms)
        .bind(r.conversation_id)
        .bind(&r.branch_id)
        .bind(&r.current_message_hash)
        .bind(&r.parent_message_hash)
        .bind(&r.system_hash)
        .bind(r.parent_request_id)
        .bind(r.parent_task_request_id)
        .bind(r.is_subtask)
        .bind(&r.task_tool_invocation)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Append the raw SSE chunks for a streaming request, preserving order.
    pub async fn insert_chunks(&self, request_id: Uuid, chunks: &[String]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let mut builder = sqlx::QueryBuilder::<sqlx::Postgres>::new(
            "INSERT INTO streaming_chunks (request_id, chunk_index, data) ",
        );
        builder.push_values(chunks.iter().enumerate(), |mut b, (index, data)| {
            b.push_bind(request_id)
                .push_bind(index as i32)
                .push_bind(data);
        });
        builder.push(" ON CONFLICT (request_id, chunk_index) DO NOTHING");
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    /// Newest rows of one conversation branch, returned in ascending
    /// timestamp order for transcript assembly.
    pub async fn conversation_transcript(
        &self,
        conversation_id: Uuid,
        branch_id: &str,
        limit: i64,
    ) -> Result<Vec<TranscriptRow>> {
        let rows: Vec<TranscriptRow> = sqlx::query_as(
            "SELECT timestamp, input_body, response_body FROM
               (SELECT timestamp, input_body, response_body
                  FROM api_requests
                 WHERE conversation_id = $1 AND branch_id = $2
                 ORDER BY timestamp DESC
                 LIMIT $3) newest
             ORDER BY timestamp ASC",
        )
        .bind(conversation_id)
        .bind(branch_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PriorRequestRow {
    request_id: Uuid,
    conversation_id: Option<Uuid>,
    branch_id: String,
    timestamp: DateTime<Utc>,
    current_message_hash: Option<String>,
}

impl PriorRequestRow {
    fn into_prior(self) -> Option<PriorRequest> {
        Some(PriorRequest {
            request_id: self.request_id,
            conversation_id: self.conversation_id?,
            branch_id: self.branch_id,
            timestamp: self.timestamp,
            current_message_hash: self.current_message_hash,
        })
    }
}

/// Candidate rows examined per sub-task lookback; the exact prompt match
/// runs in application code.
const TASK_LOOKBACK_LIMIT: i64 = 100;

/// True when `invocations` (a `task_tool_invocation` array) contains a Task
/// call whose `input.prompt` equals `prompt` exactly.
pub fn matches_task_prompt(invocations: &Value, prompt: &str) -> bool {
    invocations
        .as_array()
        .map(|items| {
            items.iter().any(|item| {
                item.get("name").and_then(Value::as_str) == Some("Task")
                    && item
                        .pointer("/input/prompt")
                        .and_then(Value::as_str)
                        == Some(prompt)
            })
        })
        .unwrap_or(false)
}

#[async_trait]
impl LinkStore for RequestStore {
    async fn requests_with_current_hash(
        &self,
        hash: &str,
    ) -> std::result::Result<Vec<PriorRequest>, LinkError> {
        let rows: Vec<PriorRequestRow> = sqlx::query_as(
            "SELECT request_id, conversation_id, branch_id, timestamp,
                    current_message_hash
               FROM api_requests
              WHERE current_message_hash = $1",
        )
        .bind(hash)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LinkError::Store(e.to_string()))?;
        Ok(rows.into_iter().filter_map(PriorRequestRow::into_prior).collect())
    }

    async fn requests_with_parent_hash(
        &self,
        hash: &str,
    ) -> std::result::Result<Vec<PriorRequest>, LinkError> {
        let rows: Vec<PriorRequestRow> = sqlx::query_as(
            "SELECT request_id, conversation_id, branch_id, timestamp,
                    current_message_hash
               FROM api_requests
              WHERE parent_message_hash = $1",
        )
        .bind(hash)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LinkError::Store(e.to_string()))?;
        Ok(rows.into_iter().filter_map(PriorRequestRow::into_prior).collect())
    }

    async fn find_task_invocation(
        &self,
        prompt: &str,
        since: DateTime<Utc>,
    ) -> std::result::Result<Option<TaskMatch>, LinkError> {
        #[derive(sqlx::FromRow)]
        struct Candidate {
            request_id: Uuid,
            timestamp: DateTime<Utc>,
            task_tool_invocation: Value,
        }

        let candidates: Vec<Candidate> = sqlx::query_as(
            "SELECT request_id, timestamp, task_tool_invocation
               FROM api_requests
              WHERE task_tool_invocation IS NOT NULL AND timestamp >= $1
              ORDER BY timestamp DESC
              LIMIT $2",
        )
        .bind(since)
        .bind(TASK_LOOKBACK_LIMIT)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LinkError::Store(e.to_string()))?;

        Ok(candidates
            .into_iter()
            .find(|c| matches_task_prompt(&c.task_tool_invocation, prompt))
            .map(|c| TaskMatch {
                request_id: c.request_id,
                timestamp: c.timestamp,
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_prompt_matching_is_exact() {
        let invocations = json!([
            {"name": "Bash", "id": "t0", "input": {"command": "ls"}},
            {"name": "Task", "id": "t1", "input": {"prompt": "survey the auth module"}},
        ]);
        assert!(matches_task_prompt(&invocations, "survey the auth module"));
        assert!(!matches_task_prompt(&invocations, "survey the auth"));
        assert!(!matches_task_prompt(&invocations, "ls"));
        assert!(!matches_task_prompt(&json!(null), "anything"));
    }
}
