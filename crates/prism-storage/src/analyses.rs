//! Analysis result rows, one per `(conversation_id, branch_id)`.

use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;

/// Output of one completed analysis, ready to upsert.
#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub conversation_id: Uuid,
    pub branch_id: String,
    /// Human-readable analysis text.
    pub content: String,
    /// Structured form, schema-validated by the worker.
    pub data: Value,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

#[derive(Clone)]
pub struct AnalysisStore {
    pool: PgPool,
}

impl AnalysisStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert or replace the analysis for a branch. `updated_at` is bumped
    /// by the table trigger on the update arm.
    pub async fn upsert(&self, result: &AnalysisResult) -> Result<()> {
        sqlx::query(
            "INSERT INTO conversation_analyses
             (conversation_id, branch_id, content, data, model,
              input_tokens, output_tokens)
             VALUES ($1,$2,$3,$4,$5,$6,$7)
             ON CONFLICT (conversation_id, branch_id) DO UPDATE
                SET content = EXCLUDED.content,
                    data = EXCLUDED.data,
                    model = EXCLUDED.model,
                    input_tokens = EXCLUDED.input_tokens,
                    output_tokens = EXCLUDED.output_tokens,
                    generated_at = now()",
        )
        .bind(result.conversation_id)
        .bind(&result.branch_id)
        .bind(&result.content)
        .bind(&result.data)
        .bind(&result.model)
        .bind(result.input_tokens)
        .bind(result.output_tokens)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
