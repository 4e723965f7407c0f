use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::error::Result;

const SCHEMA: &str = include_str!("schema.sql");

/// Open the shared connection pool. All writers use this pool; analytical
/// readers (the dashboard) are expected to configure their own.
pub async fn connect(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;
    info!("database pool connected");
    Ok(pool)
}

/// Apply the authoritative schema. Idempotent; used by tests and
/// provisioning tooling, never by the running binaries.
pub async fn apply_schema(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}
