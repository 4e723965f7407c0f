//! Postgres storage for the proxy and the analysis worker.
//!
//! Append-only request records with an asynchronous at-least-once writer,
//! the durable analysis job queue, and analysis result upserts. Schema
//! creation itself belongs to ops tooling; `schema.sql` is the authoritative
//! layout and `apply_schema` exists for tests and provisioning scripts.

pub mod analyses;
pub mod db;
pub mod error;
pub mod jobs;
pub mod records;
pub mod writer;

pub use analyses::{AnalysisResult, AnalysisStore};
pub use db::{apply_schema, connect};
pub use error::{Result, StorageError};
pub use jobs::{AnalysisJob, JobOutcome, JobQueue};
pub use records::{ApiRequestRecord, RequestStore, TranscriptRow};
pub use writer::{RequestWriter, WriteJob, WriterHandle};
