use thiserror::Error;

/// Worker-side failures. Everything here is transient from the queue's
/// perspective: the job goes back to `pending` until the attempt cap turns
/// it into a permanent `failed`.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("storage: {0}")]
    Storage(#[from] prism_storage::StorageError),

    #[error("analysis model call failed: {0}")]
    Model(String),

    #[error("analysis response failed schema validation: {0}")]
    Schema(String),

    #[error("conversation has no analyzable messages")]
    EmptyConversation,
}

pub type Result<T> = std::result::Result<T, WorkerError>;
