use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link store query failed: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, LinkError>;
