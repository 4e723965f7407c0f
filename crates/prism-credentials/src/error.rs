use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no credentials for domain: {0}")]
    UnknownDomain(String),

    #[error("invalid credential file {path}: {reason}")]
    Invalid { path: String, reason: String },

    #[error("credential file read timed out: {0}")]
    ReadTimeout(String),

    #[error("OAuth refresh failed for {account_id}: {reason}")]
    RefreshFailed { account_id: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CredentialError>;
