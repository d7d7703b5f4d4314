use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("TRANSPORT: {0}")]
    Transport(String),
    #[error("ANALYSIS: {0}")]
    Analysis(String),
    #[error("DISPATCH: {0}")]
    Dispatch(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("REJECTED: {0}")]
    Rejected(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<anyhow::Error> for SyncError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
