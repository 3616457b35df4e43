use shared::{
    domain::MessageId,
    error::{ApiError, ErrorCode},
};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("unknown conversation {0}")]
    UnknownConversation(String),
    #[error("message {0} is not in a retryable state")]
    NotRetryable(MessageId),
}

impl SyncError {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::AccessDenied(_))
    }
}

impl From<ApiError> for SyncError {
    fn from(err: ApiError) -> Self {
        match err.code {
            ErrorCode::Unauthorized => Self::Auth(err.message),
            ErrorCode::Forbidden => Self::AccessDenied(err.message),
            _ => Self::Persistence(err.message),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}
