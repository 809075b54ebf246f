use std::time::Duration;

use thiserror::Error;

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("chromium launch failed: {0}")]
    Launch(String),
    #[error("cdp error: {0}")]
    Cdp(#[from] chromiumoxide::error::CdpError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("script evaluation failed: {0}")]
    Script(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("no idle session became available within {0:?}")]
    AcquireTimeout(Duration),
    #[error("session pool is closed")]
    PoolClosed,
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl From<tokio::task::JoinError> for SessionError {
    fn from(err: tokio::task::JoinError) -> Self {
        SessionError::Unexpected(err.to_string())
    }
}
