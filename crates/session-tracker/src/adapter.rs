use async_trait::async_trait;
use common::streams::{ActiveStream, BackendKind};
use std::time::Duration;
use thiserror::Error;

/// Failure modes of one backend request. Transient failures skip the
/// backend for the current tick without disturbing others.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("backend returned HTTP {status}")]
    Http { status: u16 },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed backend response: {0}")]
    Malformed(String),
}

impl AdapterError {
    pub fn from_reqwest(err: reqwest::Error, deadline: Duration) -> Self {
        if err.is_timeout() {
            AdapterError::Timeout(deadline)
        } else if let Some(status) = err.status() {
            AdapterError::Http {
                status: status.as_u16(),
            }
        } else {
            AdapterError::Transport(err.to_string())
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            AdapterError::Timeout(_) | AdapterError::Transport(_) => true,
            AdapterError::Http { status } => *status >= 500,
            AdapterError::Malformed(_) => false,
        }
    }
}

/// One media-server backend, normalized to the internal stream model.
/// Implementations own their HTTP state and must honor the deadline on
/// every call.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> BackendKind;

    async fn get_sessions(&self, deadline: Duration) -> Result<Vec<ActiveStream>, AdapterError>;
    async fn test_connection(&self, deadline: Duration) -> Result<(), AdapterError>;
}
