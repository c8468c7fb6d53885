use thiserror::Error;

use crate::credentials::AuthError;
use crate::language_model::BackendError;

/// Failures that end a `send_message` call. History is left as it was before
/// the call in every case.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("message cannot be empty")]
    EmptyMessage,
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("backend contract violation: {0}")]
    ContractViolation(String),
}

impl AgentError {
    /// Whether resubmitting the same message may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AgentError::EmptyMessage)
    }
}
