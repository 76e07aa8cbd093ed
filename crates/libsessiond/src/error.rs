use thiserror::Error;

use sessiond_protocol::{ErrorCode, PathInternal, PathPublic, SessionId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionsError {
    #[error("path {path} is owned by another session")]
    SessionWrongPrevious { path: PathPublic },

    #[error("descriptor not found: {0}")]
    DescriptorNotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// The service could not build its answer.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SessionsError {
    pub(crate) fn unknown_public(path: &PathPublic) -> Self {
        SessionsError::DescriptorNotFound(path.to_string())
    }

    pub(crate) fn unknown_internal(path: &PathInternal) -> Self {
        SessionsError::DescriptorNotFound(path.to_string())
    }

    /// Convert to the wire error code.
    pub fn to_error_code(&self) -> ErrorCode {
        match self {
            SessionsError::SessionWrongPrevious { .. } => ErrorCode::SessionWrongPrevious,
            SessionsError::DescriptorNotFound(_) => ErrorCode::DescriptorNotFound,
            SessionsError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            SessionsError::Internal(_) => ErrorCode::ServerError,
        }
    }
}

/// Failure of a typed client call.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The service answered with a failure envelope.
    #[error("request rejected: {code}")]
    Rejected {
        code: ErrorCode,
        message: Option<String>,
    },

    #[error("malformed response payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Channel(#[from] anyhow::Error),
}

impl ClientError {
    /// The rejection kind, if the service answered with one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }
}
