use shared::{
    domain::MessageId,
    error::{ApiError, ErrorCode},
};
use thiserror::Error;

use crate::thread::LocalId;

/// Failure reported by a backend collaborator call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("{code:?}: {message}")]
    Rejected { code: ErrorCode, message: String },
}

impl BackendError {
    pub fn rejected(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Rejected {
            code,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::Connection(_) => true,
            Self::Rejected { code, .. } => code.is_retryable(),
        }
    }

    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<ApiError> for BackendError {
    fn from(value: ApiError) -> Self {
        Self::Rejected {
            code: value.code,
            message: value.message,
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            Self::Timeout
        } else if value.is_decode() {
            Self::rejected(ErrorCode::Internal, format!("malformed response: {value}"))
        } else if let Some(status) = value.status() {
            Self::rejected(crate::http::code_for_status(status), value.to_string())
        } else {
            Self::Connection(value.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("message body must not be empty")]
    EmptyBody,
    #[error("attachment {filename} is {size_bytes} bytes, limit is {limit_bytes}")]
    AttachmentTooLarge {
        filename: String,
        size_bytes: u64,
        limit_bytes: u64,
    },
    #[error("reaction must not be empty")]
    EmptyReaction,
    #[error("no recipient selected")]
    MissingRecipient,
    #[error("message {0} has been deleted")]
    TargetDeleted(String),
    #[error("message {0} has not been delivered yet")]
    TargetNotDelivered(String),
    #[error("rejected by server: {0}")]
    Server(String),
}

/// Typed outcome of a failed mutation. Nothing in the pipeline panics or
/// swallows these; the caller decides how to present them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MutationError {
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),
    #[error("mutation failed and can be retried: {reason}")]
    Transient {
        local_id: Option<LocalId>,
        reason: String,
    },
    #[error("message {message_id} changed concurrently: {reason}")]
    Conflict {
        message_id: MessageId,
        reason: String,
    },
    #[error("not permitted: {0}")]
    Permission(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unknown mutation {0}")]
    UnknownMutation(LocalId),
}

impl MutationError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn transient(reason: impl std::fmt::Display) -> Self {
        Self::Transient {
            local_id: None,
            reason: reason.to_string(),
        }
    }

    /// Maps a collaborator failure onto the mutation taxonomy.
    pub fn from_backend(
        err: BackendError,
        local_id: Option<LocalId>,
        message_id: Option<MessageId>,
    ) -> Self {
        if err.is_transient() {
            return Self::Transient {
                local_id,
                reason: err.to_string(),
            };
        }
        let BackendError::Rejected { code, message } = err else {
            return Self::Transient {
                local_id,
                reason: err.to_string(),
            };
        };
        match code {
            ErrorCode::Conflict => match message_id {
                Some(message_id) => Self::Conflict {
                    message_id,
                    reason: message,
                },
                None => Self::NotFound(message),
            },
            ErrorCode::NotFound => Self::NotFound(message),
            ErrorCode::Unauthorized | ErrorCode::Forbidden => Self::Permission(message),
            ErrorCode::Validation => Self::Validation(ValidationError::Server(message)),
            ErrorCode::RateLimited | ErrorCode::Internal => Self::Transient {
                local_id,
                reason: message,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("load failed after {attempts} attempt(s): {source}")]
    Backend {
        attempts: usize,
        #[source]
        source: BackendError,
    },
    #[error("load superseded by a newer selection")]
    Cancelled,
}

impl LoadError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend { source, .. } if source.is_transient())
    }
}
