use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    /// The target changed under the caller (stale `base_version` or concurrent delete).
    Conflict,
    RateLimited,
    Internal,
}

impl ErrorCode {
    /// Codes a client may retry without changing the request.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::RateLimited | Self::Internal)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}
