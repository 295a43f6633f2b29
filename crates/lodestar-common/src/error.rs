use serde::{Deserialize, Serialize};

/// Machine-readable error codes for the wire protocol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidPayload,
    InvalidName,
    Unauthenticated,
    Forbidden,
    NotFound,
    Conflict,
    RateLimited,
    AddressExhausted,
    UpstreamUnavailable,
    PersistenceError,
    SigningFailed,
    Internal,
}

impl ErrorCode {
    /// Suggested HTTP status code for this error.
    /// Transport-agnostic (returns u16, not an axum type).
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidPayload | Self::InvalidName => 400,
            Self::Unauthenticated => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::RateLimited => 429,
            Self::UpstreamUnavailable => 502,
            Self::AddressExhausted => 503,
            Self::PersistenceError | Self::SigningFailed | Self::Internal => 500,
        }
    }

    /// Whether a client may reasonably retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict | Self::RateLimited | Self::UpstreamUnavailable
        )
    }
}
