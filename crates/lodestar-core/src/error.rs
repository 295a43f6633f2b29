//! Lodestar domain error types.

use lodestar_common::error::ErrorCode;
use lodestar_crypto::keys::CryptoError;

use crate::records::NodeClass;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum LodestarError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("insufficient role: requires one of {0}")]
    Authorization(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("{message}")]
    Conflict { message: String, retryable: bool },

    #[error("no addresses remain in the {0} range")]
    Exhausted(NodeClass),

    #[error("authentication service unavailable: {0}")]
    Upstream(String),

    #[error("credential rejected by authentication service (HTTP {0})")]
    UpstreamRejected(u16),

    #[error("rate limit exceeded ({limit} requests per window), retry in {retry_after_secs} seconds")]
    RateLimited { limit: u32, retry_after_secs: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl LodestarError {
    /// Whether the caller may retry the identical request.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Conflict { retryable, .. } => *retryable,
            Self::Upstream(_) | Self::RateLimited { .. } => true,
            _ => false,
        }
    }
}

impl From<StoreError> for LodestarError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateNode { .. } => Self::Conflict {
                message: e.to_string(),
                retryable: false,
            },
            StoreError::AddressInUse(_) => Self::Conflict {
                message: e.to_string(),
                retryable: true,
            },
            StoreError::Io(_) | StoreError::Unavailable(_) => Self::Persistence(e.to_string()),
        }
    }
}

impl From<CryptoError> for LodestarError {
    fn from(e: CryptoError) -> Self {
        Self::Signing(e.to_string())
    }
}

impl From<&LodestarError> for ErrorCode {
    fn from(e: &LodestarError) -> Self {
        match e {
            LodestarError::Authentication(_) | LodestarError::UpstreamRejected(_) => {
                ErrorCode::Unauthenticated
            }
            LodestarError::Authorization(_) => ErrorCode::Forbidden,
            LodestarError::Validation(_) => ErrorCode::InvalidPayload,
            LodestarError::Conflict { .. } => ErrorCode::Conflict,
            LodestarError::Exhausted(_) => ErrorCode::AddressExhausted,
            LodestarError::Upstream(_) => ErrorCode::UpstreamUnavailable,
            LodestarError::RateLimited { .. } => ErrorCode::RateLimited,
            LodestarError::NotFound(_) => ErrorCode::NotFound,
            LodestarError::Persistence(_) => ErrorCode::PersistenceError,
            LodestarError::Signing(_) => ErrorCode::SigningFailed,
            LodestarError::Config(_) => ErrorCode::Internal,
        }
    }
}
