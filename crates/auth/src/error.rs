//! Authentication/authorization error taxonomy.

use thiserror::Error;

use keystone_core::DomainError;

use crate::TokenValidationError;

pub type AuthResult<T> = Result<T, AuthError>;

/// How a pipeline stage reacts to an error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Ends the request.
    Fatal,
    /// Hand over to the refresh orchestrator.
    Recoverable,
    /// Re-read current state and try again (at most once).
    Retryable,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Bad signature or structure. Forces re-authentication.
    #[error("invalid token")]
    InvalidToken,

    /// Well-formed credential past its `exp`. Routes to the orchestrator.
    #[error("token expired")]
    TokenExpired,

    /// The refresh credential is invalid, expired or revoked, or the session
    /// was revoked. Nothing may be renewed.
    #[error("re-authentication required")]
    ReauthenticationRequired,

    /// A version-guarded write observed a stale version.
    #[error("version conflict: {0}")]
    VersionConflict(String),

    /// Pseudonym or session absent.
    #[error("not found")]
    NotFound,

    /// Valid, cacheable negative authorization decision.
    #[error("authorization denied")]
    AuthorizationDenied,

    /// Unexpected failure (storage, signing, permission lookup).
    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            AuthError::TokenExpired => Disposition::Recoverable,
            AuthError::VersionConflict(_) => Disposition::Retryable,
            _ => Disposition::Fatal,
        }
    }

    /// Collapse the error into what the outer boundary is allowed to reveal.
    ///
    /// A missing pseudonym or session is indistinguishable from a forged token
    /// to the client; a conflict that survived its retry means the caller must
    /// log in again.
    pub fn at_boundary(self) -> Self {
        match self {
            AuthError::NotFound => AuthError::InvalidToken,
            AuthError::VersionConflict(_) => AuthError::ReauthenticationRequired,
            other => other,
        }
    }

    /// HTTP status for this error once it reaches the boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            AuthError::InvalidToken
            | AuthError::TokenExpired
            | AuthError::ReauthenticationRequired
            | AuthError::VersionConflict(_)
            | AuthError::NotFound => 401,
            AuthError::AuthorizationDenied => 403,
            AuthError::Internal(_) => 500,
        }
    }

    /// Generic public error code. Carries no internal detail.
    pub fn public_code(&self) -> &'static str {
        match self.status_code() {
            401 => "unauthorized",
            403 => "forbidden",
            _ => "internal_error",
        }
    }
}

impl From<DomainError> for AuthError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Conflict(msg) => AuthError::VersionConflict(msg),
            DomainError::NotFound => AuthError::NotFound,
            DomainError::InvalidId(_) => AuthError::InvalidToken,
            DomainError::Validation(msg) => AuthError::Internal(msg),
        }
    }
}

impl From<TokenValidationError> for AuthError {
    fn from(value: TokenValidationError) -> Self {
        match value {
            TokenValidationError::Expired => AuthError::TokenExpired,
            _ => AuthError::InvalidToken,
        }
    }
}
