use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use keystone_core::CredentialId;

use crate::HashedId;

/// Kind of credential a token represents.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    Access,
    Refresh,
}

impl CredentialKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialKind::Access => "access",
            CredentialKind::Refresh => "refresh",
        }
    }
}

impl core::fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signed credential claims (transport-agnostic).
///
/// Subject identifiers are pseudonyms, never internal IDs. Timestamps are
/// seconds since the epoch, as JWT registered claims require.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialClaims {
    /// Employee pseudonym.
    pub sub: HashedId,

    /// Role pseudonym.
    pub role: HashedId,

    /// Credential identifier; sessions reference access credentials by it.
    pub jti: CredentialId,

    /// Session pseudonym. Every access credential carries one; refresh
    /// credentials outlive sessions and carry none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<HashedId>,

    /// Credential kind; a refresh token is never accepted as an access token.
    pub typ: CredentialKind,

    pub iss: String,

    /// Issued-at (seconds).
    pub iat: i64,

    /// Expiration (seconds).
    pub exp: i64,
}

impl CredentialClaims {
    pub fn issued_at(&self) -> DateTime<Utc> {
        seconds_to_datetime(self.iat)
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        seconds_to_datetime(self.exp)
    }
}

fn seconds_to_datetime(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenValidationError {
    #[error("token has expired")]
    Expired,

    #[error("token not yet valid (issued_at is in the future)")]
    NotYetValid,

    #[error("invalid token time window (expires_at <= issued_at)")]
    InvalidTimeWindow,

    #[error("unexpected credential kind '{0}'")]
    WrongKind(CredentialKind),
}

/// Deterministically validate credential claims against the expected kind.
///
/// This validates the *claims* only; signature verification happens in the
/// issuer before claims are ever constructed.
pub fn validate_claims(
    claims: &CredentialClaims,
    expected: CredentialKind,
    now: DateTime<Utc>,
) -> Result<(), TokenValidationError> {
    if claims.typ != expected {
        return Err(TokenValidationError::WrongKind(claims.typ));
    }
    if claims.exp <= claims.iat {
        return Err(TokenValidationError::InvalidTimeWindow);
    }
    if now.timestamp() < claims.iat {
        return Err(TokenValidationError::NotYetValid);
    }
    if now >= claims.expires_at() {
        return Err(TokenValidationError::Expired);
    }
    Ok(())
}
