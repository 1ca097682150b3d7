//! Persisted refresh-credential records and freshly minted tokens.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use keystone_core::{CredentialId, EmployeeId, Version};

use crate::CredentialKind;

/// Row of the `tokens` table.
///
/// Only refresh credentials are persisted; access credentials are stateless.
/// The raw token never reaches storage, only its digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub id: CredentialId,
    pub subject_id: EmployeeId,
    pub token_hash: String,
    pub kind: CredentialKind,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub version: Version,
}

impl CredentialRecord {
    /// Not revoked and not expired.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && self.expires_at > now
    }

    pub fn revoked(&self) -> Self {
        Self {
            revoked: true,
            version: self.version.next(),
            ..self.clone()
        }
    }
}

/// A freshly signed credential, ready for cookie transport.
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub kind: CredentialKind,
    pub id: CredentialId,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

// Raw token values stay out of logs.
impl core::fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IssuedToken")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Credentials minted while handling one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IssuedCredentials {
    pub access: Option<IssuedToken>,
    pub refresh: Option<IssuedToken>,
}

impl IssuedCredentials {
    pub fn is_empty(&self) -> bool {
        self.access.is_none() && self.refresh.is_none()
    }

    pub fn tokens(&self) -> impl Iterator<Item = &IssuedToken> {
        self.access.iter().chain(self.refresh.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn issued_token_debug_redacts_raw_value() {
        let token = IssuedToken {
            kind: CredentialKind::Access,
            id: CredentialId::new(),
            token: "eyJhbGciOiJIUzI1NiJ9.secret".to_string(),
            expires_at: Utc::now(),
        };
        let rendered = format!("{token:?}");
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn revoked_record_is_unusable_and_bumped() {
        let now = Utc::now();
        let record = CredentialRecord {
            id: CredentialId::new(),
            subject_id: EmployeeId::new(),
            token_hash: "h".to_string(),
            kind: CredentialKind::Refresh,
            created_at: now,
            expires_at: now + Duration::days(7),
            revoked: false,
            version: Version::INITIAL,
        };
        assert!(record.is_usable(now));
        let revoked = record.revoked();
        assert!(!revoked.is_usable(now));
        assert_eq!(revoked.version, Version::new(2));
    }
}
