//! Session records.
//!
//! A session binds one client instance to a subject and to its current
//! access credential. All mutations are version-guarded; see
//! [`keystone_core::ExpectedVersion`].

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use keystone_core::{CredentialId, EmployeeId, SessionId, Version};

/// Client metadata captured at login.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMeta {
    pub user_agent: Option<String>,
    pub ip_address: Option<IpAddr>,
}

/// Row of the `sessions` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub subject_id: EmployeeId,
    /// `jti` of the access credential currently bound to this session.
    pub token_ref: CredentialId,
    pub user_agent: Option<String>,
    pub ip_address: Option<IpAddr>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub version: Version,
}

impl Session {
    pub fn new(
        id: SessionId,
        subject_id: EmployeeId,
        token_ref: CredentialId,
        client: ClientMeta,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            subject_id,
            token_ref,
            user_agent: client.user_agent,
            ip_address: client.ip_address,
            created_at: now,
            expires_at,
            revoked: false,
            version: Version::INITIAL,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Revocation dominates expiry: only an expired session that nobody has
    /// revoked yet may be rotated by a renewal.
    pub fn status(self, now: DateTime<Utc>) -> SessionStatus {
        if self.revoked {
            SessionStatus::Revoked(self)
        } else if self.is_expired(now) {
            SessionStatus::Expired(self)
        } else {
            SessionStatus::Active(self)
        }
    }

    /// The session after `patch` is applied, with its version bumped.
    pub fn patched(&self, patch: &SessionPatch) -> Self {
        Self {
            token_ref: patch.token_ref.unwrap_or(self.token_ref),
            expires_at: patch.expires_at.unwrap_or(self.expires_at),
            revoked: patch.revoked.unwrap_or(self.revoked),
            version: self.version.next(),
            ..self.clone()
        }
    }
}

/// Partial update to a session. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPatch {
    pub token_ref: Option<CredentialId>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked: Option<bool>,
}

impl SessionPatch {
    pub fn revoke() -> Self {
        Self {
            revoked: Some(true),
            ..Self::default()
        }
    }

    pub fn with_token_ref(mut self, token_ref: CredentialId) -> Self {
        self.token_ref = Some(token_ref);
        self
    }

    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.token_ref.is_none() && self.expires_at.is_none() && self.revoked.is_none()
    }
}

/// Result of looking a session up on behalf of the renewal state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Active(Session),
    Expired(Session),
    /// Explicitly revoked (logout, administrative action, rotation).
    Revoked(Session),
    Unknown,
}

impl SessionStatus {
    pub fn session(&self) -> Option<&Session> {
        match self {
            SessionStatus::Active(s) | SessionStatus::Expired(s) | SessionStatus::Revoked(s) => Some(s),
            SessionStatus::Unknown => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session(now: DateTime<Utc>) -> Session {
        Session::new(
            SessionId::new(),
            EmployeeId::new(),
            CredentialId::new(),
            ClientMeta::default(),
            now,
            now + Duration::hours(12),
        )
    }

    #[test]
    fn new_sessions_start_at_version_one() {
        assert_eq!(session(Utc::now()).version, Version::INITIAL);
    }

    #[test]
    fn patch_bumps_version_and_keeps_untouched_fields() {
        let now = Utc::now();
        let s = session(now);
        let new_ref = CredentialId::new();
        let patched = s.patched(&SessionPatch::default().with_token_ref(new_ref));
        assert_eq!(patched.token_ref, new_ref);
        assert_eq!(patched.expires_at, s.expires_at);
        assert_eq!(patched.version, Version::new(2));
    }

    #[test]
    fn revocation_dominates_expiry() {
        let now = Utc::now();
        let mut s = session(now);
        assert!(matches!(s.clone().status(now + Duration::hours(13)), SessionStatus::Expired(_)));
        s.revoked = true;
        assert!(matches!(s.clone().status(now), SessionStatus::Revoked(_)));
        assert!(matches!(s.status(now + Duration::hours(13)), SessionStatus::Revoked(_)));
    }
}
