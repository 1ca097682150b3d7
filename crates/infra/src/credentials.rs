//! Credential issuer: signs access/refresh credentials and manages the
//! persisted refresh records.
//!
//! Access credentials are stateless HS256 JWTs; their validity is signature
//! plus `exp`. Refresh credentials are JWTs too, but additionally persisted
//! as a SHA-256 digest so they can be revoked.

use std::sync::Arc;

use chrono::Duration;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use keystone_auth::{
    AuditRecord, AuditSink, AuthError, AuthResult, CredentialClaims, CredentialKind, CredentialRecord, EntityClass,
    IssuedCredentials, IssuedToken, Subject, TokenValidationError, validate_claims,
};
use keystone_core::{Clock, CredentialId, EmployeeId, SessionId, Version};

use crate::config::AuthConfig;
use crate::pseudonym::PseudonymMapper;
use crate::store::{CredentialStore, StoreError};

/// Hex SHA-256 of a raw token; the only form in which tokens reach storage.
pub fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

struct Keys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl Keys {
    fn from_secret(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IssuerSettings {
    pub issuer: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub retention: Duration,
}

impl From<&AuthConfig> for IssuerSettings {
    fn from(config: &AuthConfig) -> Self {
        Self {
            issuer: config.issuer.clone(),
            access_ttl: config.access_ttl,
            refresh_ttl: config.refresh_ttl,
            retention: config.retention,
        }
    }
}

/// Verified claims of a presented credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectedCredential {
    pub claims: CredentialClaims,
    /// `exp` has passed. The signature is still valid.
    pub expired: bool,
}

/// A freshly minted credential and, for refresh credentials, the record
/// that must be persisted alongside it.
#[derive(Debug, Clone)]
pub struct MintedCredential {
    pub token: IssuedToken,
    pub record: Option<CredentialRecord>,
}

pub struct CredentialIssuer {
    store: Arc<dyn CredentialStore>,
    pseudonyms: Arc<PseudonymMapper>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    settings: IssuerSettings,
    access_keys: Keys,
    refresh_keys: Keys,
}

impl CredentialIssuer {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        pseudonyms: Arc<PseudonymMapper>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
        config: &AuthConfig,
    ) -> Self {
        Self {
            store,
            pseudonyms,
            clock,
            audit,
            settings: IssuerSettings::from(config),
            access_keys: Keys::from_secret(&config.access_secret),
            refresh_keys: Keys::from_secret(&config.refresh_secret),
        }
    }

    pub fn settings(&self) -> &IssuerSettings {
        &self.settings
    }

    fn keys(&self, kind: CredentialKind) -> &Keys {
        match kind {
            CredentialKind::Access => &self.access_keys,
            CredentialKind::Refresh => &self.refresh_keys,
        }
    }

    fn ttl(&self, kind: CredentialKind) -> Duration {
        match kind {
            CredentialKind::Access => self.settings.access_ttl,
            CredentialKind::Refresh => self.settings.refresh_ttl,
        }
    }

    /// Sign a credential without persisting anything.
    ///
    /// Subject and session claims are pseudonyms; creating them on first use
    /// is the only write this performs. `session` is what the credential
    /// will be bound to and is only meaningful for access credentials.
    pub async fn mint(
        &self,
        subject: Subject,
        kind: CredentialKind,
        session: Option<SessionId>,
    ) -> AuthResult<MintedCredential> {
        let now = self.clock.now();
        let sub = self
            .pseudonyms
            .pseudonymize(*subject.employee.as_uuid(), EntityClass::Employee)
            .await?;
        let role = self
            .pseudonyms
            .pseudonymize(*subject.role.as_uuid(), EntityClass::Role)
            .await?;
        let sid = match session {
            Some(id) => Some(
                self.pseudonyms
                    .pseudonymize(*id.as_uuid(), EntityClass::Session)
                    .await?
                    .hashed_id,
            ),
            None => None,
        };

        let id = CredentialId::new();
        let expires_at = now + self.ttl(kind);
        let claims = CredentialClaims {
            sub: sub.hashed_id,
            role: role.hashed_id,
            jti: id,
            sid,
            typ: kind,
            iss: self.settings.issuer.clone(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };

        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.keys(kind).encoding)
            .map_err(|e| AuthError::internal(format!("failed to sign {kind} credential: {e}")))?;

        let record = (kind == CredentialKind::Refresh).then(|| CredentialRecord {
            id,
            subject_id: subject.employee,
            token_hash: token_digest(&token),
            kind,
            created_at: now,
            expires_at: claims.expires_at(),
            revoked: false,
            version: Version::INITIAL,
        });

        Ok(MintedCredential {
            token: IssuedToken {
                kind,
                id,
                token,
                expires_at: claims.expires_at(),
            },
            record,
        })
    }

    /// Mint and, for refresh credentials, persist.
    #[instrument(level = "debug", skip(self, subject), err)]
    pub async fn issue(
        &self,
        subject: Subject,
        kind: CredentialKind,
        session: Option<SessionId>,
    ) -> AuthResult<IssuedToken> {
        let minted = self.mint(subject, kind, session).await?;
        if let Some(record) = minted.record {
            self.store.insert_credential(record.clone()).await?;
            self.audit.record(
                AuditRecord::new(self.clock.now(), "credential_issuer", "tokens", "issue")
                    .subject(subject.employee)
                    .after(&redacted(&record)),
            );
        }
        debug!(credential_id = %minted.token.id, %kind, "credential issued");
        Ok(minted.token)
    }

    /// Access + refresh pair for a fresh login into `session`.
    pub async fn issue_pair(&self, subject: Subject, session: SessionId) -> AuthResult<IssuedCredentials> {
        Ok(IssuedCredentials {
            access: Some(self.issue(subject, CredentialKind::Access, Some(session)).await?),
            refresh: Some(self.issue(subject, CredentialKind::Refresh, None).await?),
        })
    }

    /// Verify signature, issuer and kind. An expired but otherwise valid
    /// credential is returned with `expired = true`.
    pub fn inspect(&self, token: &str, kind: CredentialKind) -> AuthResult<InspectedCredential> {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is judged against the injected clock below, with zero leeway.
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.validate_aud = false;
        validation.set_issuer(&[self.settings.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "sub", "iss"]);

        let claims = jsonwebtoken::decode::<CredentialClaims>(token, &self.keys(kind).decoding, &validation)
            .map_err(|_| AuthError::InvalidToken)?
            .claims;

        match validate_claims(&claims, kind, self.clock.now()) {
            Ok(()) => Ok(InspectedCredential { claims, expired: false }),
            Err(TokenValidationError::Expired) => Ok(InspectedCredential { claims, expired: true }),
            Err(e) => Err(e.into()),
        }
    }

    /// Like [`CredentialIssuer::inspect`], but expiry is an error
    /// (`TokenExpired`).
    pub fn verify(&self, token: &str, kind: CredentialKind) -> AuthResult<CredentialClaims> {
        let inspected = self.inspect(token, kind)?;
        if inspected.expired {
            return Err(AuthError::TokenExpired);
        }
        Ok(inspected.claims)
    }

    /// Look up the persisted record of a raw refresh credential.
    ///
    /// `NotFound` unless the signature verifies, the digest matches, and the
    /// record is neither revoked nor expired.
    #[instrument(level = "debug", skip(self, token), err)]
    pub async fn validate_stored(&self, token: &str) -> AuthResult<CredentialRecord> {
        let claims = self
            .inspect(token, CredentialKind::Refresh)
            .map_err(|_| AuthError::NotFound)?
            .claims;

        let record = self
            .store
            .get_credential(claims.jti)
            .await?
            .ok_or(AuthError::NotFound)?;

        if record.kind != CredentialKind::Refresh
            || record.token_hash != token_digest(token)
            || !record.is_usable(self.clock.now())
        {
            return Err(AuthError::NotFound);
        }
        Ok(record)
    }

    /// Revoke one (`token = Some`) or all live refresh credentials of a
    /// subject. Select-then-conditional-update; a row that changed under us
    /// is re-read and skipped if someone else already revoked it.
    #[instrument(level = "debug", skip(self, subject, token), err)]
    pub async fn revoke(&self, subject: EmployeeId, token: Option<&str>) -> AuthResult<usize> {
        let now = self.clock.now();
        let digest = token.map(token_digest);
        let targets: Vec<CredentialRecord> = self
            .store
            .credentials_for_subject(subject)
            .await?
            .into_iter()
            .filter(|r| !r.revoked)
            .filter(|r| digest.as_ref().is_none_or(|d| &r.token_hash == d))
            .collect();

        let mut revoked = 0;
        for record in targets {
            match self.revoke_record(&record).await {
                Ok(after) => {
                    revoked += 1;
                    self.audit.record(
                        AuditRecord::new(now, "credential_issuer", "tokens", "revoke")
                            .subject(subject)
                            .before(&redacted(&record))
                            .after(&redacted(&after)),
                    );
                }
                Err(AuthError::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        if revoked > 0 {
            info!(revoked, "refresh credentials revoked");
        }
        Ok(revoked)
    }

    async fn revoke_record(&self, record: &CredentialRecord) -> AuthResult<CredentialRecord> {
        match self.store.revoke_credential(record.id, record.version).await {
            Ok(after) => Ok(after),
            Err(StoreError::Conflict(_)) => {
                let current = self.store.get_credential(record.id).await?.ok_or(AuthError::NotFound)?;
                if current.revoked {
                    return Err(AuthError::NotFound);
                }
                warn!(credential_id = %record.id, "refresh record changed during revoke; retrying");
                Ok(self.store.revoke_credential(current.id, current.version).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete refresh records that expired more than the retention window ago.
    pub async fn purge_expired(&self) -> AuthResult<u64> {
        let cutoff = self.clock.now() - self.settings.retention;
        Ok(self.store.purge_credentials(cutoff).await?)
    }
}

/// Audit snapshot of a record without its digest.
fn redacted(record: &CredentialRecord) -> serde_json::Value {
    serde_json::json!({
        "id": record.id,
        "kind": record.kind,
        "created_at": record.created_at,
        "expires_at": record.expires_at,
        "revoked": record.revoked,
        "version": record.version,
    })
}
