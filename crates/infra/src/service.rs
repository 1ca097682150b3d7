//! Login and logout.

use std::sync::Arc;

use tracing::{info, instrument};

use keystone_auth::{
    AuditRecord, AuditSink, AuthResult, ClientMeta, CredentialKind, EntityClass, HashedId,
    IssuedCredentials, RequestAuthContext, Session, Subject,
};
use keystone_core::{Clock, EmployeeId, SessionId};

use crate::authz_cache::AuthorizationCache;
use crate::credentials::CredentialIssuer;
use crate::pseudonym::PseudonymMapper;
use crate::sessions::SessionLedger;
use crate::store::{RenewalBatch, RenewalStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginOutcome {
    pub subject_pseudonym: HashedId,
    pub session: Session,
    pub issued: IssuedCredentials,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogoutOutcome {
    pub sessions_revoked: usize,
    pub credentials_revoked: usize,
}

pub struct AuthService {
    store: Arc<dyn RenewalStore>,
    issuer: Arc<CredentialIssuer>,
    pseudonyms: Arc<PseudonymMapper>,
    ledger: Arc<SessionLedger>,
    authz: AuthorizationCache,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
}

impl AuthService {
    pub fn new(
        store: Arc<dyn RenewalStore>,
        issuer: Arc<CredentialIssuer>,
        pseudonyms: Arc<PseudonymMapper>,
        ledger: Arc<SessionLedger>,
        authz: AuthorizationCache,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            store,
            issuer,
            pseudonyms,
            ledger,
            authz,
            clock,
            audit,
        }
    }

    /// Start a session for an already authenticated subject.
    ///
    /// The refresh record and the session land in one batch.
    #[instrument(level = "debug", skip(self, subject, client), err)]
    pub async fn login(&self, subject: Subject, client: ClientMeta) -> AuthResult<LoginOutcome> {
        let pseudonym = self
            .pseudonyms
            .pseudonymize(*subject.employee.as_uuid(), EntityClass::Employee)
            .await?;
        let session_id = SessionId::new();
        let access = self
            .issuer
            .mint(subject, CredentialKind::Access, Some(session_id))
            .await?;
        let refresh = self.issuer.mint(subject, CredentialKind::Refresh, None).await?;
        let session = self.ledger.open(session_id, subject.employee, access.token.id, client);

        let mut batch = RenewalBatch::new();
        batch.insert_session(session.clone());
        if let Some(record) = refresh.record {
            batch.insert_credential(record);
        }
        self.store.commit(batch).await?;

        self.audit.record(
            AuditRecord::new(self.clock.now(), "auth_service", "session", "login")
                .subject(subject.employee)
                .after(&session),
        );
        info!(subject = %pseudonym.hashed_id, session_id = %session.id, "login");

        Ok(LoginOutcome {
            subject_pseudonym: pseudonym.hashed_id,
            session,
            issued: IssuedCredentials {
                access: Some(access.token),
                refresh: Some(refresh.token),
            },
        })
    }

    /// End the request's session and revoke the presented refresh
    /// credential.
    #[instrument(level = "debug", skip_all, fields(session_id = %ctx.session_id()), err)]
    pub async fn logout(&self, ctx: &RequestAuthContext, refresh_token: Option<&str>) -> AuthResult<LogoutOutcome> {
        let employee = ctx.subject().employee;
        let sessions_revoked = self.ledger.revoke(employee, Some(ctx.session_id())).await?;
        let credentials_revoked = match refresh_token {
            Some(token) => self.issuer.revoke(employee, Some(token)).await?,
            None => 0,
        };
        info!(subject = %ctx.subject_pseudonym(), sessions_revoked, credentials_revoked, "logout");
        Ok(LogoutOutcome {
            sessions_revoked,
            credentials_revoked,
        })
    }

    /// Revoke every session and refresh credential of `subject` and drop its
    /// cached authorization decisions.
    #[instrument(level = "debug", skip(self, subject), err)]
    pub async fn revoke_all(&self, subject: EmployeeId) -> AuthResult<LogoutOutcome> {
        let sessions_revoked = self.ledger.revoke(subject, None).await?;
        let credentials_revoked = self.issuer.revoke(subject, None).await?;
        self.authz.invalidate_subject(subject);
        Ok(LogoutOutcome {
            sessions_revoked,
            credentials_revoked,
        })
    }
}
