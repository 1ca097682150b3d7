//! Per-request authentication pipeline.
//!
//! ```text
//! validate_credential -> resolve_identity -> classify_renewal_state -> apply_renewal -> authorize
//! ```
//!
//! Each stage returns a `Result`; nothing is passed by mutating shared
//! request state. The outcome is an immutable [`RequestAuthContext`].

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, instrument};

use keystone_auth::{
    AuthError, AuthResult, CredentialClaims, CredentialKind, Disposition, EntityClass, IssuedCredentials, PermissionSet,
    RequestAuthContext, RequestCredentials, SessionStatus, Subject,
};
use keystone_core::{EmployeeId, RoleId, SessionId};

use crate::authz_cache::AuthorizationCache;
use crate::credentials::CredentialIssuer;
use crate::pseudonym::PseudonymMapper;
use crate::refresh::{PresentedRefresh, RefreshOrchestrator, RenewalOutcome, RenewalPlan, RenewalRequest};
use crate::sessions::SessionLedger;

/// Output of [`AuthPipeline::validate_credential`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedCredentials {
    /// Verified access claims; may be past `exp`.
    pub access: CredentialClaims,
    pub refresh: Option<PresentedRefresh>,
}

/// Output of [`AuthPipeline::resolve_identity`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub subject: Subject,
    pub session: SessionStatus,
}

/// A rejected request.
///
/// Renewal runs before authorization, so a request can be denied after new
/// credentials were already committed; they are carried here so the
/// transport can still deliver them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{error}")]
pub struct PipelineError {
    pub error: AuthError,
    pub issued: IssuedCredentials,
}

impl From<AuthError> for PipelineError {
    fn from(error: AuthError) -> Self {
        Self {
            error: error.at_boundary(),
            issued: IssuedCredentials::default(),
        }
    }
}

#[derive(Clone)]
pub struct AuthPipeline {
    issuer: Arc<CredentialIssuer>,
    pseudonyms: Arc<PseudonymMapper>,
    ledger: Arc<SessionLedger>,
    orchestrator: Arc<RefreshOrchestrator>,
    authz: AuthorizationCache,
}

impl AuthPipeline {
    pub fn new(
        issuer: Arc<CredentialIssuer>,
        pseudonyms: Arc<PseudonymMapper>,
        ledger: Arc<SessionLedger>,
        orchestrator: Arc<RefreshOrchestrator>,
        authz: AuthorizationCache,
    ) -> Self {
        Self {
            issuer,
            pseudonyms,
            ledger,
            orchestrator,
            authz,
        }
    }

    /// Run every stage for one request.
    ///
    /// Errors are collapsed to what the boundary may reveal
    /// ([`AuthError::at_boundary`]).
    #[instrument(level = "debug", skip_all, fields(path = %route_path), err)]
    pub async fn authenticate(
        &self,
        credentials: &RequestCredentials,
        route_path: &str,
        required: &PermissionSet,
    ) -> Result<RequestAuthContext, PipelineError> {
        let validated = self.validate_credential(credentials)?;
        let identity = self.resolve_identity(&validated).await?;
        let subject = identity.subject;
        let plan = self.classify_renewal_state(&validated, identity)?;
        let outcome = self.apply_renewal(plan).await?;

        if let Err(error) = self.authorize(subject.employee, route_path, required).await {
            return Err(PipelineError {
                error,
                issued: outcome.issued,
            });
        }

        let RenewalOutcome { state, session, issued } = outcome;
        Ok(RequestAuthContext::new(
            subject,
            validated.access.sub,
            session.id,
            required.clone(),
            state,
            issued,
        ))
    }

    /// Verify the access credential and, if presented, the refresh
    /// credential.
    ///
    /// An access credential past `exp` is not an error here: it is
    /// recoverable, and the orchestrator must renew it. A presented refresh
    /// credential that is expired or forged fails closed.
    pub fn validate_credential(&self, credentials: &RequestCredentials) -> AuthResult<ValidatedCredentials> {
        let token = credentials.access.as_deref().ok_or(AuthError::InvalidToken)?;
        let access = match self.issuer.verify(token, CredentialKind::Access) {
            Ok(claims) => claims,
            Err(e) if e.disposition() == Disposition::Recoverable => {
                self.issuer.inspect(token, CredentialKind::Access)?.claims
            }
            Err(e) => return Err(e),
        };
        if access.sid.is_none() {
            return Err(AuthError::InvalidToken);
        }

        let refresh = match credentials.refresh.as_deref() {
            None => None,
            Some(raw) => match self.issuer.verify(raw, CredentialKind::Refresh) {
                Ok(claims) => Some(PresentedRefresh {
                    token: raw.to_string(),
                    claims,
                }),
                Err(_) => return Err(AuthError::ReauthenticationRequired),
            },
        };

        Ok(ValidatedCredentials { access, refresh })
    }

    /// Map the credential's pseudonyms back to internal ids and load the
    /// session it names.
    ///
    /// The session is found by id, not by `jti`, so a credential superseded
    /// by a concurrent renewal still reaches its session.
    pub async fn resolve_identity(&self, validated: &ValidatedCredentials) -> AuthResult<ResolvedIdentity> {
        let access = &validated.access;
        let sid = access.sid.as_ref().ok_or(AuthError::InvalidToken)?;
        let employee = self.pseudonyms.resolve(&access.sub, EntityClass::Employee).await?;
        let role = self.pseudonyms.resolve(&access.role, EntityClass::Role).await?;
        let session_id = self.pseudonyms.resolve(sid, EntityClass::Session).await?;
        let session = self.ledger.status_of(SessionId::from_uuid(session_id)).await?;
        Ok(ResolvedIdentity {
            subject: Subject::new(EmployeeId::from_uuid(employee), RoleId::from_uuid(role)),
            session,
        })
    }

    pub fn classify_renewal_state(
        &self,
        validated: &ValidatedCredentials,
        identity: ResolvedIdentity,
    ) -> AuthResult<RenewalPlan> {
        let plan = self.orchestrator.classify(
            RenewalRequest {
                subject: identity.subject,
                access: validated.access.clone(),
                refresh: validated.refresh.clone(),
            },
            identity.session,
        )?;
        debug!(state = %plan.state(), "request classified");
        Ok(plan)
    }

    pub async fn apply_renewal(&self, plan: RenewalPlan) -> AuthResult<RenewalOutcome> {
        self.orchestrator.execute(plan).await
    }

    pub async fn authorize(&self, subject: EmployeeId, route_path: &str, required: &PermissionSet) -> AuthResult<()> {
        if self.authz.check(subject, route_path, required).await {
            Ok(())
        } else {
            Err(AuthError::AuthorizationDenied)
        }
    }
}
