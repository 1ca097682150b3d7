//! Refresh orchestrator: executes the renewal state machine.
//!
//! Classification is pure (see [`keystone_auth::classify`]); this module
//! turns a classification into one [`RenewalBatch`] and commits it
//! atomically. A batch that loses a version race is re-planned against the
//! current session and retried once.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use keystone_auth::{
    AuditRecord, AuditSink, AuthError, AuthResult, Classification, ClientMeta, CredentialClaims, CredentialKind,
    IssuedCredentials, Phase, RefreshPhase, RenewalState, RenewalThresholds, Session, SessionPatch, SessionStatus,
    Subject, classify, phase_of,
};
use keystone_core::{Clock, SessionId};

use crate::credentials::CredentialIssuer;
use crate::sessions::SessionLedger;
use crate::store::{RenewalBatch, RenewalStore};

/// A refresh credential whose signature has been verified and which has not
/// yet expired.
#[derive(Clone, PartialEq, Eq)]
pub struct PresentedRefresh {
    pub token: String,
    pub claims: CredentialClaims,
}

impl core::fmt::Debug for PresentedRefresh {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PresentedRefresh")
            .field("token", &"<redacted>")
            .field("jti", &self.claims.jti)
            .finish()
    }
}

/// Everything the orchestrator knows about the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalRequest {
    pub subject: Subject,
    /// Verified access claims; may be past `exp`.
    pub access: CredentialClaims,
    pub refresh: Option<PresentedRefresh>,
}

/// A classified request, bound to the session snapshot it was classified
/// against. Applying it is version-guarded by that snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalPlan {
    request: RenewalRequest,
    session: Session,
    classification: Classification,
}

impl RenewalPlan {
    pub fn state(&self) -> RenewalState {
        self.classification.state
    }

    pub fn classification(&self) -> Classification {
        self.classification
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalOutcome {
    pub state: RenewalState,
    /// The session the request is now bound to.
    pub session: Session,
    pub issued: IssuedCredentials,
}

pub struct RefreshOrchestrator {
    store: Arc<dyn RenewalStore>,
    issuer: Arc<CredentialIssuer>,
    ledger: Arc<SessionLedger>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    thresholds: RenewalThresholds,
}

impl RefreshOrchestrator {
    pub fn new(
        store: Arc<dyn RenewalStore>,
        issuer: Arc<CredentialIssuer>,
        ledger: Arc<SessionLedger>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
        thresholds: RenewalThresholds,
    ) -> Self {
        Self {
            store,
            issuer,
            ledger,
            clock,
            audit,
            thresholds,
        }
    }

    pub fn thresholds(&self) -> RenewalThresholds {
        self.thresholds
    }

    /// Decide what `request` needs, given the state of its session.
    ///
    /// Fails closed: a revoked or unknown session, a refresh credential for
    /// another subject, or an unusable refresh credential all require
    /// re-authentication.
    ///
    /// An access credential the session no longer references was superseded
    /// by a concurrent renewal. Until its own `exp` it is accepted as is and
    /// nothing is renewed again; once expired it renews like any other.
    pub fn classify(&self, request: RenewalRequest, status: SessionStatus) -> AuthResult<RenewalPlan> {
        let now = self.clock.now();

        let (session, session_phase) = match status {
            SessionStatus::Active(session) => {
                let phase = phase_of(session.expires_at, self.thresholds.session, now);
                (session, phase)
            }
            SessionStatus::Expired(session) => (session, Phase::Expired),
            SessionStatus::Revoked(_) | SessionStatus::Unknown => {
                return Err(AuthError::ReauthenticationRequired);
            }
        };
        if session.subject_id != request.subject.employee {
            return Err(AuthError::ReauthenticationRequired);
        }

        let refresh_phase = match &request.refresh {
            None => RefreshPhase::Absent,
            Some(presented) if presented.claims.sub != request.access.sub => RefreshPhase::Unusable,
            Some(presented) => {
                RefreshPhase::from_phase(phase_of(presented.claims.expires_at(), self.thresholds.refresh, now))
            }
        };
        if refresh_phase == RefreshPhase::Unusable {
            return Err(AuthError::ReauthenticationRequired);
        }
        let access_phase = phase_of(request.access.expires_at(), self.thresholds.access, now);

        let superseded = session.token_ref != request.access.jti;
        if superseded && access_phase != Phase::Expired && session_phase != Phase::Expired {
            debug!(session_id = %session.id, "access credential already superseded");
            return Ok(RenewalPlan {
                request,
                session,
                classification: Classification::valid(),
            });
        }

        let classification = classify(access_phase, session_phase, refresh_phase)?;
        Ok(RenewalPlan {
            request,
            session,
            classification,
        })
    }

    /// Execute `plan` as one atomic batch. No retry.
    #[instrument(level = "debug", skip(self, plan), fields(state = %plan.state(), session_id = %plan.session.id), err)]
    pub async fn apply(&self, plan: &RenewalPlan) -> AuthResult<RenewalOutcome> {
        let actions = plan.classification.actions;
        let session = &plan.session;
        if !actions.any() {
            return Ok(RenewalOutcome {
                state: plan.classification.state,
                session: session.clone(),
                issued: IssuedCredentials::default(),
            });
        }

        let subject = plan.request.subject;
        let presented = plan
            .request
            .refresh
            .as_ref()
            .ok_or(AuthError::ReauthenticationRequired)?;
        let record = match self.issuer.validate_stored(&presented.token).await {
            Ok(record) => record,
            Err(AuthError::NotFound) => return Err(AuthError::ReauthenticationRequired),
            Err(e) => return Err(e),
        };
        if record.subject_id != subject.employee {
            return Err(AuthError::ReauthenticationRequired);
        }

        let now = self.clock.now();
        let mut batch = RenewalBatch::new();
        let mut issued = IssuedCredentials::default();

        let after = if actions.rotate_session {
            let replacement_id = SessionId::new();
            let access = self
                .issuer
                .mint(subject, CredentialKind::Access, Some(replacement_id))
                .await?;
            batch.patch_session(session.id, session.version, SessionPatch::revoke());
            let client = ClientMeta {
                user_agent: session.user_agent.clone(),
                ip_address: session.ip_address,
            };
            let replacement = self
                .ledger
                .open(replacement_id, subject.employee, access.token.id, client);
            batch.insert_session(replacement.clone());
            issued.access = Some(access.token);
            replacement
        } else {
            let mut patch = SessionPatch::default();
            if actions.renew_access {
                let access = self
                    .issuer
                    .mint(subject, CredentialKind::Access, Some(session.id))
                    .await?;
                patch = patch.with_token_ref(access.token.id);
                issued.access = Some(access.token);
            }
            if actions.extend_session {
                patch = patch.with_expires_at(now + self.ledger.ttl());
            }
            if patch.is_empty() {
                session.clone()
            } else {
                batch.patch_session(session.id, session.version, patch.clone());
                session.patched(&patch)
            }
        };

        if actions.rotate_refresh {
            let refresh = self.issuer.mint(subject, CredentialKind::Refresh, None).await?;
            batch.revoke_credential(record.id, record.version);
            if let Some(new_record) = refresh.record {
                batch.insert_credential(new_record);
            }
            issued.refresh = Some(refresh.token);
        } else {
            // The refresh credential must still be live when the batch lands.
            batch.assert_credential(record.id, record.version);
        }

        self.store.commit(batch).await?;

        let state = plan.classification.state;
        self.audit.record(
            AuditRecord::new(now, "refresh_orchestrator", "session", state.as_str())
                .subject(subject.employee)
                .before(session)
                .after(&after),
        );
        info!(
            %state,
            session_id = %after.id,
            rotated_session = actions.rotate_session,
            rotated_refresh = actions.rotate_refresh,
            "renewal applied"
        );

        Ok(RenewalOutcome {
            state,
            session: after,
            issued,
        })
    }

    /// Classify and execute.
    pub async fn renew(&self, request: RenewalRequest, status: SessionStatus) -> AuthResult<RenewalOutcome> {
        let plan = self.classify(request, status)?;
        self.execute(plan).await
    }

    /// Apply `plan`. A version conflict is re-planned against the session's
    /// current state and retried once; if someone else already renewed what
    /// this plan wanted, the retry is a no-op. A second conflict requires
    /// re-authentication.
    #[instrument(level = "debug", skip(self, plan), fields(session_id = %plan.session.id), err)]
    pub async fn execute(&self, plan: RenewalPlan) -> AuthResult<RenewalOutcome> {
        let session_id = plan.session.id;
        let first = self.apply(&plan).await;
        match first {
            Err(AuthError::VersionConflict(reason)) => {
                warn!(%session_id, %reason, "renewal lost a version race; re-reading");
                let current = self
                    .ledger
                    .get(session_id)
                    .await?
                    .ok_or(AuthError::ReauthenticationRequired)?;
                let status = current.status(self.clock.now());
                let retry = self.classify(plan.request, status)?;
                if !retry.classification.actions.any() {
                    debug!(%session_id, "state already renewed concurrently");
                }
                match self.apply(&retry).await {
                    Err(AuthError::VersionConflict(_)) => Err(AuthError::ReauthenticationRequired),
                    other => other,
                }
            }
            other => other,
        }
    }
}
