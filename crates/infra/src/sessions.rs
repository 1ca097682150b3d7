//! Session ledger: durable, versioned client sessions.

use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, info, instrument};

use keystone_auth::{AuditRecord, AuditSink, AuthError, AuthResult, ClientMeta, Session, SessionPatch, SessionStatus};
use keystone_core::{Clock, CredentialId, EmployeeId, SessionId, Version};

use crate::store::{SessionStore, StoreError};

pub struct SessionLedger {
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    ttl: Duration,
    retention: Duration,
}

impl SessionLedger {
    pub fn new(
        store: Arc<dyn SessionStore>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
        ttl: Duration,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            audit,
            ttl,
            retention,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// A new, not yet persisted session bound to `access_ref`.
    ///
    /// The id is allocated by the caller so the access credential can name
    /// its session before the row exists.
    pub fn open(&self, id: SessionId, subject: EmployeeId, access_ref: CredentialId, client: ClientMeta) -> Session {
        let now = self.clock.now();
        Session::new(id, subject, access_ref, client, now, now + self.ttl)
    }

    /// Create and persist a session at version 1.
    #[instrument(level = "debug", skip(self, subject, client), err)]
    pub async fn create(&self, subject: EmployeeId, access_ref: CredentialId, client: ClientMeta) -> AuthResult<Session> {
        let session = self.open(SessionId::new(), subject, access_ref, client);
        self.store.insert_session(session.clone()).await?;
        self.audit.record(
            AuditRecord::new(session.created_at, "session_ledger", "session", "create")
                .subject(subject)
                .after(&session),
        );
        info!(session_id = %session.id, "session created");
        Ok(session)
    }

    /// The active session bound to `access_ref`.
    ///
    /// An expired session is absent even if the row is not yet revoked; it
    /// is revoked lazily here. Revoked sessions are absent too.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn lookup(&self, access_ref: CredentialId) -> AuthResult<Option<Session>> {
        match self.inspect(access_ref).await? {
            SessionStatus::Active(session) => Ok(Some(session)),
            SessionStatus::Expired(session) => {
                self.revoke_lazily(&session).await?;
                Ok(None)
            }
            SessionStatus::Revoked(_) | SessionStatus::Unknown => Ok(None),
        }
    }

    /// Classify the session bound to `access_ref` for the renewal state
    /// machine. Read-only.
    pub async fn inspect(&self, access_ref: CredentialId) -> AuthResult<SessionStatus> {
        Ok(match self.store.find_session_by_token_ref(access_ref).await? {
            Some(session) => session.status(self.clock.now()),
            None => SessionStatus::Unknown,
        })
    }

    /// Classify session `id` for the renewal state machine. Read-only.
    pub async fn status_of(&self, id: SessionId) -> AuthResult<SessionStatus> {
        Ok(match self.store.get_session(id).await? {
            Some(session) => session.status(self.clock.now()),
            None => SessionStatus::Unknown,
        })
    }

    async fn revoke_lazily(&self, session: &Session) -> AuthResult<()> {
        match self
            .store
            .update_session(session.id, session.version, &SessionPatch::revoke())
            .await
        {
            Ok(after) => {
                debug!(session_id = %session.id, "expired session revoked");
                self.audit.record(
                    AuditRecord::new(self.clock.now(), "session_ledger", "session", "expire")
                        .subject(session.subject_id)
                        .before(session)
                        .after(&after),
                );
                Ok(())
            }
            // Another task already moved this row on.
            Err(StoreError::Conflict(_)) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, id: SessionId) -> AuthResult<Option<Session>> {
        Ok(self.store.get_session(id).await?)
    }

    /// Version-guarded patch. A stale `expected` fails with `VersionConflict`
    /// and leaves the row untouched.
    #[instrument(level = "debug", skip(self, patch), err)]
    pub async fn mutate(&self, id: SessionId, expected: Version, patch: SessionPatch) -> AuthResult<Session> {
        let after = self.store.update_session(id, expected, &patch).await?;
        self.audit.record(
            AuditRecord::new(self.clock.now(), "session_ledger", "session", "update")
                .subject(after.subject_id)
                .after(&after),
        );
        Ok(after)
    }

    /// Revoke one session of `subject`, or all of them. Returns how many rows
    /// this call revoked; rows revoked concurrently by someone else are
    /// skipped.
    #[instrument(level = "debug", skip(self, subject), err)]
    pub async fn revoke(&self, subject: EmployeeId, session_id: Option<SessionId>) -> AuthResult<usize> {
        let targets: Vec<Session> = match session_id {
            Some(id) => self
                .store
                .get_session(id)
                .await?
                .filter(|s| s.subject_id == subject)
                .into_iter()
                .collect(),
            None => self.store.sessions_for_subject(subject).await?,
        };

        let mut revoked = 0;
        for session in targets.into_iter().filter(|s| !s.revoked) {
            if let Some(after) = self.revoke_one(&session).await? {
                revoked += 1;
                self.audit.record(
                    AuditRecord::new(self.clock.now(), "session_ledger", "session", "revoke")
                        .subject(subject)
                        .before(&session)
                        .after(&after),
                );
                info!(session_id = %after.id, "session revoked");
            }
        }
        Ok(revoked)
    }

    async fn revoke_one(&self, session: &Session) -> AuthResult<Option<Session>> {
        match self
            .store
            .update_session(session.id, session.version, &SessionPatch::revoke())
            .await
        {
            Ok(after) => Ok(Some(after)),
            Err(StoreError::Conflict(_)) => {
                // Re-read once; somebody else may have revoked it already.
                let Some(current) = self.store.get_session(session.id).await? else {
                    return Ok(None);
                };
                if current.revoked {
                    return Ok(None);
                }
                match self
                    .store
                    .update_session(current.id, current.version, &SessionPatch::revoke())
                    .await
                {
                    Ok(after) => Ok(Some(after)),
                    Err(StoreError::Conflict(msg)) => Err(AuthError::VersionConflict(msg)),
                    Err(e) => Err(e.into()),
                }
            }
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete sessions past the retention window.
    pub async fn purge(&self) -> AuthResult<u64> {
        let cutoff = self.clock.now() - self.retention;
        Ok(self.store.purge_sessions(cutoff).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditSink;
    use crate::store::InMemoryAuthStore;
    use chrono::{TimeZone, Utc};
    use keystone_core::ManualClock;

    fn ledger() -> (SessionLedger, Arc<ManualClock>, Arc<InMemoryAuditSink>) {
        let store = Arc::new(InMemoryAuthStore::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap()));
        let audit = Arc::new(InMemoryAuditSink::new());
        let ledger = SessionLedger::new(store, clock.clone(), audit.clone(), Duration::hours(12), Duration::days(30));
        (ledger, clock, audit)
    }

    #[tokio::test]
    async fn create_then_lookup_by_access_ref() {
        let (ledger, _, audit) = ledger();
        let access = CredentialId::new();
        let session = ledger.create(EmployeeId::new(), access, ClientMeta::default()).await.unwrap();

        assert_eq!(session.version, Version::INITIAL);
        assert_eq!(ledger.lookup(access).await.unwrap(), Some(session));
        assert_eq!(ledger.lookup(CredentialId::new()).await.unwrap(), None);
        assert_eq!(audit.matching("session", "create").len(), 1);
    }

    #[tokio::test]
    async fn status_by_id_survives_rebinding() {
        let (ledger, _, _) = ledger();
        let old_ref = CredentialId::new();
        let session = ledger.create(EmployeeId::new(), old_ref, ClientMeta::default()).await.unwrap();

        let new_ref = CredentialId::new();
        ledger
            .mutate(session.id, session.version, SessionPatch::default().with_token_ref(new_ref))
            .await
            .unwrap();

        assert!(matches!(ledger.inspect(old_ref).await.unwrap(), SessionStatus::Unknown));
        match ledger.status_of(session.id).await.unwrap() {
            SessionStatus::Active(current) => assert_eq!(current.token_ref, new_ref),
            other => panic!("expected an active session, got {other:?}"),
        }
        assert!(matches!(ledger.status_of(SessionId::new()).await.unwrap(), SessionStatus::Unknown));
    }

    #[tokio::test]
    async fn stale_mutation_conflicts_and_does_not_apply() {
        let (ledger, clock, _) = ledger();
        let session = ledger.create(EmployeeId::new(), CredentialId::new(), ClientMeta::default()).await.unwrap();

        let extended = clock.now() + Duration::hours(24);
        let v2 = ledger
            .mutate(session.id, session.version, SessionPatch::default().with_expires_at(extended))
            .await
            .unwrap();
        assert_eq!(v2.version, Version::new(2));

        let err = ledger
            .mutate(session.id, session.version, SessionPatch::revoke())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::VersionConflict(_)));
        assert_eq!(ledger.get(session.id).await.unwrap(), Some(v2));
    }

    #[tokio::test]
    async fn expired_sessions_are_absent_and_lazily_revoked() {
        let (ledger, clock, audit) = ledger();
        let access = CredentialId::new();
        let session = ledger.create(EmployeeId::new(), access, ClientMeta::default()).await.unwrap();

        clock.advance(Duration::hours(13));
        assert!(matches!(ledger.inspect(access).await.unwrap(), SessionStatus::Expired(_)));
        assert_eq!(ledger.lookup(access).await.unwrap(), None);

        let stored = ledger.get(session.id).await.unwrap().unwrap();
        assert!(stored.revoked);
        assert_eq!(stored.version, Version::new(2));
        assert!(matches!(ledger.inspect(access).await.unwrap(), SessionStatus::Revoked(_)));
        assert_eq!(audit.matching("session", "expire").len(), 1);
    }

    #[tokio::test]
    async fn revoke_one_or_all_sessions_of_a_subject() {
        let (ledger, _, _) = ledger();
        let subject = EmployeeId::new();
        let first = ledger.create(subject, CredentialId::new(), ClientMeta::default()).await.unwrap();
        ledger.create(subject, CredentialId::new(), ClientMeta::default()).await.unwrap();
        ledger.create(subject, CredentialId::new(), ClientMeta::default()).await.unwrap();

        assert_eq!(ledger.revoke(subject, Some(first.id)).await.unwrap(), 1);
        assert!(matches!(ledger.inspect(first.token_ref).await.unwrap(), SessionStatus::Revoked(_)));
        assert_eq!(ledger.revoke(subject, None).await.unwrap(), 2);
        assert_eq!(ledger.revoke(subject, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn revoke_ignores_other_subjects_sessions() {
        let (ledger, _, _) = ledger();
        let owner = ledger.create(EmployeeId::new(), CredentialId::new(), ClientMeta::default()).await.unwrap();
        assert_eq!(ledger.revoke(EmployeeId::new(), Some(owner.id)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn purge_removes_sessions_past_retention() {
        let (ledger, clock, _) = ledger();
        ledger.create(EmployeeId::new(), CredentialId::new(), ClientMeta::default()).await.unwrap();
        clock.advance(Duration::days(1));
        assert_eq!(ledger.purge().await.unwrap(), 0);
        clock.advance(Duration::days(31));
        assert_eq!(ledger.purge().await.unwrap(), 1);
    }
}
