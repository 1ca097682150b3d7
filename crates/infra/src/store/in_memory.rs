use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use keystone_auth::{CredentialRecord, EntityClass, HashedId, IdentityPseudonym, Session, SessionPatch};
use keystone_core::{CredentialId, EmployeeId, SessionId, Version};

use super::{
    CredentialStore, PseudonymStore, RenewalBatch, RenewalOp, RenewalStore, SessionStore, StoreError, StoreResult,
};

#[derive(Debug, Default, Clone)]
struct Tables {
    pseudonyms: HashMap<(Uuid, EntityClass), IdentityPseudonym>,
    credentials: HashMap<CredentialId, CredentialRecord>,
    sessions: HashMap<SessionId, Session>,
}

/// In-memory implementation of every lifecycle table.
///
/// Intended for tests/dev. One lock guards all tables, so a renewal batch is
/// validated and applied without interleaving.
#[derive(Debug, Default)]
pub struct InMemoryAuthStore {
    tables: RwLock<Tables>,
}

impl InMemoryAuthStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))
    }
}

fn conflict(what: &str, expected: Version, actual: Version) -> StoreError {
    StoreError::Conflict(format!("{what}: expected {expected}, found {actual}"))
}

fn update_session_in(tables: &mut Tables, id: SessionId, expected: Version, patch: &SessionPatch) -> StoreResult<Session> {
    let current = tables
        .sessions
        .get_mut(&id)
        .ok_or_else(|| StoreError::NotFound(format!("session {id}")))?;
    if current.version != expected {
        return Err(conflict("session", expected, current.version));
    }
    *current = current.patched(patch);
    Ok(current.clone())
}

fn revoke_credential_in(tables: &mut Tables, id: CredentialId, expected: Version) -> StoreResult<CredentialRecord> {
    let current = tables
        .credentials
        .get_mut(&id)
        .ok_or_else(|| StoreError::NotFound(format!("credential {id}")))?;
    if current.version != expected {
        return Err(conflict("credential", expected, current.version));
    }
    *current = current.revoked();
    Ok(current.clone())
}

#[async_trait]
impl PseudonymStore for InMemoryAuthStore {
    async fn find_pseudonym(
        &self,
        original_id: Uuid,
        entity_class: EntityClass,
    ) -> StoreResult<Option<IdentityPseudonym>> {
        Ok(self.read()?.pseudonyms.get(&(original_id, entity_class)).cloned())
    }

    async fn find_by_hash(&self, hashed_id: &HashedId) -> StoreResult<Option<IdentityPseudonym>> {
        Ok(self
            .read()?
            .pseudonyms
            .values()
            .find(|m| &m.hashed_id == hashed_id)
            .cloned())
    }

    async fn insert_pseudonym(&self, mapping: IdentityPseudonym) -> StoreResult<()> {
        let mut tables = self.write()?;
        let key = (mapping.original_id, mapping.entity_class);
        if tables.pseudonyms.contains_key(&key) {
            return Err(StoreError::Duplicate(format!(
                "id_hash_map original_id for class {}",
                mapping.entity_class
            )));
        }
        if tables.pseudonyms.values().any(|m| m.hashed_id == mapping.hashed_id) {
            return Err(StoreError::Duplicate("id_hash_map hashed_id".to_string()));
        }
        tables.pseudonyms.insert(key, mapping);
        Ok(())
    }

    async fn expired_pseudonyms(&self, now: DateTime<Utc>) -> StoreResult<Vec<IdentityPseudonym>> {
        Ok(self
            .read()?
            .pseudonyms
            .values()
            .filter(|m| !m.is_live(now))
            .cloned()
            .collect())
    }

    async fn delete_pseudonym(&self, original_id: Uuid, entity_class: EntityClass) -> StoreResult<bool> {
        Ok(self
            .write()?
            .pseudonyms
            .remove(&(original_id, entity_class))
            .is_some())
    }
}

#[async_trait]
impl CredentialStore for InMemoryAuthStore {
    async fn insert_credential(&self, record: CredentialRecord) -> StoreResult<()> {
        let mut tables = self.write()?;
        if tables.credentials.contains_key(&record.id) {
            return Err(StoreError::Duplicate(format!("credential {}", record.id)));
        }
        tables.credentials.insert(record.id, record);
        Ok(())
    }

    async fn get_credential(&self, id: CredentialId) -> StoreResult<Option<CredentialRecord>> {
        Ok(self.read()?.credentials.get(&id).cloned())
    }

    async fn credentials_for_subject(&self, subject_id: EmployeeId) -> StoreResult<Vec<CredentialRecord>> {
        let mut records: Vec<CredentialRecord> = self
            .read()?
            .credentials
            .values()
            .filter(|r| r.subject_id == subject_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn revoke_credential(&self, id: CredentialId, expected: Version) -> StoreResult<CredentialRecord> {
        revoke_credential_in(&mut *self.write()?, id, expected)
    }

    async fn purge_credentials(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut tables = self.write()?;
        let before = tables.credentials.len();
        tables.credentials.retain(|_, r| r.expires_at >= cutoff);
        Ok((before - tables.credentials.len()) as u64)
    }
}

#[async_trait]
impl SessionStore for InMemoryAuthStore {
    async fn insert_session(&self, session: Session) -> StoreResult<()> {
        let mut tables = self.write()?;
        if tables.sessions.contains_key(&session.id) {
            return Err(StoreError::Duplicate(format!("session {}", session.id)));
        }
        tables.sessions.insert(session.id, session);
        Ok(())
    }

    async fn get_session(&self, id: SessionId) -> StoreResult<Option<Session>> {
        Ok(self.read()?.sessions.get(&id).cloned())
    }

    async fn find_session_by_token_ref(&self, token_ref: CredentialId) -> StoreResult<Option<Session>> {
        Ok(self
            .read()?
            .sessions
            .values()
            .find(|s| s.token_ref == token_ref)
            .cloned())
    }

    async fn sessions_for_subject(&self, subject_id: EmployeeId) -> StoreResult<Vec<Session>> {
        let mut sessions: Vec<Session> = self
            .read()?
            .sessions
            .values()
            .filter(|s| s.subject_id == subject_id)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    async fn update_session(&self, id: SessionId, expected: Version, patch: &SessionPatch) -> StoreResult<Session> {
        update_session_in(&mut *self.write()?, id, expected, patch)
    }

    async fn purge_sessions(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut tables = self.write()?;
        let before = tables.sessions.len();
        tables
            .sessions
            .retain(|_, s| !(s.expires_at < cutoff || (s.revoked && s.created_at < cutoff)));
        Ok((before - tables.sessions.len()) as u64)
    }
}

#[async_trait]
impl RenewalStore for InMemoryAuthStore {
    async fn commit(&self, batch: RenewalBatch) -> StoreResult<()> {
        let mut tables = self.write()?;

        // Apply to a scratch copy; publish only if every op succeeded.
        let mut staged = tables.clone();
        for op in batch.into_ops() {
            match op {
                RenewalOp::InsertSession(session) => {
                    if staged.sessions.contains_key(&session.id) {
                        return Err(StoreError::Duplicate(format!("session {}", session.id)));
                    }
                    staged.sessions.insert(session.id, session);
                }
                RenewalOp::PatchSession { id, expected, patch } => {
                    update_session_in(&mut staged, id, expected, &patch)?;
                }
                RenewalOp::InsertCredential(record) => {
                    if staged.credentials.contains_key(&record.id) {
                        return Err(StoreError::Duplicate(format!("credential {}", record.id)));
                    }
                    staged.credentials.insert(record.id, record);
                }
                RenewalOp::RevokeCredential { id, expected } => {
                    revoke_credential_in(&mut staged, id, expected)?;
                }
                RenewalOp::AssertCredential { id, expected } => {
                    let current = staged
                        .credentials
                        .get(&id)
                        .ok_or_else(|| StoreError::NotFound(format!("credential {id}")))?;
                    if current.version != expected {
                        return Err(conflict("credential", expected, current.version));
                    }
                    if current.revoked {
                        return Err(StoreError::Conflict(format!("credential {id} was revoked")));
                    }
                }
            }
        }

        *tables = staged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use keystone_auth::{ClientMeta, CredentialKind};
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
    }

    fn session(now: DateTime<Utc>) -> Session {
        Session::new(
            SessionId::new(),
            EmployeeId::new(),
            CredentialId::new(),
            ClientMeta::default(),
            now,
            now + Duration::hours(1),
        )
    }

    fn refresh_record(subject_id: EmployeeId, now: DateTime<Utc>) -> CredentialRecord {
        CredentialRecord {
            id: CredentialId::new(),
            subject_id,
            token_hash: "00".repeat(32),
            kind: CredentialKind::Refresh,
            created_at: now,
            expires_at: now + Duration::days(1),
            revoked: false,
            version: Version::INITIAL,
        }
    }

    #[tokio::test]
    async fn update_bumps_version_and_rejects_stale_writers() {
        let store = InMemoryAuthStore::new();
        let s = session(t0());
        store.insert_session(s.clone()).await.unwrap();

        let patch = SessionPatch::default().with_expires_at(t0() + Duration::hours(2));
        let updated = store.update_session(s.id, Version::INITIAL, &patch).await.unwrap();
        assert_eq!(updated.version, Version::new(2));

        let err = store
            .update_session(s.id, Version::INITIAL, &SessionPatch::revoke())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert!(!store.get_session(s.id).await.unwrap().unwrap().revoked);
    }

    #[tokio::test]
    async fn failed_batch_leaves_every_table_untouched() {
        let store = InMemoryAuthStore::new();
        let s = session(t0());
        let old = refresh_record(s.subject_id, t0());
        store.insert_session(s.clone()).await.unwrap();
        store.insert_credential(old.clone()).await.unwrap();

        let replacement = refresh_record(s.subject_id, t0());
        let mut batch = RenewalBatch::new();
        batch
            .patch_session(s.id, Version::INITIAL, SessionPatch::default().with_token_ref(CredentialId::new()))
            .revoke_credential(old.id, Version::INITIAL)
            .insert_credential(replacement.clone())
            // Stale guard on the session: aborts everything above.
            .patch_session(s.id, Version::INITIAL, SessionPatch::revoke());

        assert!(matches!(store.commit(batch).await, Err(StoreError::Conflict(_))));
        assert_eq!(store.get_session(s.id).await.unwrap().unwrap(), s);
        assert_eq!(store.get_credential(old.id).await.unwrap().unwrap(), old);
        assert!(store.get_credential(replacement.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn assert_guard_rejects_revoked_credentials() {
        let store = InMemoryAuthStore::new();
        let record = refresh_record(EmployeeId::new(), t0());
        store.insert_credential(record.clone()).await.unwrap();
        let revoked = store.revoke_credential(record.id, Version::INITIAL).await.unwrap();

        let mut batch = RenewalBatch::new();
        batch.assert_credential(record.id, revoked.version);
        assert!(matches!(store.commit(batch).await, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn pseudonym_uniqueness_is_enforced_both_ways() {
        let store = InMemoryAuthStore::new();
        let mapping = IdentityPseudonym {
            original_id: Uuid::now_v7(),
            hashed_id: HashedId::new("abc"),
            entity_class: EntityClass::Employee,
            salt: "00".to_string(),
            created_at: t0(),
            expires_at: None,
        };
        store.insert_pseudonym(mapping.clone()).await.unwrap();

        let same_key = IdentityPseudonym {
            hashed_id: HashedId::new("def"),
            ..mapping.clone()
        };
        assert!(matches!(store.insert_pseudonym(same_key).await, Err(StoreError::Duplicate(_))));

        let same_hash = IdentityPseudonym {
            original_id: Uuid::now_v7(),
            ..mapping
        };
        assert!(matches!(store.insert_pseudonym(same_hash).await, Err(StoreError::Duplicate(_))));
    }

    proptest! {
        #[test]
        fn stale_versions_never_apply(bumps in 1u64..6, stale in 0u64..5) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let store = InMemoryAuthStore::new();
                let s = session(t0());
                store.insert_session(s.clone()).await.unwrap();
                let mut current = s.clone();
                for _ in 0..bumps {
                    let patch = SessionPatch::default().with_token_ref(CredentialId::new());
                    current = store.update_session(s.id, current.version, &patch).await.unwrap();
                }

                let stale_version = Version::new(1 + stale % bumps);
                let result = store.update_session(s.id, stale_version, &SessionPatch::revoke()).await;
                prop_assert!(matches!(result, Err(StoreError::Conflict(_))));
                prop_assert_eq!(store.get_session(s.id).await.unwrap().unwrap(), current);
                Ok(())
            })?;
        }
    }
}
