//! Pseudonym mapper: internal identifiers to salted hashes and back.

use std::sync::Arc;

use chrono::Duration;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use keystone_auth::{AuditRecord, AuditSink, AuthError, AuthResult, EntityClass, HashedId, IdentityPseudonym, Pseudonym};
use keystone_core::Clock;

use crate::store::{PseudonymStore, StoreError};

const SEPARATOR: u8 = 0x1f;

/// Deterministic digest of one mapping: `hex(sha256(salt ‖ 0x1f ‖ class ‖ 0x1f ‖ id))`.
pub fn digest(salt: &str, entity_class: EntityClass, original_id: Uuid) -> HashedId {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update([SEPARATOR]);
    hasher.update(entity_class.as_str().as_bytes());
    hasher.update([SEPARATOR]);
    hasher.update(original_id.as_bytes());
    HashedId::new(hex::encode(hasher.finalize()))
}

pub struct PseudonymMapper {
    store: Arc<dyn PseudonymStore>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    salt_len: usize,
    ttl: Option<Duration>,
}

impl PseudonymMapper {
    pub fn new(
        store: Arc<dyn PseudonymStore>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
        salt_len: usize,
        ttl: Option<Duration>,
    ) -> Self {
        Self {
            store,
            clock,
            audit,
            salt_len,
            ttl,
        }
    }

    fn fresh_salt(&self) -> String {
        let mut bytes = vec![0u8; self.salt_len];
        OsRng.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Return the live pseudonym for `(original_id, entity_class)`, creating
    /// it on first use.
    ///
    /// Idempotent while the mapping is live: the salt belongs to the mapping,
    /// so repeated calls never fork an identity. When two callers race to
    /// create the same mapping, the first insert wins and the loser returns
    /// the winner's row.
    #[instrument(level = "debug", skip(self, original_id), fields(entity_class = %entity_class), err)]
    pub async fn pseudonymize(&self, original_id: Uuid, entity_class: EntityClass) -> AuthResult<Pseudonym> {
        let now = self.clock.now();

        if let Some(existing) = self.store.find_pseudonym(original_id, entity_class).await? {
            if existing.is_live(now) {
                return Ok(existing.pseudonym());
            }
            // Expired but not yet swept: retire it before minting a new one.
            self.delete_expired(&existing).await?;
        }

        let salt = self.fresh_salt();
        let candidate = IdentityPseudonym {
            original_id,
            hashed_id: digest(&salt, entity_class, original_id),
            entity_class,
            salt,
            created_at: now,
            expires_at: self.ttl.map(|ttl| now + ttl),
        };

        match self.store.insert_pseudonym(candidate.clone()).await {
            Ok(()) => {
                debug!(hashed_id = %candidate.hashed_id, "pseudonym created");
                self.audit.record(
                    AuditRecord::new(now, "pseudonym_mapper", "id_hash_map", "create").after(&candidate.pseudonym()),
                );
                Ok(candidate.pseudonym())
            }
            Err(StoreError::Duplicate(_)) => {
                warn!(
                    entity_class = %entity_class,
                    "concurrent pseudonym insert detected; using existing mapping"
                );
                match self.store.find_pseudonym(original_id, entity_class).await? {
                    Some(winner) if winner.is_live(now) => Ok(winner.pseudonym()),
                    _ => Err(AuthError::internal("pseudonym vanished after insert race")),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve a live pseudonym of the given class to its internal id.
    ///
    /// Expired mappings and mappings of another class are `NotFound`.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn resolve(&self, hashed_id: &HashedId, entity_class: EntityClass) -> AuthResult<Uuid> {
        let now = self.clock.now();
        match self.store.find_by_hash(hashed_id).await? {
            Some(mapping) if mapping.entity_class == entity_class && mapping.is_live(now) => Ok(mapping.original_id),
            _ => Err(AuthError::NotFound),
        }
    }

    /// Delete every expired mapping, auditing each deletion first.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn sweep_expired(&self) -> AuthResult<usize> {
        let now = self.clock.now();
        let expired = self.store.expired_pseudonyms(now).await?;
        let mut deleted = 0;
        for mapping in &expired {
            if self.delete_expired(mapping).await? {
                deleted += 1;
            }
        }
        if deleted > 0 {
            info!(deleted, "expired pseudonyms swept");
        }
        Ok(deleted)
    }

    async fn delete_expired(&self, mapping: &IdentityPseudonym) -> AuthResult<bool> {
        self.audit.record(
            AuditRecord::new(self.clock.now(), "pseudonym_mapper", "id_hash_map", "delete").before(&mapping.pseudonym()),
        );
        Ok(self
            .store
            .delete_pseudonym(mapping.original_id, mapping.entity_class)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditSink;
    use crate::store::InMemoryAuthStore;
    use chrono::{TimeZone, Utc};
    use keystone_core::ManualClock;
    use proptest::prelude::*;

    fn mapper_with(
        ttl: Option<Duration>,
    ) -> (PseudonymMapper, Arc<InMemoryAuthStore>, Arc<ManualClock>, Arc<InMemoryAuditSink>) {
        let store = Arc::new(InMemoryAuthStore::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()));
        let audit = Arc::new(InMemoryAuditSink::new());
        let mapper = PseudonymMapper::new(store.clone(), clock.clone(), audit.clone(), 16, ttl);
        (mapper, store, clock, audit)
    }

    #[tokio::test]
    async fn resolve_round_trips_and_is_class_scoped() {
        let (mapper, _, _, _) = mapper_with(None);
        let id = Uuid::now_v7();
        let p = mapper.pseudonymize(id, EntityClass::Employee).await.unwrap();

        assert_eq!(mapper.resolve(&p.hashed_id, EntityClass::Employee).await.unwrap(), id);
        assert_eq!(
            mapper.resolve(&p.hashed_id, EntityClass::Role).await,
            Err(AuthError::NotFound)
        );
        assert_eq!(p.salt.len(), 32);
    }

    #[tokio::test]
    async fn classes_get_unrelated_pseudonyms() {
        let (mapper, _, _, _) = mapper_with(None);
        let id = Uuid::now_v7();
        let as_employee = mapper.pseudonymize(id, EntityClass::Employee).await.unwrap();
        let as_role = mapper.pseudonymize(id, EntityClass::Role).await.unwrap();
        assert_ne!(as_employee.hashed_id, as_role.hashed_id);
    }

    /// Misses the first lookup, as if another task inserted in between.
    struct RacingStore {
        inner: InMemoryAuthStore,
        missed: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl PseudonymStore for RacingStore {
        async fn find_pseudonym(
            &self,
            original_id: Uuid,
            entity_class: EntityClass,
        ) -> crate::store::StoreResult<Option<IdentityPseudonym>> {
            if !self.missed.swap(true, std::sync::atomic::Ordering::SeqCst) {
                return Ok(None);
            }
            self.inner.find_pseudonym(original_id, entity_class).await
        }

        async fn find_by_hash(&self, hashed_id: &HashedId) -> crate::store::StoreResult<Option<IdentityPseudonym>> {
            self.inner.find_by_hash(hashed_id).await
        }

        async fn insert_pseudonym(&self, mapping: IdentityPseudonym) -> crate::store::StoreResult<()> {
            self.inner.insert_pseudonym(mapping).await
        }

        async fn expired_pseudonyms(
            &self,
            now: chrono::DateTime<Utc>,
        ) -> crate::store::StoreResult<Vec<IdentityPseudonym>> {
            self.inner.expired_pseudonyms(now).await
        }

        async fn delete_pseudonym(&self, original_id: Uuid, entity_class: EntityClass) -> crate::store::StoreResult<bool> {
            self.inner.delete_pseudonym(original_id, entity_class).await
        }
    }

    #[tokio::test]
    async fn lost_insert_race_returns_the_winner() {
        let store = Arc::new(RacingStore {
            inner: InMemoryAuthStore::new(),
            missed: std::sync::atomic::AtomicBool::new(false),
        });
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()));
        let mapper = PseudonymMapper::new(store.clone(), clock.clone(), Arc::new(InMemoryAuditSink::new()), 16, None);

        let id = Uuid::now_v7();
        let winner = IdentityPseudonym {
            original_id: id,
            hashed_id: digest("winner-salt", EntityClass::Employee, id),
            entity_class: EntityClass::Employee,
            salt: "winner-salt".to_string(),
            created_at: clock.now(),
            expires_at: None,
        };
        store.inner.insert_pseudonym(winner.clone()).await.unwrap();

        let p = mapper.pseudonymize(id, EntityClass::Employee).await.unwrap();
        assert_eq!(p, winner.pseudonym());
    }

    #[tokio::test]
    async fn expired_mappings_are_absent_and_swept_with_audit() {
        let (mapper, store, clock, audit) = mapper_with(Some(Duration::hours(1)));
        let id = Uuid::now_v7();
        let p = mapper.pseudonymize(id, EntityClass::Session).await.unwrap();

        clock.advance(Duration::hours(2));
        assert_eq!(mapper.resolve(&p.hashed_id, EntityClass::Session).await, Err(AuthError::NotFound));

        assert_eq!(mapper.sweep_expired().await.unwrap(), 1);
        assert!(store.find_pseudonym(id, EntityClass::Session).await.unwrap().is_none());
        assert_eq!(audit.matching("id_hash_map", "delete").len(), 1);
    }

    #[tokio::test]
    async fn expired_mapping_is_replaced_on_next_use() {
        let (mapper, _, clock, _) = mapper_with(Some(Duration::hours(1)));
        let id = Uuid::now_v7();
        let first = mapper.pseudonymize(id, EntityClass::Employee).await.unwrap();
        clock.advance(Duration::hours(2));
        let second = mapper.pseudonymize(id, EntityClass::Employee).await.unwrap();
        assert_ne!(first.hashed_id, second.hashed_id);
        assert_eq!(mapper.resolve(&second.hashed_id, EntityClass::Employee).await.unwrap(), id);
    }

    proptest! {
        #[test]
        fn pseudonymize_is_idempotent_while_live(calls in 1usize..8, minutes in 0i64..59) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let (mapper, _, clock, _) = mapper_with(Some(Duration::hours(1)));
                let id = Uuid::now_v7();
                let first = mapper.pseudonymize(id, EntityClass::Employee).await.unwrap();
                for _ in 0..calls {
                    clock.advance(Duration::seconds(minutes));
                    let again = mapper.pseudonymize(id, EntityClass::Employee).await.unwrap();
                    prop_assert_eq!(&again, &first);
                }
                Ok(())
            })?;
        }
    }
}
