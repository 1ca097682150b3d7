//! Durable state of the session lifecycle.
//!
//! Three logical tables (`id_hash_map`, `tokens`, `sessions`) behind narrow
//! async traits, plus [`RenewalStore`], which commits every write of one
//! renewal as a single atomic batch.
//!
//! All mutations are conditional on the caller's observed [`Version`]; a
//! store never exposes row locks. Implementations:
//! - [`InMemoryAuthStore`] for tests and local development
//! - [`PostgresAuthStore`] for production

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use keystone_auth::{AuthError, CredentialRecord, EntityClass, HashedId, IdentityPseudonym, Session, SessionPatch};
use keystone_core::{CredentialId, EmployeeId, SessionId, Version};

pub use in_memory::InMemoryAuthStore;
pub use postgres::PostgresAuthStore;

/// Storage operation error.
///
/// These are infrastructure errors; services translate them into the
/// [`AuthError`] taxonomy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A version-guarded write observed a stale version.
    #[error("optimistic concurrency check failed: {0}")]
    Conflict(String),

    /// A uniqueness constraint rejected an insert.
    #[error("duplicate key: {0}")]
    Duplicate(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for AuthError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Conflict(msg) => AuthError::VersionConflict(msg),
            StoreError::NotFound(_) => AuthError::NotFound,
            other => AuthError::internal(other.to_string()),
        }
    }
}

#[async_trait]
pub trait PseudonymStore: Send + Sync {
    async fn find_pseudonym(
        &self,
        original_id: Uuid,
        entity_class: EntityClass,
    ) -> StoreResult<Option<IdentityPseudonym>>;

    async fn find_by_hash(&self, hashed_id: &HashedId) -> StoreResult<Option<IdentityPseudonym>>;

    /// Insert a new mapping. Fails with [`StoreError::Duplicate`] if either
    /// `(original_id, entity_class)` or `hashed_id` is taken.
    async fn insert_pseudonym(&self, mapping: IdentityPseudonym) -> StoreResult<()>;

    /// Mappings with `expires_at <= now`.
    async fn expired_pseudonyms(&self, now: DateTime<Utc>) -> StoreResult<Vec<IdentityPseudonym>>;

    /// Returns whether a row was removed.
    async fn delete_pseudonym(&self, original_id: Uuid, entity_class: EntityClass) -> StoreResult<bool>;
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn insert_credential(&self, record: CredentialRecord) -> StoreResult<()>;

    async fn get_credential(&self, id: CredentialId) -> StoreResult<Option<CredentialRecord>>;

    async fn credentials_for_subject(&self, subject_id: EmployeeId) -> StoreResult<Vec<CredentialRecord>>;

    /// Revoke one record if it is still at `expected`. Returns the new row.
    async fn revoke_credential(&self, id: CredentialId, expected: Version) -> StoreResult<CredentialRecord>;

    /// Delete records that expired before `cutoff`. Returns the count.
    async fn purge_credentials(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert_session(&self, session: Session) -> StoreResult<()>;

    async fn get_session(&self, id: SessionId) -> StoreResult<Option<Session>>;

    /// The session whose current access credential is `token_ref`.
    async fn find_session_by_token_ref(&self, token_ref: CredentialId) -> StoreResult<Option<Session>>;

    async fn sessions_for_subject(&self, subject_id: EmployeeId) -> StoreResult<Vec<Session>>;

    /// Apply `patch` if the stored version is still `expected`, bumping it.
    async fn update_session(&self, id: SessionId, expected: Version, patch: &SessionPatch) -> StoreResult<Session>;

    /// Delete sessions that expired before `cutoff`, or were revoked and
    /// created before it. Returns the count.
    async fn purge_sessions(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;
}

/// One write of a renewal batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalOp {
    InsertSession(Session),
    PatchSession {
        id: SessionId,
        expected: Version,
        patch: SessionPatch,
    },
    InsertCredential(CredentialRecord),
    RevokeCredential {
        id: CredentialId,
        expected: Version,
    },
    /// Guard: the credential is still at `expected` and not revoked.
    AssertCredential {
        id: CredentialId,
        expected: Version,
    },
}

/// Writes of a single renewal, committed all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenewalBatch {
    ops: Vec<RenewalOp>,
}

impl RenewalBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_session(&mut self, session: Session) -> &mut Self {
        self.ops.push(RenewalOp::InsertSession(session));
        self
    }

    pub fn patch_session(&mut self, id: SessionId, expected: Version, patch: SessionPatch) -> &mut Self {
        self.ops.push(RenewalOp::PatchSession { id, expected, patch });
        self
    }

    pub fn insert_credential(&mut self, record: CredentialRecord) -> &mut Self {
        self.ops.push(RenewalOp::InsertCredential(record));
        self
    }

    pub fn revoke_credential(&mut self, id: CredentialId, expected: Version) -> &mut Self {
        self.ops.push(RenewalOp::RevokeCredential { id, expected });
        self
    }

    pub fn assert_credential(&mut self, id: CredentialId, expected: Version) -> &mut Self {
        self.ops.push(RenewalOp::AssertCredential { id, expected });
        self
    }

    pub fn ops(&self) -> &[RenewalOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<RenewalOp> {
        self.ops
    }
}

#[async_trait]
pub trait RenewalStore: Send + Sync {
    /// Apply every op or none. Any failed guard aborts the whole batch with
    /// [`StoreError::Conflict`].
    async fn commit(&self, batch: RenewalBatch) -> StoreResult<()>;
}

macro_rules! forward_arc {
    ($trait:ident { $(fn $name:ident(&self $(, $arg:ident : $ty:ty)*) -> $ret:ty;)* }) => {
        #[async_trait]
        impl<S> $trait for Arc<S>
        where
            S: $trait + ?Sized,
        {
            $(
                async fn $name(&self $(, $arg: $ty)*) -> $ret {
                    (**self).$name($($arg),*).await
                }
            )*
        }
    };
}

forward_arc!(PseudonymStore {
    fn find_pseudonym(&self, original_id: Uuid, entity_class: EntityClass) -> StoreResult<Option<IdentityPseudonym>>;
    fn find_by_hash(&self, hashed_id: &HashedId) -> StoreResult<Option<IdentityPseudonym>>;
    fn insert_pseudonym(&self, mapping: IdentityPseudonym) -> StoreResult<()>;
    fn expired_pseudonyms(&self, now: DateTime<Utc>) -> StoreResult<Vec<IdentityPseudonym>>;
    fn delete_pseudonym(&self, original_id: Uuid, entity_class: EntityClass) -> StoreResult<bool>;
});

forward_arc!(CredentialStore {
    fn insert_credential(&self, record: CredentialRecord) -> StoreResult<()>;
    fn get_credential(&self, id: CredentialId) -> StoreResult<Option<CredentialRecord>>;
    fn credentials_for_subject(&self, subject_id: EmployeeId) -> StoreResult<Vec<CredentialRecord>>;
    fn revoke_credential(&self, id: CredentialId, expected: Version) -> StoreResult<CredentialRecord>;
    fn purge_credentials(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;
});

forward_arc!(SessionStore {
    fn insert_session(&self, session: Session) -> StoreResult<()>;
    fn get_session(&self, id: SessionId) -> StoreResult<Option<Session>>;
    fn find_session_by_token_ref(&self, token_ref: CredentialId) -> StoreResult<Option<Session>>;
    fn sessions_for_subject(&self, subject_id: EmployeeId) -> StoreResult<Vec<Session>>;
    fn update_session(&self, id: SessionId, expected: Version, patch: &SessionPatch) -> StoreResult<Session>;
    fn purge_sessions(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;
});

forward_arc!(RenewalStore {
    fn commit(&self, batch: RenewalBatch) -> StoreResult<()>;
});

/// Every table the lifecycle needs, behind one handle.
pub trait AuthStore: PseudonymStore + CredentialStore + SessionStore + RenewalStore {}

impl<S> AuthStore for S where S: PseudonymStore + CredentialStore + SessionStore + RenewalStore {}
