//! Postgres-backed lifecycle store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Duplicate` |
//! | Database (other) | Any other | `Backend` |
//! | PoolClosed / other | N/A | `Backend` |
//!
//! A conditional `UPDATE` that matches no row is re-checked: a missing row is
//! `NotFound`, a row at another version is `Conflict`.
//!
//! ## Transactions
//!
//! [`RenewalStore::commit`] runs every op of a batch inside one transaction.
//! If the calling future is dropped mid-flight, the `sqlx::Transaction` is
//! dropped uncommitted and Postgres rolls it back.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use keystone_auth::{CredentialKind, CredentialRecord, EntityClass, HashedId, IdentityPseudonym, Session, SessionPatch};
use keystone_core::{CredentialId, EmployeeId, SessionId, Version};

use super::{
    CredentialStore, PseudonymStore, RenewalBatch, RenewalOp, RenewalStore, SessionStore, StoreError, StoreResult,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS id_hash_map (
        original_id  UUID        NOT NULL,
        entity_class TEXT        NOT NULL,
        hashed_id    TEXT        NOT NULL UNIQUE,
        salt         TEXT        NOT NULL,
        created_at   TIMESTAMPTZ NOT NULL,
        expires_at   TIMESTAMPTZ,
        PRIMARY KEY (original_id, entity_class)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tokens (
        id         UUID        PRIMARY KEY,
        subject_id UUID        NOT NULL,
        token_hash TEXT        NOT NULL,
        kind       TEXT        NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL,
        revoked    BOOLEAN     NOT NULL DEFAULT FALSE,
        version    BIGINT      NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS tokens_subject_idx ON tokens (subject_id)",
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        id         UUID        PRIMARY KEY,
        subject_id UUID        NOT NULL,
        token_ref  UUID        NOT NULL,
        user_agent TEXT,
        ip_address TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL,
        revoked    BOOLEAN     NOT NULL DEFAULT FALSE,
        version    BIGINT      NOT NULL,
        UNIQUE (id, version)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS sessions_token_ref_idx ON sessions (token_ref)",
    "CREATE INDEX IF NOT EXISTS sessions_subject_idx ON sessions (subject_id)",
];

const SESSION_COLUMNS: &str =
    "id, subject_id, token_ref, user_agent, ip_address, created_at, expires_at, revoked, version";
const TOKEN_COLUMNS: &str = "id, subject_id, token_hash, kind, created_at, expires_at, revoked, version";
const PSEUDONYM_COLUMNS: &str = "original_id, entity_class, hashed_id, salt, created_at, expires_at";

/// Postgres-backed implementation of every lifecycle table.
///
/// Uses the SQLx connection pool, which is `Send + Sync`. No statement takes
/// an explicit row lock on behalf of callers; concurrency control is the
/// `version` column.
#[derive(Debug, Clone)]
pub struct PostgresAuthStore {
    pool: Arc<PgPool>,
}

impl PostgresAuthStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the lifecycle tables if they do not exist.
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    async fn connection(&self) -> StoreResult<sqlx::pool::PoolConnection<sqlx::Postgres>> {
        self.pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))
    }
}

#[async_trait]
impl PseudonymStore for PostgresAuthStore {
    #[instrument(level = "debug", skip(self, original_id), fields(entity_class = %entity_class), err)]
    async fn find_pseudonym(
        &self,
        original_id: Uuid,
        entity_class: EntityClass,
    ) -> StoreResult<Option<IdentityPseudonym>> {
        let row = sqlx::query(&format!(
            "SELECT {PSEUDONYM_COLUMNS} FROM id_hash_map WHERE original_id = $1 AND entity_class = $2"
        ))
        .bind(original_id)
        .bind(entity_class.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_pseudonym", e))?;

        row.as_ref().map(pseudonym_from_row).transpose()
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn find_by_hash(&self, hashed_id: &HashedId) -> StoreResult<Option<IdentityPseudonym>> {
        let row = sqlx::query(&format!("SELECT {PSEUDONYM_COLUMNS} FROM id_hash_map WHERE hashed_id = $1"))
            .bind(hashed_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_hash", e))?;

        row.as_ref().map(pseudonym_from_row).transpose()
    }

    #[instrument(level = "debug", skip(self, mapping), fields(hashed_id = %mapping.hashed_id), err)]
    async fn insert_pseudonym(&self, mapping: IdentityPseudonym) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO id_hash_map (original_id, entity_class, hashed_id, salt, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(mapping.original_id)
        .bind(mapping.entity_class.as_str())
        .bind(mapping.hashed_id.as_str())
        .bind(&mapping.salt)
        .bind(mapping.created_at)
        .bind(mapping.expires_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_pseudonym", e))?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn expired_pseudonyms(&self, now: DateTime<Utc>) -> StoreResult<Vec<IdentityPseudonym>> {
        let rows = sqlx::query(&format!(
            "SELECT {PSEUDONYM_COLUMNS} FROM id_hash_map WHERE expires_at IS NOT NULL AND expires_at <= $1"
        ))
        .bind(now)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("expired_pseudonyms", e))?;

        rows.iter().map(pseudonym_from_row).collect()
    }

    #[instrument(level = "debug", skip(self, original_id), fields(entity_class = %entity_class), err)]
    async fn delete_pseudonym(&self, original_id: Uuid, entity_class: EntityClass) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM id_hash_map WHERE original_id = $1 AND entity_class = $2")
            .bind(original_id)
            .bind(entity_class.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_pseudonym", e))?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl CredentialStore for PostgresAuthStore {
    #[instrument(level = "debug", skip(self, record), fields(credential_id = %record.id), err)]
    async fn insert_credential(&self, record: CredentialRecord) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        insert_credential_on(&mut *conn, &record).await
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn get_credential(&self, id: CredentialId) -> StoreResult<Option<CredentialRecord>> {
        let mut conn = self.connection().await?;
        get_credential_on(&mut *conn, id).await
    }

    #[instrument(level = "debug", skip(self, subject_id), err)]
    async fn credentials_for_subject(&self, subject_id: EmployeeId) -> StoreResult<Vec<CredentialRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens WHERE subject_id = $1 ORDER BY created_at ASC"
        ))
        .bind(subject_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("credentials_for_subject", e))?;

        rows.iter().map(credential_from_row).collect()
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn revoke_credential(&self, id: CredentialId, expected: Version) -> StoreResult<CredentialRecord> {
        let mut conn = self.connection().await?;
        revoke_credential_on(&mut *conn, id, expected).await
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn purge_credentials(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM tokens WHERE expires_at < $1")
            .bind(cutoff)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("purge_credentials", e))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SessionStore for PostgresAuthStore {
    #[instrument(level = "debug", skip(self, session), fields(session_id = %session.id), err)]
    async fn insert_session(&self, session: Session) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        insert_session_on(&mut *conn, &session).await
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn get_session(&self, id: SessionId) -> StoreResult<Option<Session>> {
        let row = sqlx::query(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_session", e))?;

        row.as_ref().map(session_from_row).transpose()
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn find_session_by_token_ref(&self, token_ref: CredentialId) -> StoreResult<Option<Session>> {
        let row = sqlx::query(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE token_ref = $1 LIMIT 1"))
            .bind(token_ref.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_session_by_token_ref", e))?;

        row.as_ref().map(session_from_row).transpose()
    }

    #[instrument(level = "debug", skip(self, subject_id), err)]
    async fn sessions_for_subject(&self, subject_id: EmployeeId) -> StoreResult<Vec<Session>> {
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE subject_id = $1 ORDER BY created_at ASC"
        ))
        .bind(subject_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("sessions_for_subject", e))?;

        rows.iter().map(session_from_row).collect()
    }

    #[instrument(level = "debug", skip(self, patch), err)]
    async fn update_session(&self, id: SessionId, expected: Version, patch: &SessionPatch) -> StoreResult<Session> {
        let mut conn = self.connection().await?;
        update_session_on(&mut *conn, id, expected, patch).await
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn purge_sessions(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at < $1 OR (revoked AND created_at < $1)")
            .bind(cutoff)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("purge_sessions", e))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RenewalStore for PostgresAuthStore {
    #[instrument(level = "debug", skip(self, batch), fields(ops = batch.ops().len()), err)]
    async fn commit(&self, batch: RenewalBatch) -> StoreResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        for op in batch.into_ops() {
            // An early return drops `tx`, which rolls the transaction back.
            match op {
                RenewalOp::InsertSession(session) => insert_session_on(&mut *tx, &session).await?,
                RenewalOp::PatchSession { id, expected, patch } => {
                    update_session_on(&mut *tx, id, expected, &patch).await?;
                }
                RenewalOp::InsertCredential(record) => insert_credential_on(&mut *tx, &record).await?,
                RenewalOp::RevokeCredential { id, expected } => {
                    revoke_credential_on(&mut *tx, id, expected).await?;
                }
                RenewalOp::AssertCredential { id, expected } => assert_credential_on(&mut *tx, id, expected).await?,
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }
}

async fn insert_session_on(conn: &mut PgConnection, session: &Session) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO sessions (id, subject_id, token_ref, user_agent, ip_address, created_at, expires_at, revoked, version)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(session.id.as_uuid())
    .bind(session.subject_id.as_uuid())
    .bind(session.token_ref.as_uuid())
    .bind(session.user_agent.as_deref())
    .bind(session.ip_address.map(|ip| ip.to_string()))
    .bind(session.created_at)
    .bind(session.expires_at)
    .bind(session.revoked)
    .bind(version_to_db(session.version))
    .execute(conn)
    .await
    .map_err(|e| map_sqlx_error("insert_session", e))?;
    Ok(())
}

async fn update_session_on(
    conn: &mut PgConnection,
    id: SessionId,
    expected: Version,
    patch: &SessionPatch,
) -> StoreResult<Session> {
    let row = sqlx::query(&format!(
        r#"
        UPDATE sessions SET
            token_ref  = COALESCE($3, token_ref),
            expires_at = COALESCE($4, expires_at),
            revoked    = COALESCE($5, revoked),
            version    = version + 1
        WHERE id = $1 AND version = $2
        RETURNING {SESSION_COLUMNS}
        "#
    ))
    .bind(id.as_uuid())
    .bind(version_to_db(expected))
    .bind(patch.token_ref.map(|r| *r.as_uuid()))
    .bind(patch.expires_at)
    .bind(patch.revoked)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("update_session", e))?;

    match row {
        Some(row) => session_from_row(&row),
        None => Err(missed_update(conn, "sessions", *id.as_uuid(), expected).await),
    }
}

async fn insert_credential_on(conn: &mut PgConnection, record: &CredentialRecord) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO tokens (id, subject_id, token_hash, kind, created_at, expires_at, revoked, version)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(record.id.as_uuid())
    .bind(record.subject_id.as_uuid())
    .bind(&record.token_hash)
    .bind(record.kind.as_str())
    .bind(record.created_at)
    .bind(record.expires_at)
    .bind(record.revoked)
    .bind(version_to_db(record.version))
    .execute(conn)
    .await
    .map_err(|e| map_sqlx_error("insert_credential", e))?;
    Ok(())
}

async fn get_credential_on(conn: &mut PgConnection, id: CredentialId) -> StoreResult<Option<CredentialRecord>> {
    let row = sqlx::query(&format!("SELECT {TOKEN_COLUMNS} FROM tokens WHERE id = $1"))
        .bind(id.as_uuid())
        .fetch_optional(conn)
        .await
        .map_err(|e| map_sqlx_error("get_credential", e))?;

    row.as_ref().map(credential_from_row).transpose()
}

async fn revoke_credential_on(
    conn: &mut PgConnection,
    id: CredentialId,
    expected: Version,
) -> StoreResult<CredentialRecord> {
    let row = sqlx::query(&format!(
        r#"
        UPDATE tokens SET revoked = TRUE, version = version + 1
        WHERE id = $1 AND version = $2
        RETURNING {TOKEN_COLUMNS}
        "#
    ))
    .bind(id.as_uuid())
    .bind(version_to_db(expected))
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("revoke_credential", e))?;

    match row {
        Some(row) => credential_from_row(&row),
        None => Err(missed_update(conn, "tokens", *id.as_uuid(), expected).await),
    }
}

/// No-op update used as a guard: it re-evaluates the condition after any
/// concurrent writer commits, and holds the row until our commit.
async fn assert_credential_on(conn: &mut PgConnection, id: CredentialId, expected: Version) -> StoreResult<()> {
    let row = sqlx::query(
        "UPDATE tokens SET version = version WHERE id = $1 AND version = $2 AND NOT revoked RETURNING id",
    )
    .bind(id.as_uuid())
    .bind(version_to_db(expected))
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("assert_credential", e))?;

    match row {
        Some(_) => Ok(()),
        None => Err(match get_credential_on(conn, id).await {
            Ok(Some(record)) if record.version == expected => {
                StoreError::Conflict(format!("credential {id} was revoked"))
            }
            Ok(Some(record)) => StoreError::Conflict(format!(
                "credential: expected {expected}, found {}",
                record.version
            )),
            Ok(None) => StoreError::NotFound(format!("credential {id}")),
            Err(e) => e,
        }),
    }
}

/// Explain why a version-guarded update matched no row.
async fn missed_update(conn: &mut PgConnection, table: &'static str, id: Uuid, expected: Version) -> StoreError {
    let row = sqlx::query(&format!("SELECT version FROM {table} WHERE id = $1"))
        .bind(id)
        .fetch_optional(conn)
        .await;

    match row {
        Ok(Some(row)) => match row.try_get::<i64, _>("version") {
            Ok(actual) => StoreError::Conflict(format!(
                "{table}: expected {expected}, found {}",
                version_from_db(actual)
            )),
            Err(e) => map_sqlx_error("read_version", e),
        },
        Ok(None) => StoreError::NotFound(format!("{table} {id}")),
        Err(e) => map_sqlx_error("read_version", e),
    }
}

fn version_to_db(version: Version) -> i64 {
    i64::try_from(version.get()).unwrap_or(i64::MAX)
}

fn version_from_db(raw: i64) -> Version {
    Version::new(u64::try_from(raw).unwrap_or(0))
}

fn decode_error(what: &str, e: impl core::fmt::Display) -> StoreError {
    StoreError::Backend(format!("failed to decode {what}: {e}"))
}

fn session_from_row(row: &PgRow) -> StoreResult<Session> {
    let ip_address = row
        .try_get::<Option<String>, _>("ip_address")
        .map_err(|e| decode_error("session", e))?
        .map(|raw| raw.parse::<IpAddr>())
        .transpose()
        .map_err(|e| decode_error("session ip_address", e))?;

    Ok(Session {
        id: SessionId::from_uuid(row.try_get("id").map_err(|e| decode_error("session", e))?),
        subject_id: EmployeeId::from_uuid(row.try_get("subject_id").map_err(|e| decode_error("session", e))?),
        token_ref: CredentialId::from_uuid(row.try_get("token_ref").map_err(|e| decode_error("session", e))?),
        user_agent: row.try_get("user_agent").map_err(|e| decode_error("session", e))?,
        ip_address,
        created_at: row.try_get("created_at").map_err(|e| decode_error("session", e))?,
        expires_at: row.try_get("expires_at").map_err(|e| decode_error("session", e))?,
        revoked: row.try_get("revoked").map_err(|e| decode_error("session", e))?,
        version: version_from_db(row.try_get("version").map_err(|e| decode_error("session", e))?),
    })
}

fn credential_from_row(row: &PgRow) -> StoreResult<CredentialRecord> {
    let kind: String = row.try_get("kind").map_err(|e| decode_error("token", e))?;
    let kind = match kind.as_str() {
        "access" => CredentialKind::Access,
        "refresh" => CredentialKind::Refresh,
        other => return Err(decode_error("token", format!("unknown kind '{other}'"))),
    };

    Ok(CredentialRecord {
        id: CredentialId::from_uuid(row.try_get("id").map_err(|e| decode_error("token", e))?),
        subject_id: EmployeeId::from_uuid(row.try_get("subject_id").map_err(|e| decode_error("token", e))?),
        token_hash: row.try_get("token_hash").map_err(|e| decode_error("token", e))?,
        kind,
        created_at: row.try_get("created_at").map_err(|e| decode_error("token", e))?,
        expires_at: row.try_get("expires_at").map_err(|e| decode_error("token", e))?,
        revoked: row.try_get("revoked").map_err(|e| decode_error("token", e))?,
        version: version_from_db(row.try_get("version").map_err(|e| decode_error("token", e))?),
    })
}

fn pseudonym_from_row(row: &PgRow) -> StoreResult<IdentityPseudonym> {
    let entity_class: String = row.try_get("entity_class").map_err(|e| decode_error("id_hash_map", e))?;
    let hashed_id: String = row.try_get("hashed_id").map_err(|e| decode_error("id_hash_map", e))?;

    Ok(IdentityPseudonym {
        original_id: row.try_get("original_id").map_err(|e| decode_error("id_hash_map", e))?,
        hashed_id: HashedId::new(hashed_id),
        entity_class: entity_class
            .parse()
            .map_err(|e| decode_error("id_hash_map", e))?,
        salt: row.try_get("salt").map_err(|e| decode_error("id_hash_map", e))?,
        created_at: row.try_get("created_at").map_err(|e| decode_error("id_hash_map", e))?,
        expires_at: row.try_get("expires_at").map_err(|e| decode_error("id_hash_map", e))?,
    })
}

/// Map SQLx errors to StoreError.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            if is_unique_violation_code(db_err.code().as_deref()) {
                StoreError::Duplicate(msg)
            } else {
                StoreError::Backend(msg)
            }
        }
        sqlx::Error::PoolClosed => StoreError::Backend(format!("connection pool closed in {operation}")),
        other => StoreError::Backend(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_unique_violation_code(code: Option<&str>) -> bool {
    code == Some("23505")
}
