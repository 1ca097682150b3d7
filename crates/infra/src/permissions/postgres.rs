use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use keystone_auth::{Permission, PermissionSet};
use keystone_core::EmployeeId;

use super::{PermissionLookupError, PermissionSource};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS employee_roles (
        employee_id UUID NOT NULL,
        role_id     UUID NOT NULL,
        PRIMARY KEY (employee_id, role_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS role_permissions (
        role_id    UUID NOT NULL,
        permission TEXT NOT NULL,
        PRIMARY KEY (role_id, permission)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS temporary_permissions (
        employee_id UUID        NOT NULL,
        permission  TEXT        NOT NULL,
        expires_at  TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS temporary_permissions_employee_idx ON temporary_permissions (employee_id)",
];

/// Permission lookups against the relational role model.
#[derive(Debug, Clone)]
pub struct PostgresPermissionSource {
    pool: Arc<PgPool>,
}

impl PostgresPermissionSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    pub async fn ensure_schema(&self) -> Result<(), PermissionLookupError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_lookup_error("ensure_schema", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl PermissionSource for PostgresPermissionSource {
    #[instrument(level = "debug", skip(self, subject), err)]
    async fn permissions_for(
        &self,
        subject: EmployeeId,
        now: DateTime<Utc>,
    ) -> Result<PermissionSet, PermissionLookupError> {
        let rows = sqlx::query(
            r#"
            SELECT rp.permission
            FROM employee_roles er
            JOIN role_permissions rp ON rp.role_id = er.role_id
            WHERE er.employee_id = $1
            UNION
            SELECT tp.permission
            FROM temporary_permissions tp
            WHERE tp.employee_id = $1 AND tp.expires_at > $2
            "#,
        )
        .bind(subject.as_uuid())
        .bind(now)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_lookup_error("permissions_for", e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("permission")
                    .map(Permission::new)
                    .map_err(|e| map_lookup_error("decode_permission", e))
            })
            .collect()
    }
}

fn map_lookup_error(operation: &str, err: sqlx::Error) -> PermissionLookupError {
    match err {
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            PermissionLookupError::Unavailable(format!("{operation}: {err}"))
        }
        other => PermissionLookupError::Backend(format!("{operation}: {other}")),
    }
}
