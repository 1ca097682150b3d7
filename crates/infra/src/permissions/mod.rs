//! Relational permission model consumed by the authorization cache.
//!
//! A subject's effective permissions are the permissions of its role unioned
//! with any temporary grants that have not expired.

pub mod postgres;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use keystone_auth::{Permission, PermissionSet};
use keystone_core::{EmployeeId, RoleId};

pub use postgres::PostgresPermissionSource;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PermissionLookupError {
    #[error("permission backend unavailable: {0}")]
    Unavailable(String),

    #[error("permission lookup failed: {0}")]
    Backend(String),
}

#[async_trait]
pub trait PermissionSource: Send + Sync {
    /// Effective permissions of `subject` at `now`.
    async fn permissions_for(
        &self,
        subject: EmployeeId,
        now: DateTime<Utc>,
    ) -> Result<PermissionSet, PermissionLookupError>;
}

#[async_trait]
impl<S> PermissionSource for Arc<S>
where
    S: PermissionSource + ?Sized,
{
    async fn permissions_for(
        &self,
        subject: EmployeeId,
        now: DateTime<Utc>,
    ) -> Result<PermissionSet, PermissionLookupError> {
        (**self).permissions_for(subject, now).await
    }
}

/// A time-bounded grant on top of the role's permissions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemporaryGrant {
    pub employee: EmployeeId,
    pub permission: Permission,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Model {
    employee_roles: HashMap<EmployeeId, RoleId>,
    role_permissions: HashMap<RoleId, PermissionSet>,
    temporary: Vec<TemporaryGrant>,
}

/// In-memory permission model.
///
/// Intended for tests/dev. Counts lookups so callers can assert how often
/// the relational model was consulted, and can be switched into a failing
/// mode to exercise fail-closed paths.
#[derive(Debug, Default)]
pub struct InMemoryPermissionModel {
    model: RwLock<Model>,
    lookups: AtomicU64,
    failing: AtomicBool,
}

impl InMemoryPermissionModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign_role(&self, employee: EmployeeId, role: RoleId) {
        if let Ok(mut model) = self.model.write() {
            model.employee_roles.insert(employee, role);
        }
    }

    pub fn grant_role(&self, role: RoleId, permissions: impl IntoIterator<Item = Permission>) {
        if let Ok(mut model) = self.model.write() {
            model
                .role_permissions
                .entry(role)
                .or_default()
                .extend(permissions.into_iter().collect());
        }
    }

    pub fn revoke_role_permissions(&self, role: RoleId) {
        if let Ok(mut model) = self.model.write() {
            model.role_permissions.remove(&role);
        }
    }

    pub fn grant_temporary(&self, employee: EmployeeId, permission: Permission, expires_at: DateTime<Utc>) {
        if let Ok(mut model) = self.model.write() {
            model.temporary.push(TemporaryGrant {
                employee,
                permission,
                expires_at,
            });
        }
    }

    /// Number of `permissions_for` calls served so far (including failures).
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl PermissionSource for InMemoryPermissionModel {
    async fn permissions_for(
        &self,
        subject: EmployeeId,
        now: DateTime<Utc>,
    ) -> Result<PermissionSet, PermissionLookupError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(PermissionLookupError::Unavailable("permission model offline".to_string()));
        }

        let model = self
            .model
            .read()
            .map_err(|_| PermissionLookupError::Backend("lock poisoned".to_string()))?;

        let mut granted = model
            .employee_roles
            .get(&subject)
            .and_then(|role| model.role_permissions.get(role))
            .cloned()
            .unwrap_or_default();

        for grant in model
            .temporary
            .iter()
            .filter(|g| g.employee == subject && g.expires_at > now)
        {
            granted.insert(grant.permission.clone());
        }

        Ok(granted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[tokio::test]
    async fn role_and_live_temporary_grants_are_unioned() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let model = InMemoryPermissionModel::new();
        let (employee, role) = (EmployeeId::new(), RoleId::new());
        model.assign_role(employee, role);
        model.grant_role(role, [Permission::new("employees.read")]);
        model.grant_temporary(employee, Permission::new("reports.export"), now + Duration::hours(1));
        model.grant_temporary(employee, Permission::new("payroll.read"), now - Duration::seconds(1));

        let granted = model.permissions_for(employee, now).await.unwrap();
        assert!(granted.contains("employees.read"));
        assert!(granted.contains("reports.export"));
        assert!(!granted.contains("payroll.read"));
        assert_eq!(model.lookups(), 1);
    }

    #[tokio::test]
    async fn unknown_subjects_have_no_permissions() {
        let model = InMemoryPermissionModel::new();
        let granted = model.permissions_for(EmployeeId::new(), Utc::now()).await.unwrap();
        assert!(granted.is_empty());
    }

    #[tokio::test]
    async fn failing_mode_reports_errors() {
        let model = InMemoryPermissionModel::new();
        model.set_failing(true);
        assert!(model.permissions_for(EmployeeId::new(), Utc::now()).await.is_err());
        assert_eq!(model.lookups(), 1);
    }
}
