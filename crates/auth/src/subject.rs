use serde::{Deserialize, Serialize};

use keystone_core::{EmployeeId, RoleId};

/// The authenticated subject: an employee acting under one role.
///
/// Credentials are bound to this pair. Both halves are internal identifiers
/// and are pseudonymized before they are embedded in any credential.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject {
    pub employee: EmployeeId,
    pub role: RoleId,
}

impl Subject {
    pub fn new(employee: EmployeeId, role: RoleId) -> Self {
        Self { employee, role }
    }
}
