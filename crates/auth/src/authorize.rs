use serde::Serialize;

use crate::{AuthError, PermissionSet};

/// Authorize a granted permission set against a route's requirement.
///
/// - No IO
/// - No panics
/// - Every required permission must be granted, unless the grant holds `*`
pub fn authorize(granted: &PermissionSet, required: &PermissionSet) -> Result<(), AuthError> {
    if granted.grants(required) {
        Ok(())
    } else {
        Err(AuthError::AuthorizationDenied)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Authorization Explanation (diagnostics)
// ─────────────────────────────────────────────────────────────────────────────

/// Why a decision came out the way it did.
///
/// Produced for debug logging of denials; never sent to clients.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationExplanation {
    pub required: Vec<String>,
    pub granted: bool,
    pub has_wildcard: bool,
    pub missing: Vec<String>,
    pub reason: String,
}

pub fn explain_authorization(
    granted: &PermissionSet,
    required: &PermissionSet,
) -> AuthorizationExplanation {
    let required_names: Vec<String> = required.iter().map(|p| p.as_str().to_string()).collect();
    let has_wildcard = granted.has_wildcard();
    let missing: Vec<String> = granted
        .missing(required)
        .into_iter()
        .map(|p| p.as_str().to_string())
        .collect();

    let reason = if has_wildcard {
        "subject holds the wildcard permission '*'".to_string()
    } else if required.is_empty() {
        "route requires no permissions".to_string()
    } else if missing.is_empty() {
        format!("subject holds every required permission {required}")
    } else {
        format!("subject lacks {}", missing.join(", "))
    };

    AuthorizationExplanation {
        required: required_names,
        granted: missing.is_empty(),
        has_wildcard,
        missing,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Permission;

    fn set(names: &[&'static str]) -> PermissionSet {
        names.iter().map(|n| Permission::new(*n)).collect()
    }

    #[test]
    fn authorize_denies_partial_grants() {
        let granted = set(&["employees.read"]);
        assert_eq!(authorize(&granted, &set(&["employees.read"])), Ok(()));
        assert_eq!(
            authorize(&granted, &set(&["employees.read", "employees.write"])),
            Err(AuthError::AuthorizationDenied)
        );
    }

    #[test]
    fn explanation_lists_missing_permissions() {
        let explanation = explain_authorization(&set(&["a"]), &set(&["a", "b", "c"]));
        assert!(!explanation.granted);
        assert_eq!(explanation.missing, vec!["b".to_string(), "c".to_string()]);
        assert!(explanation.reason.contains("b, c"));
    }

    #[test]
    fn explanation_for_wildcard() {
        let explanation = explain_authorization(&set(&["*"]), &set(&["admin_access"]));
        assert!(explanation.granted);
        assert!(explanation.has_wildcard);
    }
}
