use std::borrow::Cow;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Permission identifier.
///
/// Permissions are modeled as opaque strings (e.g. "employees.read").
/// The special wildcard permission `"*"` grants everything; it is how the
/// relational model expresses super-administrator roles without enumerating
/// every permission name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(Cow<'static, str>);

impl Permission {
    pub const WILDCARD: &'static str = "*";

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Permission {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for Permission {
    fn from(value: &'static str) -> Self {
        Self::new(value)
    }
}

/// An ordered set of permissions.
///
/// Ordered so that two sets with the same members hash and compare equal
/// regardless of insertion order; the authorization cache keys on it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(BTreeSet<Permission>);

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a comma-separated list (`"employees.read, employees.write"`).
    pub fn parse_list(list: &str) -> Self {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| Permission::new(s.to_string()))
            .collect()
    }

    pub fn insert(&mut self, permission: Permission) -> bool {
        self.0.insert(permission)
    }

    pub fn contains(&self, permission: &str) -> bool {
        self.0.iter().any(|p| p.as_str() == permission)
    }

    pub fn has_wildcard(&self) -> bool {
        self.contains(Permission::WILDCARD)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Permission> {
        self.0.iter()
    }

    pub fn extend(&mut self, other: PermissionSet) {
        self.0.extend(other.0);
    }

    /// Whether this (granted) set satisfies every permission in `required`.
    pub fn grants(&self, required: &PermissionSet) -> bool {
        self.has_wildcard() || required.0.is_subset(&self.0)
    }

    /// Required permissions not covered by this (granted) set.
    pub fn missing<'a>(&'a self, required: &'a PermissionSet) -> Vec<&'a Permission> {
        if self.has_wildcard() {
            return Vec::new();
        }
        required.0.difference(&self.0).collect()
    }
}

impl FromIterator<Permission> for PermissionSet {
    fn from_iter<T: IntoIterator<Item = Permission>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a PermissionSet {
    type Item = &'a Permission;
    type IntoIter = std::collections::btree_set::Iter<'a, Permission>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl core::fmt::Display for PermissionSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let names: Vec<&str> = self.0.iter().map(Permission::as_str).collect();
        write!(f, "{{{}}}", names.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&'static str]) -> PermissionSet {
        names.iter().map(|n| Permission::new(*n)).collect()
    }

    #[test]
    fn insertion_order_does_not_matter() {
        assert_eq!(set(&["b", "a"]), set(&["a", "b"]));
    }

    #[test]
    fn grants_requires_every_member() {
        let granted = set(&["employees.read", "employees.write"]);
        assert!(granted.grants(&set(&["employees.read"])));
        assert!(!granted.grants(&set(&["employees.read", "admin_access"])));
        assert_eq!(
            granted.missing(&set(&["employees.read", "admin_access"])),
            vec![&Permission::new("admin_access")]
        );
    }

    #[test]
    fn wildcard_grants_everything() {
        let granted = set(&["*"]);
        assert!(granted.grants(&set(&["admin_access", "roles.write"])));
        assert!(granted.missing(&set(&["admin_access"])).is_empty());
    }

    #[test]
    fn empty_requirement_is_always_granted() {
        assert!(PermissionSet::new().grants(&PermissionSet::new()));
    }

    #[test]
    fn parse_list_trims_and_skips_blanks() {
        assert_eq!(PermissionSet::parse_list(" a, ,b "), set(&["a", "b"]));
    }
}
