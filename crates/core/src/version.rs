//! Optimistic concurrency primitives.
//!
//! Every mutable record (session rows, refresh-credential rows) carries a
//! [`Version`]. Writers state the version they observed; a store accepts the
//! write only if the stored version still matches, then bumps it.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Monotonically increasing record version. Freshly created records are at 1.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    pub const INITIAL: Version = Version(1);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Default for Version {
    fn default() -> Self {
        Self::INITIAL
    }
}

impl core::fmt::Display for Version {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Optimistic concurrency expectation for a conditional write.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking (administrative sweeps only).
    Any,
    /// Require the record to be at an exact version.
    Exact(Version),
}

impl ExpectedVersion {
    pub fn matches(self, actual: Version) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: Version) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "optimistic concurrency check failed (expected: {self:?}, actual: {actual})"
            )))
        }
    }
}

impl From<Version> for ExpectedVersion {
    fn from(value: Version) -> Self {
        ExpectedVersion::Exact(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn any_matches_everything() {
        assert!(ExpectedVersion::Any.matches(Version::new(42)));
    }

    proptest! {
        #[test]
        fn exact_only_matches_the_same_version(observed in 1u64..10_000, stored in 1u64..10_000) {
            let check = ExpectedVersion::Exact(Version::new(observed)).check(Version::new(stored));
            if observed == stored {
                prop_assert!(check.is_ok());
            } else {
                prop_assert!(matches!(check, Err(DomainError::Conflict(_))));
            }
        }
    }
}
