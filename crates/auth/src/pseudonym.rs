//! Pseudonymized identity records.
//!
//! A pseudonym is a salted one-way digest standing in for an internal
//! identifier in every externally observable artifact. The mapping row is the
//! only way back from a pseudonym to the internal identifier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use keystone_core::DomainError;

/// Class of entity a pseudonym stands in for.
///
/// The same internal UUID pseudonymized under two classes yields two unrelated
/// pseudonyms.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityClass {
    Employee,
    Role,
    Session,
}

impl EntityClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityClass::Employee => "employee",
            EntityClass::Role => "role",
            EntityClass::Session => "session",
        }
    }
}

impl core::fmt::Display for EntityClass {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for EntityClass {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "employee" => Ok(EntityClass::Employee),
            "role" => Ok(EntityClass::Role),
            "session" => Ok(EntityClass::Session),
            other => Err(DomainError::validation(format!("unknown entity class '{other}'"))),
        }
    }
}

/// Externally visible hashed identifier (lowercase hex digest).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HashedId(String);

impl HashedId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for HashedId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of pseudonymization: the hash and the salt it was derived with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pseudonym {
    pub hashed_id: HashedId,
    pub salt: String,
}

/// Durable mapping row (`id_hash_map`).
///
/// Unique on `hashed_id` and on `(original_id, entity_class)`. Never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityPseudonym {
    pub original_id: Uuid,
    pub hashed_id: HashedId,
    pub entity_class: EntityClass,
    pub salt: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl IdentityPseudonym {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|exp| exp > now)
    }

    pub fn pseudonym(&self) -> Pseudonym {
        Pseudonym {
            hashed_id: self.hashed_id.clone(),
            salt: self.salt.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn entity_class_codes_round_trip() {
        for class in [EntityClass::Employee, EntityClass::Role, EntityClass::Session] {
            assert_eq!(class.as_str().parse::<EntityClass>().unwrap(), class);
        }
        assert!("department".parse::<EntityClass>().is_err());
    }

    #[test]
    fn mapping_without_expiry_is_always_live() {
        let now = Utc::now();
        let mut mapping = IdentityPseudonym {
            original_id: Uuid::now_v7(),
            hashed_id: HashedId::new("ab"),
            entity_class: EntityClass::Employee,
            salt: "00".to_string(),
            created_at: now,
            expires_at: None,
        };
        assert!(mapping.is_live(now + Duration::days(3650)));

        mapping.expires_at = Some(now + Duration::hours(1));
        assert!(mapping.is_live(now));
        assert!(!mapping.is_live(now + Duration::hours(1)));
    }
}
