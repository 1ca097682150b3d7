//! Audit trail contract.
//!
//! Every state transition in the session lifecycle is reported to an
//! [`AuditSink`]. Sinks are write-only, best-effort and must never block or
//! fail the operation that produced the record.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;

use keystone_core::EmployeeId;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    pub at: DateTime<Utc>,
    /// Component that produced the record (e.g. "refresh_orchestrator").
    pub context: String,
    /// Entity/table affected (e.g. "session", "tokens", "id_hash_map").
    pub entity: String,
    pub action: String,
    pub subject_id: Option<EmployeeId>,
    pub before: Option<JsonValue>,
    pub after: Option<JsonValue>,
}

impl AuditRecord {
    pub fn new(
        at: DateTime<Utc>,
        context: impl Into<String>,
        entity: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            at,
            context: context.into(),
            entity: entity.into(),
            action: action.into(),
            subject_id: None,
            before: None,
            after: None,
        }
    }

    pub fn subject(mut self, subject_id: EmployeeId) -> Self {
        self.subject_id = Some(subject_id);
        self
    }

    /// Snapshot of the state before the transition. Serialization failures
    /// degrade to `None`; an audit record is never worth failing over.
    pub fn before<T: Serialize>(mut self, value: &T) -> Self {
        self.before = serde_json::to_value(value).ok();
        self
    }

    pub fn after<T: Serialize>(mut self, value: &T) -> Self {
        self.after = serde_json::to_value(value).ok();
        self
    }
}

pub trait AuditSink: Send + Sync {
    /// Record an entry. Must not block and must not panic.
    fn record(&self, record: AuditRecord);
}

impl<S> AuditSink for Arc<S>
where
    S: AuditSink + ?Sized,
{
    fn record(&self, record: AuditRecord) {
        (**self).record(record)
    }
}
