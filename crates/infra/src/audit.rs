//! Audit sink implementations.
//!
//! The lifecycle reports every state transition through
//! [`keystone_auth::AuditSink`], which is synchronous and infallible. Sinks
//! that persist records hand them to a background task so the primary
//! operation never waits on audit IO.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use keystone_auth::{AuditRecord, AuditSink};

/// Writes records as structured `info` events (target `keystone::audit`).
///
/// Subject ids are internal identifiers and are deliberately not logged.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: AuditRecord) {
        info!(
            target: "keystone::audit",
            at = %record.at,
            context = %record.context,
            entity = %record.entity,
            action = %record.action,
            has_before = record.before.is_some(),
            has_after = record.after.is_some(),
            "audit"
        );
    }
}

/// Collects records in memory. Intended for tests.
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Records matching `entity` and `action`.
    pub fn matching(&self, entity: &str, action: &str) -> Vec<AuditRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.entity == entity && r.action == action)
            .collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&self, record: AuditRecord) {
        match self.records.lock() {
            Ok(mut records) => records.push(record),
            Err(_) => warn!(target: "keystone::audit", "in-memory audit sink poisoned; record dropped"),
        }
    }
}

/// Durable destination for audit records (e.g. an `audit_log` table).
#[async_trait]
pub trait AuditWriter: Send + Sync {
    async fn write(&self, record: AuditRecord) -> anyhow::Result<()>;
}

#[async_trait]
impl<W> AuditWriter for Arc<W>
where
    W: AuditWriter + ?Sized,
{
    async fn write(&self, record: AuditRecord) -> anyhow::Result<()> {
        (**self).write(record).await
    }
}

/// Bounded, non-blocking hand-off to an [`AuditWriter`].
///
/// `record` uses `try_send`: when the queue is full the record is dropped
/// and a warning is logged. Writer failures are logged, never propagated.
#[derive(Debug, Clone)]
pub struct ChannelAuditSink {
    tx: mpsc::Sender<AuditRecord>,
}

impl ChannelAuditSink {
    /// Spawn the writer task. It exits once every sink clone is dropped.
    pub fn spawn<W>(writer: W, capacity: usize) -> (Self, JoinHandle<()>)
    where
        W: AuditWriter + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<AuditRecord>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let entity = record.entity.clone();
                let action = record.action.clone();
                if let Err(e) = writer.write(record).await {
                    warn!(target: "keystone::audit", %entity, %action, error = %e, "audit write failed");
                }
            }
        });
        (Self { tx }, handle)
    }
}

impl AuditSink for ChannelAuditSink {
    fn record(&self, record: AuditRecord) {
        if let Err(e) = self.tx.try_send(record) {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "writer stopped",
            };
            warn!(target: "keystone::audit", reason, "audit record dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingWriter {
        written: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl AuditWriter for CountingWriter {
        async fn write(&self, _record: AuditRecord) -> anyhow::Result<()> {
            self.written.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("audit table unavailable");
            }
            Ok(())
        }
    }

    fn record(action: &str) -> AuditRecord {
        AuditRecord::new(Utc::now(), "test", "session", action)
    }

    #[test]
    fn in_memory_sink_filters_by_entity_and_action() {
        let sink = InMemoryAuditSink::new();
        sink.record(record("create"));
        sink.record(record("revoke"));
        assert_eq!(sink.records().len(), 2);
        assert_eq!(sink.matching("session", "revoke").len(), 1);
    }

    #[tokio::test]
    async fn channel_sink_delivers_to_writer() {
        let writer = Arc::new(CountingWriter::default());
        let (sink, handle) = ChannelAuditSink::spawn(writer.clone(), 8);
        sink.record(record("create"));
        sink.record(record("revoke"));
        drop(sink);
        handle.await.unwrap();
        assert_eq!(writer.written.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn writer_failures_do_not_stop_the_sink() {
        let writer = Arc::new(CountingWriter {
            fail: true,
            ..CountingWriter::default()
        });
        let (sink, handle) = ChannelAuditSink::spawn(writer.clone(), 8);
        sink.record(record("a"));
        sink.record(record("b"));
        drop(sink);
        handle.await.unwrap();
        assert_eq!(writer.written.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        // The writer task never gets to run on this current-thread runtime
        // before all sends are attempted.
        let writer = Arc::new(CountingWriter::default());
        let (sink, handle) = ChannelAuditSink::spawn(writer.clone(), 1);
        for i in 0..5 {
            sink.record(record(&format!("op-{i}")));
        }
        drop(sink);
        handle.await.unwrap();
        assert_eq!(writer.written.load(Ordering::SeqCst), 1);
    }
}
