//! Periodic retention sweeps.
//!
//! One tokio task runs, on a fixed interval: the pseudonym expiry sweep,
//! the session purge and the refresh-record purge. A failing sweep is logged
//! and tried again on the next tick.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::credentials::CredentialIssuer;
use crate::pseudonym::PseudonymMapper;
use crate::sessions::SessionLedger;

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub interval: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(600),
            name: "retention-sweep".to_string(),
        }
    }
}

impl SweepConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Sweep runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SweepStats {
    pub runs: u64,
    pub failures: u64,
    pub pseudonyms_deleted: u64,
    pub sessions_purged: u64,
    pub credentials_purged: u64,
    pub uptime_secs: u64,
}

/// What the sweeps act on.
#[derive(Clone)]
pub struct SweepTargets {
    pub pseudonyms: Arc<PseudonymMapper>,
    pub sessions: Arc<SessionLedger>,
    pub credentials: Arc<CredentialIssuer>,
}

impl SweepTargets {
    /// Run every sweep once, recording into `stats`. Sweeps are independent;
    /// one failing does not skip the others.
    pub async fn run_once(&self, stats: &Mutex<SweepStats>) {
        let pseudonyms = self.pseudonyms.sweep_expired().await;
        let sessions = self.sessions.purge().await;
        let credentials = self.credentials.purge_expired().await;

        let mut failed = false;
        let deleted = pseudonyms.unwrap_or_else(|e| {
            error!(error = %e, "pseudonym sweep failed");
            failed = true;
            0
        });
        let purged_sessions = sessions.unwrap_or_else(|e| {
            error!(error = %e, "session purge failed");
            failed = true;
            0
        });
        let purged_credentials = credentials.unwrap_or_else(|e| {
            error!(error = %e, "refresh record purge failed");
            failed = true;
            0
        });

        if deleted > 0 || purged_sessions > 0 || purged_credentials > 0 {
            info!(
                pseudonyms = deleted,
                sessions = purged_sessions,
                credentials = purged_credentials,
                "retention sweep"
            );
        }

        if let Ok(mut s) = stats.lock() {
            s.runs += 1;
            if failed {
                s.failures += 1;
            }
            s.pseudonyms_deleted += deleted as u64;
            s.sessions_purged += purged_sessions;
            s.credentials_purged += purged_credentials;
        }
    }
}

/// Handle to control a running sweep task.
#[derive(Debug)]
pub struct SweepHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<SweepStats>>,
    started: Instant,
}

impl SweepHandle {
    /// Request shutdown and wait for the task to exit.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }

    pub fn stats(&self) -> SweepStats {
        let mut stats = self.stats.lock().map(|s| s.clone()).unwrap_or_default();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

pub struct SweepScheduler;

impl SweepScheduler {
    /// Spawn the sweep loop. The first sweep runs immediately.
    pub fn spawn(targets: SweepTargets, config: SweepConfig) -> SweepHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(SweepStats::default()));
        let task_stats = stats.clone();
        let name = config.name.clone();

        let join = tokio::spawn(async move {
            info!(sweep = %name, interval_secs = config.interval.as_secs(), "retention sweep started");
            let mut ticker = tokio::time::interval(config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => targets.run_once(&task_stats).await,
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(sweep = %name, "retention sweep stopped");
        });

        SweepHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
            started: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditSink;
    use crate::config::AuthConfig;
    use crate::store::InMemoryAuthStore;
    use chrono::TimeZone;
    use keystone_auth::{ClientMeta, CredentialKind, Subject};
    use keystone_core::{CredentialId, EmployeeId, ManualClock, RoleId};

    fn targets() -> (SweepTargets, Arc<ManualClock>) {
        let config = AuthConfig {
            pseudonym_ttl: Some(chrono::Duration::days(1)),
            ..AuthConfig::default()
        };
        let store = Arc::new(InMemoryAuthStore::new());
        let clock = Arc::new(ManualClock::new(chrono::Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap()));
        let audit = Arc::new(InMemoryAuditSink::new());
        let pseudonyms = Arc::new(PseudonymMapper::new(
            store.clone(),
            clock.clone(),
            audit.clone(),
            config.pseudonym_salt_len,
            config.pseudonym_ttl,
        ));
        let sessions = Arc::new(SessionLedger::new(
            store.clone(),
            clock.clone(),
            audit.clone(),
            config.session_ttl,
            config.retention,
        ));
        let credentials = Arc::new(CredentialIssuer::new(store, pseudonyms.clone(), clock.clone(), audit, &config));
        (
            SweepTargets {
                pseudonyms,
                sessions,
                credentials,
            },
            clock,
        )
    }

    #[tokio::test]
    async fn run_once_sweeps_every_table() {
        let (targets, clock) = targets();
        let subject = Subject::new(EmployeeId::new(), RoleId::new());
        targets.credentials.issue(subject, CredentialKind::Refresh, None).await.unwrap();
        targets
            .sessions
            .create(subject.employee, CredentialId::new(), ClientMeta::default())
            .await
            .unwrap();

        let stats = Mutex::new(SweepStats::default());
        targets.run_once(&stats).await;
        assert_eq!(stats.lock().unwrap().pseudonyms_deleted, 0);

        clock.advance(chrono::Duration::days(40));
        targets.run_once(&stats).await;
        let stats = stats.lock().unwrap().clone();
        assert_eq!(stats.runs, 2);
        assert_eq!(stats.failures, 0);
        // Employee and role pseudonyms minted for the refresh credential.
        assert_eq!(stats.pseudonyms_deleted, 2);
        assert_eq!(stats.sessions_purged, 1);
        assert_eq!(stats.credentials_purged, 1);
    }

    #[tokio::test]
    async fn scheduler_runs_immediately_and_shuts_down() {
        let (targets, _) = targets();
        let handle = SweepScheduler::spawn(targets, SweepConfig::default().with_interval(Duration::from_secs(3600)));
        for _ in 0..50 {
            if handle.stats().runs > 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(handle.stats().runs, 1);
        handle.shutdown().await;
    }
}
