//! Process-local authorization decision cache.
//!
//! Decisions are keyed by `(subject, matched route pattern, required
//! permissions)` and live for the TTL configured for the route. A `true`
//! decision close to expiry is served from cache while a background task
//! re-evaluates it (stale-while-revalidate). Lookup failures are never
//! cached and always deny.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, instrument, warn};

use keystone_auth::{PermissionSet, RoutePattern, authorize, explain_authorization, strip_base_path};
use keystone_core::{Clock, EmployeeId};

use crate::config::AuthzCacheConfig;
use crate::permissions::{PermissionLookupError, PermissionSource};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    subject: EmployeeId,
    pattern: String,
    permissions: PermissionSet,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    allowed: bool,
    expires_at: DateTime<Utc>,
}

/// Cached decisions. Expired entries are dropped on insert, at most once
/// per `default_ttl`, so the map is bounded by the live working set.
struct Table {
    entries: HashMap<CacheKey, Entry>,
    pruned_at: DateTime<Utc>,
}

impl Table {
    fn insert(&mut self, key: CacheKey, entry: Entry, now: DateTime<Utc>, interval: Duration) {
        if now - self.pruned_at >= interval {
            let before = self.entries.len();
            self.entries.retain(|_, e| e.expires_at > now);
            self.pruned_at = now;
            let pruned = before - self.entries.len();
            if pruned > 0 {
                debug!(target: "keystone::authz", pruned, "expired decisions pruned");
            }
        }
        self.entries.insert(key, entry);
    }
}

struct Inner {
    source: Arc<dyn PermissionSource>,
    clock: Arc<dyn Clock>,
    config: AuthzCacheConfig,
    table: RwLock<Table>,
    revalidating: Mutex<HashSet<CacheKey>>,
}

/// Cheap to clone; clones share one cache.
#[derive(Clone)]
pub struct AuthorizationCache {
    inner: Arc<Inner>,
}

impl AuthorizationCache {
    pub fn new(source: Arc<dyn PermissionSource>, clock: Arc<dyn Clock>, config: AuthzCacheConfig) -> Self {
        let table = Table {
            entries: HashMap::new(),
            pruned_at: clock.now(),
        };
        Self {
            inner: Arc::new(Inner {
                source,
                clock,
                config,
                table: RwLock::new(table),
                revalidating: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// The pattern authoritative for `path` and its TTL.
    ///
    /// The base path is stripped first; the first configured pattern that
    /// matches wins. Unmatched paths are cached under their own normalized
    /// path with the default TTL.
    pub fn route_for(&self, path: &str) -> (String, Duration) {
        let config = &self.inner.config;
        let stripped = strip_base_path(path, &config.base_path);
        config
            .routes
            .iter()
            .find(|route| route.pattern.matches(&stripped))
            .map(|route| (route.pattern.as_str().to_string(), route.ttl))
            .unwrap_or_else(|| (RoutePattern::exact(&stripped).as_str().to_string(), config.default_ttl))
    }

    /// Whether `subject` holds every permission in `required` for `path`.
    #[instrument(level = "debug", skip(self, subject, required), fields(required = %required), ret)]
    pub async fn check(&self, subject: EmployeeId, path: &str, required: &PermissionSet) -> bool {
        if required.is_empty() {
            return true;
        }

        let (pattern, ttl) = self.route_for(path);
        let key = CacheKey {
            subject,
            pattern,
            permissions: required.clone(),
        };
        let now = self.inner.clock.now();

        if let Some(entry) = self.inner.get(&key) {
            if entry.expires_at > now {
                if entry.allowed && entry.expires_at - now < self.inner.config.hot_threshold {
                    self.spawn_revalidation(key, ttl);
                }
                return entry.allowed;
            }
        }

        match self.inner.evaluate(subject, required, now).await {
            Ok(allowed) => {
                if !allowed {
                    debug!(target: "keystone::authz", pattern = %key.pattern, "authorization denied");
                }
                self.inner.put(
                    key,
                    Entry {
                        allowed,
                        expires_at: now + ttl,
                    },
                    now,
                );
                allowed
            }
            Err(e) => {
                error!(
                    target: "keystone::authz",
                    pattern = %key.pattern,
                    error = %e,
                    "permission lookup failed; denying"
                );
                false
            }
        }
    }

    fn spawn_revalidation(&self, key: CacheKey, ttl: Duration) {
        let claimed = match self.inner.revalidating.lock() {
            Ok(mut in_flight) => in_flight.insert(key.clone()),
            Err(_) => false,
        };
        if !claimed {
            return;
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let now = inner.clock.now();
            match inner.evaluate(key.subject, &key.permissions, now).await {
                Ok(allowed) => {
                    debug!(target: "keystone::authz", pattern = %key.pattern, allowed, "decision revalidated");
                    inner.put(
                        key.clone(),
                        Entry {
                            allowed,
                            expires_at: now + ttl,
                        },
                        now,
                    );
                }
                Err(e) => warn!(
                    target: "keystone::authz",
                    pattern = %key.pattern,
                    error = %e,
                    "background revalidation failed; entry will expire"
                ),
            }
            if let Ok(mut in_flight) = inner.revalidating.lock() {
                in_flight.remove(&key);
            }
        });
    }

    /// Drop every cached decision for `subject` (e.g. after a role change).
    pub fn invalidate_subject(&self, subject: EmployeeId) {
        if let Ok(mut table) = self.inner.table.write() {
            table.entries.retain(|key, _| key.subject != subject);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut table) = self.inner.table.write() {
            table.entries.clear();
        }
    }

    /// Number of stored decisions, expired ones not yet pruned included.
    pub fn len(&self) -> usize {
        self.inner.table.read().map(|t| t.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inner {
    fn get(&self, key: &CacheKey) -> Option<Entry> {
        self.table.read().ok().and_then(|table| table.entries.get(key).copied())
    }

    fn put(&self, key: CacheKey, entry: Entry, now: DateTime<Utc>) {
        if let Ok(mut table) = self.table.write() {
            table.insert(key, entry, now, self.config.default_ttl);
        }
    }

    async fn evaluate(
        &self,
        subject: EmployeeId,
        required: &PermissionSet,
        now: DateTime<Utc>,
    ) -> Result<bool, PermissionLookupError> {
        let granted = self.source.permissions_for(subject, now).await?;
        if authorize(&granted, required).is_ok() {
            return Ok(true);
        }
        let explanation = explain_authorization(&granted, required);
        debug!(target: "keystone::authz", reason = %explanation.reason, "permission check failed");
        Ok(false)
    }
}
