//! Infrastructure layer: storage, signing, caching and the services that
//! run the session lifecycle.

pub mod audit;
pub mod authz_cache;
pub mod config;
pub mod credentials;
pub mod permissions;
pub mod pipeline;
pub mod pseudonym;
pub mod refresh;
pub mod service;
pub mod sessions;
pub mod store;
pub mod sweep;

use std::sync::Arc;

use keystone_auth::AuditSink;
use keystone_core::Clock;

pub use authz_cache::AuthorizationCache;
pub use config::{AuthConfig, AuthzCacheConfig, ConfigError, CookieConfig};
pub use credentials::CredentialIssuer;
pub use pipeline::{AuthPipeline, PipelineError};
pub use pseudonym::PseudonymMapper;
pub use refresh::RefreshOrchestrator;
pub use service::AuthService;
pub use sessions::SessionLedger;
pub use store::AuthStore;

use crate::permissions::PermissionSource;
use crate::sweep::SweepTargets;

/// Every lifecycle service, wired over one store.
#[derive(Clone)]
pub struct AuthServices {
    pub config: AuthConfig,
    pub clock: Arc<dyn Clock>,
    pub pseudonyms: Arc<PseudonymMapper>,
    pub issuer: Arc<CredentialIssuer>,
    pub ledger: Arc<SessionLedger>,
    pub orchestrator: Arc<RefreshOrchestrator>,
    pub authz: AuthorizationCache,
    pub pipeline: AuthPipeline,
    pub service: Arc<AuthService>,
}

impl AuthServices {
    pub fn build<S>(
        store: Arc<S>,
        permissions: Arc<dyn PermissionSource>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
        config: AuthConfig,
    ) -> Self
    where
        S: AuthStore + 'static,
    {
        let pseudonyms = Arc::new(PseudonymMapper::new(
            store.clone(),
            clock.clone(),
            audit.clone(),
            config.pseudonym_salt_len,
            config.pseudonym_ttl,
        ));
        let issuer = Arc::new(CredentialIssuer::new(
            store.clone(),
            pseudonyms.clone(),
            clock.clone(),
            audit.clone(),
            &config,
        ));
        let ledger = Arc::new(SessionLedger::new(
            store.clone(),
            clock.clone(),
            audit.clone(),
            config.session_ttl,
            config.retention,
        ));
        let orchestrator = Arc::new(RefreshOrchestrator::new(
            store.clone(),
            issuer.clone(),
            ledger.clone(),
            clock.clone(),
            audit.clone(),
            config.thresholds,
        ));
        let authz = AuthorizationCache::new(permissions, clock.clone(), config.authz.clone());
        let pipeline = AuthPipeline::new(
            issuer.clone(),
            pseudonyms.clone(),
            ledger.clone(),
            orchestrator.clone(),
            authz.clone(),
        );
        let service = Arc::new(AuthService::new(
            store,
            issuer.clone(),
            pseudonyms.clone(),
            ledger.clone(),
            authz.clone(),
            clock.clone(),
            audit,
        ));

        Self {
            config,
            clock,
            pseudonyms,
            issuer,
            ledger,
            orchestrator,
            authz,
            pipeline,
            service,
        }
    }

    pub fn sweep_targets(&self) -> SweepTargets {
        SweepTargets {
            pseudonyms: self.pseudonyms.clone(),
            sessions: self.ledger.clone(),
            credentials: self.issuer.clone(),
        }
    }
}
