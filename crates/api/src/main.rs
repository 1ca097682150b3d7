use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;

use keystone_core::SystemClock;
use keystone_infra::audit::TracingAuditSink;
use keystone_infra::permissions::{InMemoryPermissionModel, PostgresPermissionSource};
use keystone_infra::store::{InMemoryAuthStore, PostgresAuthStore};
use keystone_infra::sweep::{SweepConfig, SweepScheduler};
use keystone_infra::{AuthConfig, AuthServices};
use keystone_observability::ObservabilityConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    keystone_observability::init(&ObservabilityConfig::from_env());

    let config = AuthConfig::from_env().context("invalid configuration")?;
    if config.uses_dev_secrets() {
        tracing::warn!("signing with the built-in development secrets; never do this in production");
    }
    let sweep_interval = config.sweep_interval.to_std().context("invalid sweep interval")?;

    let clock = Arc::new(SystemClock);
    let audit = Arc::new(TracingAuditSink);

    let services = match std::env::var("DATABASE_URL") {
        Ok(database_url) => {
            let pool = PgPool::connect(&database_url)
                .await
                .context("failed to connect to Postgres")?;
            let store = Arc::new(PostgresAuthStore::new(pool.clone()));
            store.ensure_schema().await.context("failed to prepare auth schema")?;
            let permissions = Arc::new(PostgresPermissionSource::new(pool));
            permissions
                .ensure_schema()
                .await
                .context("failed to prepare permission schema")?;
            tracing::info!("using Postgres stores");
            AuthServices::build(store, permissions, clock, audit, config)
        }
        Err(_) => {
            tracing::warn!("DATABASE_URL not set; using in-memory stores");
            AuthServices::build(
                Arc::new(InMemoryAuthStore::new()),
                Arc::new(InMemoryPermissionModel::new()),
                clock,
                audit,
                config,
            )
        }
    };

    let sweep = SweepScheduler::spawn(services.sweep_targets(), SweepConfig::default().with_interval(sweep_interval));
    let app = keystone_api::app::build_app(services);

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    sweep.shutdown().await;
    Ok(())
}
