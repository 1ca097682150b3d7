//! Router assembly.
//!
//! - `routes/`: handlers, one file per area
//! - `errors.rs`: the fixed error responses

use axum::routing::{get, post};
use axum::{Extension, Router};

use keystone_auth::PermissionSet;
use keystone_infra::AuthServices;

use crate::middleware;

pub mod errors;
pub mod routes;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
///
/// `/health` is public; the session routes are mounted under the configured
/// base path and require an authenticated request.
pub fn build_app(services: AuthServices) -> Router {
    let session_routes = Router::new()
        .route("/auth/session", get(routes::session::current))
        .route("/auth/logout", post(routes::session::logout));
    let protected = middleware::require(session_routes, services.clone(), PermissionSet::default());

    let base = services.config.authz.base_path.trim_matches('/');
    let api = if base.is_empty() {
        protected
    } else {
        Router::new().nest(&format!("/{base}"), protected)
    };

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(api)
        .layer(Extension(services))
}
