//! Authentication middleware.
//!
//! Runs the request pipeline in front of protected routes, hands the
//! resulting [`RequestAuthContext`] to handlers through request extensions
//! and delivers renewed credentials as cookies.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, OriginalUri, Request, State};
use axum::http::header::USER_AGENT;
use axum::middleware::{self as axum_middleware, Next};
use axum::response::Response;
use axum::Router;
use tracing::debug;

use keystone_auth::{ClientMeta, PermissionSet, RequestCredentials};
use keystone_infra::AuthServices;

use crate::app::errors::auth_error_response;
use crate::cookies;

/// Marker a handler puts on its response after clearing the credential
/// cookies; renewed credentials are then not re-sent.
#[derive(Debug, Clone, Copy)]
pub struct CredentialsCleared;

#[derive(Clone)]
struct Guard {
    services: AuthServices,
    required: PermissionSet,
}

/// Protect every route of `router` with `required`.
///
/// An empty set admits any authenticated request.
pub fn require(router: Router, services: AuthServices, required: PermissionSet) -> Router {
    router.route_layer(axum_middleware::from_fn_with_state(Guard { services, required }, authenticate))
}

async fn authenticate(State(guard): State<Guard>, mut req: Request, next: Next) -> Response {
    let config = &guard.services.config;
    let credentials = request_credentials(&req, config);
    // Nested routers see a stripped uri; permissions are keyed on the full path.
    let path = req
        .extensions()
        .get::<OriginalUri>()
        .map(|uri| uri.path().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    match guard
        .services
        .pipeline
        .authenticate(&credentials, &path, &guard.required)
        .await
    {
        Ok(ctx) => {
            let issued = ctx.issued().clone();
            req.extensions_mut().insert(ctx);
            let mut response = next.run(req).await;
            if response.extensions().get::<CredentialsCleared>().is_none() {
                cookies::append_issued(response.headers_mut(), config, &issued);
            }
            response
        }
        Err(rejected) => {
            debug!(path = %path, error = %rejected.error, "request rejected");
            let mut response = auth_error_response(&rejected.error);
            cookies::append_issued(response.headers_mut(), config, &rejected.issued);
            response
        }
    }
}

fn request_credentials(req: &Request, config: &keystone_infra::AuthConfig) -> RequestCredentials {
    let headers = req.headers();
    RequestCredentials {
        access: cookies::cookie_value(headers, &config.cookies.access_name),
        refresh: cookies::cookie_value(headers, &config.cookies.refresh_name),
        client: ClientMeta {
            user_agent: headers
                .get(USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            ip_address: req
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip()),
        },
    }
}
