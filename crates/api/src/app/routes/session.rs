//! Session introspection and logout.

use axum::extract::Extension;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use keystone_auth::RequestAuthContext;
use keystone_infra::AuthServices;

use crate::app::errors::auth_error_response;
use crate::cookies;
use crate::middleware::CredentialsCleared;

#[derive(Debug, Serialize)]
pub struct SessionView {
    /// Employee pseudonym; the internal id is never returned.
    pub subject: String,
    pub session_id: String,
    pub permissions: Vec<String>,
}

impl From<&RequestAuthContext> for SessionView {
    fn from(ctx: &RequestAuthContext) -> Self {
        Self {
            subject: ctx.subject_pseudonym().as_str().to_string(),
            session_id: ctx.session_id().to_string(),
            permissions: ctx.permissions().iter().map(|p| p.as_str().to_string()).collect(),
        }
    }
}

pub async fn current(Extension(ctx): Extension<RequestAuthContext>) -> Json<SessionView> {
    Json(SessionView::from(&ctx))
}

/// Revoke the session and the refresh credential, then expire both cookies.
pub async fn logout(
    headers: HeaderMap,
    Extension(services): Extension<AuthServices>,
    Extension(ctx): Extension<RequestAuthContext>,
) -> Response {
    // A refresh credential rotated by this very request supersedes the cookie.
    let refresh = ctx
        .issued()
        .refresh
        .as_ref()
        .map(|t| t.token.clone())
        .or_else(|| cookies::cookie_value(&headers, &services.config.cookies.refresh_name));

    if let Err(err) = services.service.logout(&ctx, refresh.as_deref()).await {
        return auth_error_response(&err.at_boundary());
    }

    let mut response_headers = HeaderMap::new();
    cookies::append_cleared(&mut response_headers, &services.config.cookies);
    let mut response = (StatusCode::NO_CONTENT, response_headers).into_response();
    response.extensions_mut().insert(CredentialsCleared);
    response
}
