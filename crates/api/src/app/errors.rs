use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use keystone_auth::AuthError;

/// Map an authentication error to its fixed public response.
///
/// The body never carries internal detail.
pub fn auth_error_response(err: &AuthError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!(error = %err, "request failed");
    }
    (status, axum::Json(json!({ "error": err.public_code() }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_detail_is_not_exposed() {
        let response = auth_error_response(&AuthError::Internal("pool timed out".into()));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response = auth_error_response(&AuthError::AuthorizationDenied);
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = auth_error_response(&AuthError::ReauthenticationRequired);
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
