//! Drives the router end to end with `oneshot`, against in-memory stores.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use chrono::{Duration, TimeZone, Utc};
use serde_json::Value;
use tower::ServiceExt;

use keystone_auth::{ClientMeta, Subject};
use keystone_core::{EmployeeId, ManualClock, RoleId};
use keystone_infra::audit::InMemoryAuditSink;
use keystone_infra::permissions::InMemoryPermissionModel;
use keystone_infra::store::InMemoryAuthStore;
use keystone_infra::{AuthConfig, AuthServices, AuthzCacheConfig};

struct TestApp {
    app: Router,
    services: AuthServices,
    clock: Arc<ManualClock>,
}

fn test_app() -> TestApp {
    let config = AuthConfig {
        authz: AuthzCacheConfig {
            base_path: "/api/v1".to_string(),
            ..AuthzCacheConfig::default()
        },
        ..AuthConfig::default()
    };
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 2, 8, 0, 0).unwrap()));
    let services = AuthServices::build(
        Arc::new(InMemoryAuthStore::new()),
        Arc::new(InMemoryPermissionModel::new()),
        clock.clone(),
        Arc::new(InMemoryAuditSink::new()),
        config,
    );
    TestApp {
        app: keystone_api::app::build_app(services.clone()),
        services,
        clock,
    }
}

struct LoggedIn {
    employee: EmployeeId,
    pseudonym: String,
    cookie: String,
}

impl TestApp {
    async fn login(&self) -> LoggedIn {
        let subject = Subject::new(EmployeeId::new(), RoleId::new());
        let outcome = self.services.service.login(subject, ClientMeta::default()).await.unwrap();
        let access = outcome.issued.access.unwrap().token;
        let refresh = outcome.issued.refresh.unwrap().token;
        LoggedIn {
            employee: subject.employee,
            pseudonym: outcome.subject_pseudonym.as_str().to_string(),
            cookie: format!("ks_access={access}; ks_refresh={refresh}"),
        }
    }

    async fn send(&self, method: &str, uri: &str, cookie: Option<&str>) -> Response {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(cookie) = cookie {
            request = request.header(COOKIE, cookie);
        }
        self.app
            .clone()
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }
}

async fn json_body(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn set_cookies(response: &Response) -> Vec<String> {
    response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn health_is_public() {
    let app = test_app();
    let response = app.send("GET", "/health", None).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn missing_credentials_get_a_generic_401() {
    let app = test_app();
    let response = app.send("GET", "/api/v1/auth/session", None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(response).await, serde_json::json!({ "error": "unauthorized" }));
}

#[tokio::test]
async fn session_view_exposes_only_the_pseudonym() {
    let app = test_app();
    let user = app.login().await;

    let response = app.send("GET", "/api/v1/auth/session", Some(&user.cookie)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(set_cookies(&response).is_empty());

    let body = json_body(response).await;
    assert_eq!(body["subject"], user.pseudonym.as_str());
    assert_ne!(body["subject"], user.employee.to_string().as_str());
    assert!(body["session_id"].is_string());
    assert_eq!(body["permissions"], serde_json::json!([]));
}

#[tokio::test]
async fn renewed_access_credential_arrives_as_cookie() {
    let app = test_app();
    let user = app.login().await;
    app.clock.advance(Duration::minutes(14));

    let response = app.send("GET", "/api/v1/auth/session", Some(&user.cookie)).await;
    assert_eq!(response.status(), StatusCode::OK);

    let cookies = set_cookies(&response);
    assert_eq!(cookies.len(), 1);
    assert!(cookies[0].starts_with("ks_access="));
    assert!(cookies[0].contains("HttpOnly"));
    assert!(cookies[0].contains("SameSite=Strict"));
    assert!(cookies[0].contains("Max-Age=900"));
}

#[tokio::test]
async fn replayed_pre_renewal_cookie_is_not_renewed_twice() {
    let app = test_app();
    let user = app.login().await;
    app.clock.advance(Duration::minutes(14));

    let first = app.send("GET", "/api/v1/auth/session", Some(&user.cookie)).await;
    assert_eq!(set_cookies(&first).len(), 1);

    let second = app.send("GET", "/api/v1/auth/session", Some(&user.cookie)).await;
    assert_eq!(second.status(), StatusCode::OK);
    assert!(set_cookies(&second).is_empty());
}

#[tokio::test]
async fn logout_clears_cookies_and_ends_the_session() {
    let app = test_app();
    let user = app.login().await;

    let response = app.send("POST", "/api/v1/auth/logout", Some(&user.cookie)).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let cookies = set_cookies(&response);
    assert_eq!(cookies.len(), 2);
    assert!(cookies.iter().all(|c| c.contains("Max-Age=0")));

    let response = app.send("GET", "/api/v1/auth/session", Some(&user.cookie)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn session_routes_live_under_the_base_path() {
    let app = test_app();
    let user = app.login().await;
    let response = app.send("GET", "/auth/session", Some(&user.cookie)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
