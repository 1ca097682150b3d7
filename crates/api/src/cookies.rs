//! Credential cookies.
//!
//! Credentials travel only as `HttpOnly` cookies; renewed credentials are
//! handed back through `Set-Cookie`, never in a response body.

use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue};
use tracing::warn;

use keystone_auth::{CredentialKind, IssuedCredentials};
use keystone_infra::{AuthConfig, CookieConfig};

/// Value of cookie `name` in the request's `Cookie` headers.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let Ok(value) = header.to_str() else {
            continue;
        };
        for pair in value.split(';') {
            let mut parts = pair.trim().splitn(2, '=');
            let (Some(key), Some(val)) = (parts.next(), parts.next()) else {
                continue;
            };
            let val = val.trim();
            if key.trim() == name && !val.is_empty() {
                return Some(val.to_string());
            }
        }
    }
    None
}

fn render(config: &CookieConfig, name: &str, value: &str, max_age: i64) -> Option<HeaderValue> {
    let mut cookie = format!("{name}={value}; Path=/; HttpOnly; SameSite=Strict; Max-Age={max_age}");
    if config.secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie).ok()
}

/// Append one `Set-Cookie` per issued credential, with `Max-Age` set to the
/// credential's lifetime.
pub fn append_issued(headers: &mut HeaderMap, config: &AuthConfig, issued: &IssuedCredentials) {
    for token in issued.tokens() {
        let (name, ttl) = match token.kind {
            CredentialKind::Access => (&config.cookies.access_name, config.access_ttl),
            CredentialKind::Refresh => (&config.cookies.refresh_name, config.refresh_ttl),
        };
        match render(&config.cookies, name, &token.token, ttl.num_seconds()) {
            Some(cookie) => {
                headers.append(SET_COOKIE, cookie);
            }
            None => warn!(credential_id = %token.id, "issued credential is not a valid cookie value"),
        }
    }
}

/// Append `Set-Cookie` headers expiring both credential cookies.
pub fn append_cleared(headers: &mut HeaderMap, config: &CookieConfig) {
    for name in [&config.access_name, &config.refresh_name] {
        if let Some(cookie) = render(config, name, "", 0) {
            headers.append(SET_COOKIE, cookie);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use keystone_auth::IssuedToken;
    use keystone_core::CredentialId;

    #[test]
    fn reads_named_cookie_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("theme=dark; ks_access=abc.def ; ks_refresh="));
        assert_eq!(cookie_value(&headers, "ks_access").as_deref(), Some("abc.def"));
        assert_eq!(cookie_value(&headers, "ks_refresh"), None);
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn issued_credentials_become_strict_http_only_cookies() {
        let config = AuthConfig::default();
        let issued = IssuedCredentials {
            access: Some(IssuedToken {
                kind: CredentialKind::Access,
                id: CredentialId::new(),
                token: "aaa".to_string(),
                expires_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 15, 0).unwrap(),
            }),
            refresh: None,
        };
        let mut headers = HeaderMap::new();
        append_issued(&mut headers, &config, &issued);

        let cookies: Vec<_> = headers.get_all(SET_COOKIE).iter().collect();
        assert_eq!(cookies.len(), 1);
        assert_eq!(
            cookies[0].to_str().unwrap(),
            "ks_access=aaa; Path=/; HttpOnly; SameSite=Strict; Max-Age=900; Secure"
        );
    }

    #[test]
    fn clearing_expires_both_cookies() {
        let mut headers = HeaderMap::new();
        append_cleared(&mut headers, &CookieConfig::default());
        let cookies: Vec<_> = headers
            .get_all(SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(cookies.len(), 2);
        assert!(cookies.iter().all(|c| c.contains("Max-Age=0")));
    }
}
