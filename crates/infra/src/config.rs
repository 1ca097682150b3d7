//! Configuration loading and representation.
//!
//! Every knob has a default suitable for local development. Production
//! deployments set `KEYSTONE_*` environment variables and must provide both
//! signing secrets; only `KEYSTONE_DEV_MODE=true` falls back to the
//! development ones.

use std::str::FromStr;

use chrono::Duration;
use thiserror::Error;

use keystone_auth::{RenewalThresholds, RoutePattern};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// TTL for authorization decisions on routes matching `pattern`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTtl {
    pub pattern: RoutePattern,
    pub ttl: Duration,
}

impl RouteTtl {
    pub fn new(pattern: RoutePattern, ttl: Duration) -> Self {
        Self { pattern, ttl }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthzCacheConfig {
    /// Prefix stripped from request paths before pattern matching.
    pub base_path: String,
    /// TTL for paths matching no configured pattern.
    pub default_ttl: Duration,
    /// `true` decisions with less remaining lifetime than this are
    /// revalidated in the background.
    pub hot_threshold: Duration,
    /// Ordered; the first matching pattern wins.
    pub routes: Vec<RouteTtl>,
}

impl Default for AuthzCacheConfig {
    fn default() -> Self {
        Self {
            base_path: String::new(),
            default_ttl: Duration::seconds(60),
            hot_threshold: Duration::seconds(10),
            routes: Vec::new(),
        }
    }
}

impl AuthzCacheConfig {
    pub fn with_route(mut self, pattern: RoutePattern, ttl: Duration) -> Self {
        self.routes.push(RouteTtl::new(pattern, ttl));
        self
    }

    /// Parse `"/admin/*=30,/employees/:id=300"` (TTL in seconds).
    pub fn parse_routes(raw: &str) -> Result<Vec<RouteTtl>, ConfigError> {
        const KEY: &str = "KEYSTONE_AUTHZ_ROUTE_TTLS";

        raw.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let (pattern, ttl) = entry
                    .rsplit_once('=')
                    .ok_or_else(|| ConfigError::invalid(KEY, format!("expected pattern=seconds, got '{entry}'")))?;
                let pattern = RoutePattern::parse(pattern.trim())
                    .map_err(|e| ConfigError::invalid(KEY, e.to_string()))?;
                let seconds = ttl
                    .trim()
                    .parse::<i64>()
                    .map_err(|e| ConfigError::invalid(KEY, format!("bad ttl '{ttl}': {e}")))?;
                Ok(RouteTtl::new(pattern, Duration::seconds(seconds)))
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieConfig {
    pub access_name: String,
    pub refresh_name: String,
    pub secure: bool,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            access_name: "ks_access".to_string(),
            refresh_name: "ks_refresh".to_string(),
            secure: true,
        }
    }
}

/// Authentication and session lifecycle configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthConfig {
    pub access_secret: String,
    pub refresh_secret: String,
    pub issuer: String,

    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub session_ttl: Duration,
    pub thresholds: RenewalThresholds,

    pub pseudonym_salt_len: usize,
    /// Lifetime of newly created pseudonym mappings; `None` keeps them forever.
    pub pseudonym_ttl: Option<Duration>,

    /// How long revoked/expired sessions and refresh records are kept.
    pub retention: Duration,
    pub sweep_interval: Duration,

    pub cookies: CookieConfig,
    pub authz: AuthzCacheConfig,
}

// Secrets stay out of logs.
impl core::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("access_secret", &"<redacted>")
            .field("refresh_secret", &"<redacted>")
            .field("issuer", &self.issuer)
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .field("session_ttl", &self.session_ttl)
            .field("thresholds", &self.thresholds)
            .field("pseudonym_salt_len", &self.pseudonym_salt_len)
            .field("pseudonym_ttl", &self.pseudonym_ttl)
            .field("retention", &self.retention)
            .field("sweep_interval", &self.sweep_interval)
            .field("cookies", &self.cookies)
            .field("authz", &self.authz)
            .finish()
    }
}

const DEV_ACCESS_SECRET: &str = "dev-access-secret";
const DEV_REFRESH_SECRET: &str = "dev-refresh-secret";

impl Default for AuthConfig {
    /// Development defaults, including well-known signing secrets.
    fn default() -> Self {
        Self {
            access_secret: DEV_ACCESS_SECRET.to_string(),
            refresh_secret: DEV_REFRESH_SECRET.to_string(),
            issuer: "keystone".to_string(),
            access_ttl: Duration::minutes(15),
            refresh_ttl: Duration::days(7),
            session_ttl: Duration::hours(12),
            thresholds: RenewalThresholds::default(),
            pseudonym_salt_len: 16,
            pseudonym_ttl: None,
            retention: Duration::days(30),
            sweep_interval: Duration::minutes(10),
            cookies: CookieConfig::default(),
            authz: AuthzCacheConfig::default(),
        }
    }
}

impl AuthConfig {
    /// Load from `KEYSTONE_*` environment variables on top of the defaults.
    ///
    /// Both signing secrets are required unless `KEYSTONE_DEV_MODE=true`,
    /// which falls back to the development secrets. The result is validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`AuthConfig::from_env`], reading through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let dev_mode = match lookup("KEYSTONE_DEV_MODE") {
            Some(raw) => parse_number::<bool>("KEYSTONE_DEV_MODE", &raw)?,
            None => false,
        };
        let secret = |key: &'static str, dev: &str| match lookup(key) {
            Some(value) => Ok(value),
            None if dev_mode => Ok(dev.to_string()),
            None => Err(ConfigError::Missing(key)),
        };

        let mut config = Self {
            access_secret: secret("KEYSTONE_ACCESS_SECRET", DEV_ACCESS_SECRET)?,
            refresh_secret: secret("KEYSTONE_REFRESH_SECRET", DEV_REFRESH_SECRET)?,
            ..Self::default()
        };

        if let Some(issuer) = lookup("KEYSTONE_ISSUER") {
            config.issuer = issuer;
        }

        let seconds = |key: &'static str| -> Result<Option<Duration>, ConfigError> {
            lookup(key)
                .map(|raw| parse_number::<i64>(key, &raw).map(Duration::seconds))
                .transpose()
        };

        if let Some(ttl) = seconds("KEYSTONE_ACCESS_TTL_SECS")? {
            config.access_ttl = ttl;
        }
        if let Some(ttl) = seconds("KEYSTONE_REFRESH_TTL_SECS")? {
            config.refresh_ttl = ttl;
        }
        if let Some(ttl) = seconds("KEYSTONE_SESSION_TTL_SECS")? {
            config.session_ttl = ttl;
        }
        if let Some(threshold) = seconds("KEYSTONE_ACCESS_RENEW_THRESHOLD_SECS")? {
            config.thresholds.access = threshold;
        }
        if let Some(threshold) = seconds("KEYSTONE_SESSION_RENEW_THRESHOLD_SECS")? {
            config.thresholds.session = threshold;
        }
        if let Some(threshold) = seconds("KEYSTONE_REFRESH_RENEW_THRESHOLD_SECS")? {
            config.thresholds.refresh = threshold;
        }
        if let Some(raw) = lookup("KEYSTONE_PSEUDONYM_SALT_LEN") {
            config.pseudonym_salt_len = parse_number("KEYSTONE_PSEUDONYM_SALT_LEN", &raw)?;
        }
        config.pseudonym_ttl = seconds("KEYSTONE_PSEUDONYM_TTL_SECS")?;
        if let Some(retention) = seconds("KEYSTONE_RETENTION_SECS")? {
            config.retention = retention;
        }
        if let Some(interval) = seconds("KEYSTONE_SWEEP_INTERVAL_SECS")? {
            config.sweep_interval = interval;
        }

        if let Some(name) = lookup("KEYSTONE_ACCESS_COOKIE") {
            config.cookies.access_name = name;
        }
        if let Some(name) = lookup("KEYSTONE_REFRESH_COOKIE") {
            config.cookies.refresh_name = name;
        }
        if let Some(raw) = lookup("KEYSTONE_COOKIE_SECURE") {
            config.cookies.secure = parse_number::<bool>("KEYSTONE_COOKIE_SECURE", &raw)?;
        }

        if let Some(base) = lookup("KEYSTONE_BASE_PATH") {
            config.authz.base_path = base;
        }
        if let Some(ttl) = seconds("KEYSTONE_AUTHZ_DEFAULT_TTL_SECS")? {
            config.authz.default_ttl = ttl;
        }
        if let Some(hot) = seconds("KEYSTONE_AUTHZ_HOT_THRESHOLD_SECS")? {
            config.authz.hot_threshold = hot;
        }
        if let Some(raw) = lookup("KEYSTONE_AUTHZ_ROUTE_TTLS") {
            config.authz.routes = AuthzCacheConfig::parse_routes(&raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Either signing secret is a built-in development secret.
    pub fn uses_dev_secrets(&self) -> bool {
        self.access_secret == DEV_ACCESS_SECRET || self.refresh_secret == DEV_REFRESH_SECRET
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.access_secret.is_empty() {
            return Err(ConfigError::invalid("KEYSTONE_ACCESS_SECRET", "must not be empty"));
        }
        if self.refresh_secret.is_empty() {
            return Err(ConfigError::invalid("KEYSTONE_REFRESH_SECRET", "must not be empty"));
        }
        if self.access_secret == self.refresh_secret {
            return Err(ConfigError::invalid(
                "KEYSTONE_REFRESH_SECRET",
                "must differ from the access secret",
            ));
        }

        let positive = [
            ("KEYSTONE_ACCESS_TTL_SECS", self.access_ttl),
            ("KEYSTONE_REFRESH_TTL_SECS", self.refresh_ttl),
            ("KEYSTONE_SESSION_TTL_SECS", self.session_ttl),
            ("KEYSTONE_SWEEP_INTERVAL_SECS", self.sweep_interval),
            ("KEYSTONE_AUTHZ_DEFAULT_TTL_SECS", self.authz.default_ttl),
        ];
        for (key, value) in positive {
            if value <= Duration::zero() {
                return Err(ConfigError::invalid(key, "must be positive"));
            }
        }

        let thresholds = [
            ("KEYSTONE_ACCESS_RENEW_THRESHOLD_SECS", self.thresholds.access, self.access_ttl),
            ("KEYSTONE_SESSION_RENEW_THRESHOLD_SECS", self.thresholds.session, self.session_ttl),
            ("KEYSTONE_REFRESH_RENEW_THRESHOLD_SECS", self.thresholds.refresh, self.refresh_ttl),
        ];
        for (key, threshold, ttl) in thresholds {
            if threshold < Duration::zero() || threshold >= ttl {
                return Err(ConfigError::invalid(
                    key,
                    format!("threshold {threshold} must be smaller than the credential ttl {ttl}"),
                ));
            }
        }

        if self.pseudonym_salt_len < 8 {
            return Err(ConfigError::invalid("KEYSTONE_PSEUDONYM_SALT_LEN", "must be at least 8 bytes"));
        }
        if self.authz.hot_threshold < Duration::zero() {
            return Err(ConfigError::invalid("KEYSTONE_AUTHZ_HOT_THRESHOLD_SECS", "must not be negative"));
        }
        for route in &self.authz.routes {
            if route.ttl <= Duration::zero() {
                return Err(ConfigError::invalid(
                    "KEYSTONE_AUTHZ_ROUTE_TTLS",
                    format!("ttl for {} must be positive", route.pattern),
                ));
            }
        }

        Ok(())
    }
}

fn parse_number<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::invalid(key, format!("'{raw}': {e}")))
}
