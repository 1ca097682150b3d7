//! Route patterns for authorization TTL lookup.
//!
//! Pattern syntax:
//! - literal segments match themselves (`/employees`)
//! - `:name` matches exactly one non-empty segment (`/employees/:id`)
//! - a trailing `*` matches any remainder, including nothing (`/admin/*`)

use serde::{Deserialize, Serialize};

use keystone_core::DomainError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Segment {
    Literal(String),
    Param(String),
    Rest,
}

/// A parsed route pattern. Equality and hashing use the normalized source text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoutePattern {
    source: String,
    segments: Vec<Segment>,
}

impl RoutePattern {
    pub fn parse(pattern: &str) -> Result<Self, DomainError> {
        let trimmed = pattern.trim();
        if !trimmed.starts_with('/') {
            return Err(DomainError::validation(format!(
                "route pattern must start with '/': {trimmed}"
            )));
        }

        let raw: Vec<&str> = split_segments(trimmed).collect();
        let mut segments = Vec::with_capacity(raw.len());
        for (idx, seg) in raw.iter().enumerate() {
            let parsed = if *seg == "*" {
                if idx + 1 != raw.len() {
                    return Err(DomainError::validation(format!(
                        "wildcard must be the last segment: {trimmed}"
                    )));
                }
                Segment::Rest
            } else if let Some(name) = seg.strip_prefix(':') {
                if name.is_empty() {
                    return Err(DomainError::validation(format!(
                        "unnamed route parameter: {trimmed}"
                    )));
                }
                Segment::Param(name.to_string())
            } else {
                Segment::Literal((*seg).to_string())
            };
            segments.push(parsed);
        }

        Ok(Self {
            source: normalize(&raw),
            segments,
        })
    }

    /// A pattern that matches exactly one concrete path.
    pub fn exact(path: &str) -> Self {
        let raw: Vec<&str> = split_segments(path).collect();
        Self {
            source: normalize(&raw),
            segments: raw
                .into_iter()
                .map(|s| Segment::Literal(s.to_string()))
                .collect(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, path: &str) -> bool {
        let mut parts = split_segments(path);
        for segment in &self.segments {
            match segment {
                Segment::Rest => return true,
                Segment::Param(_) => {
                    if parts.next().is_none() {
                        return false;
                    }
                }
                Segment::Literal(lit) => match parts.next() {
                    Some(part) if part == lit => {}
                    _ => return false,
                },
            }
        }
        parts.next().is_none()
    }
}

impl core::fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.source)
    }
}

impl TryFrom<String> for RoutePattern {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RoutePattern> for String {
    fn from(value: RoutePattern) -> Self {
        value.source
    }
}

/// Strip the configured API base path from a request path.
///
/// Paths outside the base path are returned unchanged (normalized), so they can
/// still match absolute patterns.
pub fn strip_base_path(path: &str, base_path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let base: Vec<&str> = split_segments(base_path).collect();
    let parts: Vec<&str> = split_segments(path).collect();

    if !base.is_empty() && parts.len() >= base.len() && parts[..base.len()] == base[..] {
        normalize(&parts[base.len()..])
    } else {
        normalize(&parts)
    }
}

fn split_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

fn normalize(segments: &[&str]) -> String {
    format!("/{}", segments.join("/"))
}
