//! HTTP API: cookie transport, the authentication middleware and the
//! session routes.

pub mod app;
pub mod cookies;
pub mod middleware;
