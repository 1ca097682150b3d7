//! `keystone-auth`: pure authentication and authorization domain.
//!
//! This crate is intentionally decoupled from HTTP and storage: it defines the
//! records, claims, error taxonomy and the renewal state machine. Everything
//! that touches a database, a signing key or the clock's wall time lives in
//! `keystone-infra`.

pub mod audit;
pub mod authorize;
pub mod claims;
pub mod context;
pub mod credential;
pub mod error;
pub mod permissions;
pub mod pseudonym;
pub mod renewal;
pub mod routes;
pub mod session;
pub mod subject;

pub use audit::{AuditRecord, AuditSink};
pub use authorize::{AuthorizationExplanation, authorize, explain_authorization};
pub use claims::{CredentialClaims, CredentialKind, TokenValidationError, validate_claims};
pub use context::{RequestAuthContext, RequestCredentials};
pub use credential::{CredentialRecord, IssuedCredentials, IssuedToken};
pub use error::{AuthError, AuthResult, Disposition};
pub use permissions::{Permission, PermissionSet};
pub use pseudonym::{EntityClass, HashedId, IdentityPseudonym, Pseudonym};
pub use renewal::{
    Classification, Phase, RefreshPhase, RenewalActions, RenewalState, RenewalThresholds,
    classify, phase_of,
};
pub use routes::{RoutePattern, strip_base_path};
pub use session::{ClientMeta, Session, SessionPatch, SessionStatus};
pub use subject::Subject;
