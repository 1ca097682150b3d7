use keystone_core::SessionId;

use crate::{ClientMeta, HashedId, IssuedCredentials, PermissionSet, RenewalState, Subject};

/// Raw credentials read from the transport (cookies) for one request.
#[derive(Clone, Default)]
pub struct RequestCredentials {
    pub access: Option<String>,
    pub refresh: Option<String>,
    pub client: ClientMeta,
}

impl core::fmt::Debug for RequestCredentials {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RequestCredentials")
            .field("access", &self.access.as_ref().map(|_| "<redacted>"))
            .field("refresh", &self.refresh.as_ref().map(|_| "<redacted>"))
            .field("client", &self.client)
            .finish()
    }
}

/// Outcome of the authentication pipeline for one request.
///
/// Immutable: produced once by the pipeline and handed to route handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestAuthContext {
    subject: Subject,
    subject_pseudonym: HashedId,
    session_id: SessionId,
    permissions: PermissionSet,
    renewal: RenewalState,
    issued: IssuedCredentials,
}

impl RequestAuthContext {
    pub fn new(
        subject: Subject,
        subject_pseudonym: HashedId,
        session_id: SessionId,
        permissions: PermissionSet,
        renewal: RenewalState,
        issued: IssuedCredentials,
    ) -> Self {
        Self {
            subject,
            subject_pseudonym,
            session_id,
            permissions,
            renewal,
            issued,
        }
    }

    pub fn subject(&self) -> Subject {
        self.subject
    }

    /// Pseudonym of the employee; the only subject identifier that may be echoed.
    pub fn subject_pseudonym(&self) -> &HashedId {
        &self.subject_pseudonym
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// The permissions this request was authorized for.
    pub fn permissions(&self) -> &PermissionSet {
        &self.permissions
    }

    pub fn renewal(&self) -> RenewalState {
        self.renewal
    }

    /// Credentials minted during this request (to be set as cookies).
    pub fn issued(&self) -> &IssuedCredentials {
        &self.issued
    }
}
