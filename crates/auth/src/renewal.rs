//! Renewal classification (pure state machine).
//!
//! Given where the access credential, the session and the refresh credential
//! stand relative to their renewal thresholds, decide which of the five
//! renewal states a request is in and which writes the orchestrator must
//! perform. No IO; the orchestrator in `keystone-infra` executes the plan.
//!
//! ```text
//!                     session Fresh      session Near        session Expired
//! access Fresh        Valid              SessionNearExpiry   BothNearExpiry (rotate)
//! access Near/Exp.    AccessNearExpiry   BothNearExpiry      BothNearExpiry (rotate)
//! ```
//!
//! A refresh credential inside its own threshold relabels the request
//! `RefreshNearExpiry` and adds a refresh rotation on top of the above.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::AuthError;

/// Renewal thresholds. Each must be smaller than its credential's TTL.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RenewalThresholds {
    pub access: Duration,
    pub session: Duration,
    pub refresh: Duration,
}

impl Default for RenewalThresholds {
    fn default() -> Self {
        Self {
            access: Duration::minutes(2),
            session: Duration::minutes(30),
            refresh: Duration::days(1),
        }
    }
}

/// Position of an expiring artifact relative to its threshold.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Phase {
    Fresh,
    NearExpiry,
    Expired,
}

pub fn phase_of(expires_at: DateTime<Utc>, threshold: Duration, now: DateTime<Utc>) -> Phase {
    if expires_at <= now {
        Phase::Expired
    } else if expires_at - now <= threshold {
        Phase::NearExpiry
    } else {
        Phase::Fresh
    }
}

/// What is known about the refresh credential presented with the request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RefreshPhase {
    /// No refresh credential was presented.
    Absent,
    Fresh,
    NearExpiry,
    /// Presented but expired, revoked, or otherwise invalid.
    Unusable,
}

impl RefreshPhase {
    pub fn from_phase(phase: Phase) -> Self {
        match phase {
            Phase::Fresh => RefreshPhase::Fresh,
            Phase::NearExpiry => RefreshPhase::NearExpiry,
            Phase::Expired => RefreshPhase::Unusable,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenewalState {
    Valid,
    AccessNearExpiry,
    SessionNearExpiry,
    BothNearExpiry,
    RefreshNearExpiry,
}

impl RenewalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenewalState::Valid => "valid",
            RenewalState::AccessNearExpiry => "access_near_expiry",
            RenewalState::SessionNearExpiry => "session_near_expiry",
            RenewalState::BothNearExpiry => "both_near_expiry",
            RenewalState::RefreshNearExpiry => "refresh_near_expiry",
        }
    }
}

impl core::fmt::Display for RenewalState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Writes the orchestrator must perform for a classification.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct RenewalActions {
    /// Mint a new access credential.
    pub renew_access: bool,
    /// Push the session's `expires_at` forward.
    pub extend_session: bool,
    /// Revoke the current session and create a new one.
    pub rotate_session: bool,
    /// Mint a new refresh credential and revoke the presented one.
    pub rotate_refresh: bool,
}

impl RenewalActions {
    pub fn any(&self) -> bool {
        self.renew_access || self.extend_session || self.rotate_session || self.rotate_refresh
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Classification {
    pub state: RenewalState,
    pub actions: RenewalActions,
}

impl Classification {
    pub fn valid() -> Self {
        Self {
            state: RenewalState::Valid,
            actions: RenewalActions::default(),
        }
    }
}

/// Classify a request.
///
/// Fails closed with `ReauthenticationRequired` when a presented refresh
/// credential is unusable, or when renewal is needed and no refresh
/// credential was presented.
pub fn classify(
    access: Phase,
    session: Phase,
    refresh: RefreshPhase,
) -> Result<Classification, AuthError> {
    if refresh == RefreshPhase::Unusable {
        return Err(AuthError::ReauthenticationRequired);
    }

    let mut actions = RenewalActions::default();
    let mut state = match (access, session) {
        (_, Phase::Expired) => {
            actions.renew_access = true;
            actions.rotate_session = true;
            RenewalState::BothNearExpiry
        }
        (Phase::Fresh, Phase::Fresh) => RenewalState::Valid,
        (Phase::Fresh, Phase::NearExpiry) => {
            actions.extend_session = true;
            RenewalState::SessionNearExpiry
        }
        (Phase::NearExpiry | Phase::Expired, Phase::Fresh) => {
            actions.renew_access = true;
            RenewalState::AccessNearExpiry
        }
        (Phase::NearExpiry | Phase::Expired, Phase::NearExpiry) => {
            actions.renew_access = true;
            actions.extend_session = true;
            RenewalState::BothNearExpiry
        }
    };

    match refresh {
        RefreshPhase::NearExpiry => {
            actions.rotate_refresh = true;
            state = RenewalState::RefreshNearExpiry;
        }
        RefreshPhase::Absent if actions.any() => return Err(AuthError::ReauthenticationRequired),
        _ => {}
    }

    Ok(Classification { state, actions })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn phase() -> impl Strategy<Value = Phase> {
        prop_oneof![Just(Phase::Fresh), Just(Phase::NearExpiry), Just(Phase::Expired)]
    }

    #[test]
    fn phase_boundaries() {
        let now = Utc::now();
        let t = Duration::minutes(2);
        assert_eq!(phase_of(now, t, now), Phase::Expired);
        assert_eq!(phase_of(now + t, t, now), Phase::NearExpiry);
        assert_eq!(phase_of(now + t + Duration::seconds(1), t, now), Phase::Fresh);
    }

    #[test]
    fn table_rows() {
        let c = classify(Phase::Fresh, Phase::Fresh, RefreshPhase::Fresh).unwrap();
        assert_eq!(c, Classification::valid());

        let c = classify(Phase::NearExpiry, Phase::Fresh, RefreshPhase::Fresh).unwrap();
        assert_eq!(c.state, RenewalState::AccessNearExpiry);
        assert!(c.actions.renew_access && !c.actions.extend_session);

        let c = classify(Phase::Fresh, Phase::NearExpiry, RefreshPhase::Fresh).unwrap();
        assert_eq!(c.state, RenewalState::SessionNearExpiry);
        assert!(!c.actions.renew_access && c.actions.extend_session);

        let c = classify(Phase::Expired, Phase::NearExpiry, RefreshPhase::Fresh).unwrap();
        assert_eq!(c.state, RenewalState::BothNearExpiry);
        assert!(c.actions.renew_access && c.actions.extend_session && !c.actions.rotate_session);

        let c = classify(Phase::Expired, Phase::Expired, RefreshPhase::Fresh).unwrap();
        assert_eq!(c.state, RenewalState::BothNearExpiry);
        assert!(c.actions.renew_access && c.actions.rotate_session);
    }

    #[test]
    fn refresh_near_expiry_is_additive() {
        let c = classify(Phase::Fresh, Phase::Fresh, RefreshPhase::NearExpiry).unwrap();
        assert_eq!(c.state, RenewalState::RefreshNearExpiry);
        assert_eq!(
            c.actions,
            RenewalActions {
                rotate_refresh: true,
                ..RenewalActions::default()
            }
        );

        let c = classify(Phase::NearExpiry, Phase::Fresh, RefreshPhase::NearExpiry).unwrap();
        assert_eq!(c.state, RenewalState::RefreshNearExpiry);
        assert!(c.actions.renew_access && c.actions.rotate_refresh);
    }

    #[test]
    fn absent_refresh_only_passes_valid_requests() {
        assert_eq!(
            classify(Phase::Fresh, Phase::Fresh, RefreshPhase::Absent).unwrap(),
            Classification::valid()
        );
        assert_eq!(
            classify(Phase::NearExpiry, Phase::Fresh, RefreshPhase::Absent),
            Err(AuthError::ReauthenticationRequired)
        );
    }

    #[test]
    fn unusable_refresh_blocks_even_fresh_access() {
        assert_eq!(
            classify(Phase::Fresh, Phase::Fresh, RefreshPhase::Unusable),
            Err(AuthError::ReauthenticationRequired)
        );
    }

    proptest! {
        #[test]
        fn expired_access_is_never_valid(session in phase()) {
            match classify(Phase::Expired, session, RefreshPhase::Fresh) {
                Ok(c) => {
                    prop_assert_ne!(c.state, RenewalState::Valid);
                    prop_assert!(c.actions.renew_access);
                }
                Err(e) => prop_assert!(false, "unexpected error {e}"),
            }
        }

        #[test]
        fn valid_state_means_no_writes(access in phase(), session in phase()) {
            if let Ok(c) = classify(access, session, RefreshPhase::Fresh) {
                prop_assert_eq!(c.state == RenewalState::Valid, !c.actions.any());
            }
        }
    }
}
