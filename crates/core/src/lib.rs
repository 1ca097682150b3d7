//! `keystone-core`: identity and concurrency primitives shared by every layer.
//!
//! This crate contains **pure** building blocks (no IO, no async).

pub mod clock;
pub mod error;
pub mod id;
pub mod version;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{CredentialId, EmployeeId, RoleId, SessionId};
pub use version::{ExpectedVersion, Version};
