//! Error types for the Beacon state store.

use std::time::Duration;

use beacon_table::TableError;
use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error(transparent)]
    Table(#[from] TableError),

    #[error("missing node registration: {0}")]
    MissingNode(String),

    #[error("missing service registration: {0}")]
    MissingService(String),

    #[error("missing check registration: {0}")]
    MissingCheck(String),

    #[error("check {0} is in critical state")]
    CheckCritical(String),

    #[error("missing session ID")]
    MissingSessionId,

    #[error("session TTL {ttl:?} exceeds the maximum of {max:?}")]
    SessionTtlTooLong { ttl: Duration, max: Duration },

    #[error("lock request on key {0} carries no session")]
    MissingLockSession(String),

    #[error("missing ACL ID")]
    MissingAclId,

    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl StateError {
    /// Whether the error is a deterministic consequence of the request and
    /// the current rows. Every replica applying the same entry computes
    /// the same one, so it is reported to the caller instead of failing
    /// the apply.
    pub fn is_invariant_violation(&self) -> bool {
        match self {
            StateError::Table(e) => e.is_constraint(),
            StateError::MissingNode(_)
            | StateError::MissingService(_)
            | StateError::MissingCheck(_)
            | StateError::CheckCritical(_)
            | StateError::MissingSessionId
            | StateError::SessionTtlTooLong { .. }
            | StateError::MissingLockSession(_)
            | StateError::MissingAclId => true,
            StateError::UnknownTable(_) | StateError::Config(_) => false,
        }
    }
}
