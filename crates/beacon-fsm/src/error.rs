//! Error types for the Beacon FSM.

use beacon_state::StateError;
use thiserror::Error;

pub type FsmResult<T> = Result<T, FsmError>;

/// Errors that stop an apply, a snapshot or a restore. Invariant
/// violations are not among them: they are reported in the
/// [`ApplyResponse`](crate::ApplyResponse) instead.
#[derive(Debug, Error)]
pub enum FsmError {
    #[error("cannot decode log entry {index}: {reason}")]
    Decode { index: u64, reason: String },

    #[error(transparent)]
    State(#[from] StateError),

    #[error("snapshot I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed snapshot: {0}")]
    Snapshot(String),
}
