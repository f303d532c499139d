// Every openraft storage method returns the large StorageError by value.
#![allow(clippy::result_large_err)]

//! beacon-fsm — turns committed log entries into state store writes.
//!
//! - **`command`** — the replicated payloads and their responses
//! - **`fsm`** — deterministic apply, leader-side admission, snapshots
//! - **`raft`** — openraft `RaftStateMachine` over the FSM

pub mod command;
pub mod error;
pub mod fsm;
pub mod raft;

pub use command::{AclOp, ApplyResponse, Command, SessionOp};
pub use error::{FsmError, FsmResult};
pub use fsm::{Admission, Fsm};
pub use raft::{BeaconRaft, StateMachine, TypeConfig};
