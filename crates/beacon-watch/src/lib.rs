//! beacon-watch — change notification for blocking reads.
//!
//! A [`WatchCh`] is a one-shot latch. A [`NotifyGroup`] fans a single
//! `notify()` out to every registered channel without blocking. A
//! [`WatchPool`] lets any number of callers wait on the same
//! [`WatchSet`] while only one of them performs the real wait.

pub mod notify;
pub mod pool;

pub use notify::{NotifyGroup, WatchCh, WatchSet};
pub use pool::WatchPool;

use thiserror::Error;

/// Errors returned by watch operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WatchError {
    #[error("watch cancelled")]
    Cancelled,
}
