//! beacon-state — the replicated service-discovery state.
//!
//! Nodes, services, health checks, KV entries, sessions and ACLs live in
//! typed tables on top of `beacon-table`. Every write is applied at a log
//! index and publishes change notifications after it commits; reads
//! return the index they are current as of and can block until it moves.

pub mod blocking;
pub mod config;
pub mod error;
pub mod lock_delay;
pub mod session_ttl;
pub mod store;
pub mod tables;
pub mod tombstone_gc;
pub mod types;
pub mod watch;

pub use blocking::QueryOptions;
pub use config::{StoreConfig, StoreLimits, parse_duration};
pub use error::{StateError, StateResult};
pub use store::{StateRestore, StateSnapshot, StateStore};
pub use tables::{ACLS, ALL_TABLES, CHECKS, KVS, NODES, SERVICES, SESSION_CHECKS, SESSIONS, TOMBSTONES};
pub use types::*;
pub use watch::WatchTarget;
