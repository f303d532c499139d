//! Blocking queries: re-run a read until its index moves past the
//! caller's, the query times out, or the caller gives up.

use std::time::Duration;

use beacon_watch::WatchError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::StateResult;
use crate::store::StateStore;
use crate::watch::WatchTarget;

/// Blocking parameters of a read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Return as soon as the result's index exceeds this. Zero means do
    /// not block.
    pub min_index: u64,
    /// Longest wait. Zero means the configured default; larger values
    /// are clamped to the configured maximum.
    pub max_query_time: Duration,
}

impl StateStore {
    /// Run `query`, blocking until its index passes `opts.min_index`.
    ///
    /// The watch channels are taken before each run so a write landing
    /// between the read and the wait still wakes it. On timeout or
    /// cancellation the query runs one last time and its result is
    /// returned as is.
    pub async fn blocking_query<T, F>(
        &self,
        ctx: &CancellationToken,
        targets: &[WatchTarget],
        opts: &QueryOptions,
        mut query: F,
    ) -> StateResult<(u64, T)>
    where
        F: FnMut(&StateStore) -> StateResult<(u64, T)>,
    {
        if opts.min_index == 0 {
            return query(self);
        }

        let deadline = Instant::now() + self.limits().clamp_query_time(opts.max_query_time);
        loop {
            let set = self.watch_set(targets)?;
            let (index, data) = query(self)?;
            if index > opts.min_index {
                return Ok((index, data));
            }
            trace!(index, min_index = opts.min_index, watches = set.len(), "blocking query parked");

            let woke = tokio::select! {
                woke = self.watch_pool().watch(ctx, &set) => match woke {
                    Ok(()) => true,
                    Err(WatchError::Cancelled) => false,
                },
                _ = tokio::time::sleep_until(deadline) => false,
            };
            if woke {
                continue;
            }

            // Prefixes nobody wrote to would otherwise keep their group.
            drop(set);
            for target in targets {
                if let WatchTarget::KvPrefix(prefix) = target {
                    self.kv_watch().release(prefix);
                }
            }
            return query(self);
        }
    }
}
