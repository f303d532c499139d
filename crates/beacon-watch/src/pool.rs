//! WatchPool — shares one real wait among callers watching the same set.
//!
//! The first caller for a set becomes the leader and waits on the
//! channels. Everyone else with the identical set parks on the entry's
//! `done` token. When the leader's own context ends first, one parked
//! follower is promoted through a single permit, so the real wait is
//! never duplicated and never abandoned while watchers remain.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::WatchError;
use crate::notify::WatchSet;

struct Shared {
    ids: Vec<u64>,
    done: CancellationToken,
    handoff: Semaphore,
}

struct Slot {
    shared: Arc<Shared>,
    refs: usize,
}

/// De-duplicating scheduler for blocking watches.
#[derive(Default)]
pub struct WatchPool {
    entries: Mutex<HashMap<u64, Slot>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

enum Join {
    Shared(Arc<Shared>, bool),
    Collision,
}

impl WatchPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until any channel in `set` fires or `ctx` is cancelled.
    pub async fn watch(&self, ctx: &CancellationToken, set: &WatchSet) -> Result<(), WatchError> {
        if set.is_empty() {
            ctx.cancelled().await;
            return Err(WatchError::Cancelled);
        }
        if set.any_fired() {
            return Ok(());
        }

        let key = set.key();
        let (shared, leader) = match self.join(key, set) {
            Join::Shared(shared, leader) => (shared, leader),
            Join::Collision => {
                trace!(key, "watch key collision, waiting unshared");
                return self.wait_direct(ctx, set).await;
            }
        };
        let mut member = Member {
            pool: self,
            key,
            shared: shared.clone(),
            leader,
        };

        loop {
            if member.leader {
                let _active = ActiveWait::enter(self);
                tokio::select! {
                    biased;
                    _ = ctx.cancelled() => return Err(WatchError::Cancelled),
                    _ = set.wait_any() => {
                        shared.done.cancel();
                        self.retire(key, &shared);
                        return Ok(());
                    }
                }
            }

            tokio::select! {
                biased;
                _ = shared.done.cancelled() => return Ok(()),
                permit = shared.handoff.acquire() => match permit {
                    Ok(permit) => {
                        permit.forget();
                        member.leader = true;
                        debug!(key, "watch leadership handed off");
                    }
                    Err(_) => return Err(WatchError::Cancelled),
                },
                _ = ctx.cancelled() => return Err(WatchError::Cancelled),
            }
        }
    }

    /// Number of real waits in progress.
    pub fn active_waits(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous real waits observed.
    pub fn peak_active_waits(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Number of distinct watch sets currently shared.
    pub fn shared_entries(&self) -> usize {
        self.entries.lock().len()
    }

    fn join(&self, key: u64, set: &WatchSet) -> Join {
        let ids = set.ids();
        let mut entries = self.entries.lock();
        match entries.get_mut(&key) {
            Some(slot) if slot.shared.ids == ids => {
                slot.refs += 1;
                Join::Shared(slot.shared.clone(), false)
            }
            Some(_) => Join::Collision,
            None => {
                let shared = Arc::new(Shared {
                    ids,
                    done: CancellationToken::new(),
                    handoff: Semaphore::new(0),
                });
                entries.insert(
                    key,
                    Slot {
                        shared: shared.clone(),
                        refs: 1,
                    },
                );
                trace!(key, "watch entry created");
                Join::Shared(shared, true)
            }
        }
    }

    /// Drop one reference. A departing leader hands its wait to a
    /// follower if any remain.
    fn leave(&self, key: u64, shared: &Arc<Shared>, leader: bool) {
        let mut entries = self.entries.lock();
        let Some(slot) = entries.get_mut(&key) else {
            return;
        };
        if !Arc::ptr_eq(&slot.shared, shared) {
            return;
        }
        slot.refs -= 1;
        if slot.refs == 0 {
            entries.remove(&key);
            trace!(key, "watch entry retired, no watchers left");
        } else if leader && !shared.done.is_cancelled() {
            shared.handoff.add_permits(1);
        }
    }

    fn retire(&self, key: u64, shared: &Arc<Shared>) {
        let mut entries = self.entries.lock();
        if entries.get(&key).is_some_and(|slot| Arc::ptr_eq(&slot.shared, shared)) {
            entries.remove(&key);
        }
    }

    async fn wait_direct(&self, ctx: &CancellationToken, set: &WatchSet) -> Result<(), WatchError> {
        let _active = ActiveWait::enter(self);
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(WatchError::Cancelled),
            _ = set.wait_any() => Ok(()),
        }
    }
}

/// Membership in a shared entry. Leaving on drop keeps the reference
/// count right when a watch future is dropped mid-wait.
struct Member<'a> {
    pool: &'a WatchPool,
    key: u64,
    shared: Arc<Shared>,
    leader: bool,
}

impl Drop for Member<'_> {
    fn drop(&mut self) {
        self.pool.leave(self.key, &self.shared, self.leader);
    }
}

struct ActiveWait<'a>(&'a WatchPool);

impl<'a> ActiveWait<'a> {
    fn enter(pool: &'a WatchPool) -> Self {
        let now = pool.active.fetch_add(1, Ordering::SeqCst) + 1;
        pool.peak.fetch_max(now, Ordering::SeqCst);
        Self(pool)
    }
}

impl Drop for ActiveWait<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::notify::WatchCh;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn thousand_identical_watches_share_one_wait() {
        let pool = Arc::new(WatchPool::new());
        let ch = WatchCh::new();
        let set: WatchSet = [ch.clone(), WatchCh::new()].into_iter().collect();
        let ctx = CancellationToken::new();

        let mut handles = Vec::new();
        for _ in 0..1000 {
            let pool = pool.clone();
            let set = set.clone();
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move { pool.watch(&ctx, &set).await }));
        }
        settle().await;
        assert_eq!(pool.active_waits(), 1);
        assert_eq!(pool.shared_entries(), 1);

        ch.fire();
        for h in handles {
            assert_eq!(h.await.unwrap(), Ok(()));
        }
        assert!(pool.peak_active_waits() <= 1);
        assert_eq!(pool.active_waits(), 0);
        assert_eq!(pool.shared_entries(), 0);
    }

    #[tokio::test]
    async fn leader_cancellation_hands_off_to_follower() {
        let pool = Arc::new(WatchPool::new());
        let ch = WatchCh::new();
        let set: WatchSet = [ch.clone()].into_iter().collect();

        let leader_ctx = CancellationToken::new();
        let leader = {
            let (pool, set, ctx) = (pool.clone(), set.clone(), leader_ctx.clone());
            tokio::spawn(async move { pool.watch(&ctx, &set).await })
        };
        settle().await;
        let follower = {
            let (pool, set) = (pool.clone(), set.clone());
            tokio::spawn(async move { pool.watch(&CancellationToken::new(), &set).await })
        };
        settle().await;

        leader_ctx.cancel();
        assert_eq!(leader.await.unwrap(), Err(WatchError::Cancelled));
        settle().await;
        // The follower took over the real wait.
        assert_eq!(pool.active_waits(), 1);
        assert_eq!(pool.shared_entries(), 1);

        ch.fire();
        assert_eq!(follower.await.unwrap(), Ok(()));
        assert_eq!(pool.peak_active_waits(), 1);
    }

    #[tokio::test]
    async fn last_departure_retires_entry() {
        let pool = Arc::new(WatchPool::new());
        let set: WatchSet = [WatchCh::new()].into_iter().collect();
        let ctx = CancellationToken::new();

        let a = {
            let (pool, set, ctx) = (pool.clone(), set.clone(), ctx.clone());
            tokio::spawn(async move { pool.watch(&ctx, &set).await })
        };
        let b = {
            let (pool, set) = (pool.clone(), set.clone());
            tokio::spawn(async move { pool.watch(&CancellationToken::new(), &set).await })
        };
        settle().await;
        assert_eq!(pool.shared_entries(), 1);

        // A dropped watch future leaves like a cancelled one.
        b.abort();
        let _ = b.await;
        ctx.cancel();
        assert_eq!(a.await.unwrap(), Err(WatchError::Cancelled));
        assert_eq!(pool.shared_entries(), 0);
        assert_eq!(pool.active_waits(), 0);
    }

    #[tokio::test]
    async fn fired_set_returns_immediately() {
        let pool = WatchPool::new();
        let ch = WatchCh::new();
        ch.fire();
        let set: WatchSet = [ch].into_iter().collect();
        assert_eq!(pool.watch(&CancellationToken::new(), &set).await, Ok(()));
        assert_eq!(pool.shared_entries(), 0);
    }

    #[tokio::test]
    async fn empty_set_waits_for_cancellation() {
        let pool = WatchPool::new();
        let ctx = CancellationToken::new();
        ctx.cancel();
        assert_eq!(pool.watch(&ctx, &WatchSet::new()).await, Err(WatchError::Cancelled));
    }

    #[tokio::test]
    async fn distinct_sets_wait_independently() {
        let pool = Arc::new(WatchPool::new());
        let a = WatchCh::new();
        let b = WatchCh::new();
        let wa = {
            let (pool, set) = (pool.clone(), [a.clone()].into_iter().collect::<WatchSet>());
            tokio::spawn(async move { pool.watch(&CancellationToken::new(), &set).await })
        };
        let wb = {
            let (pool, set) = (pool.clone(), [b.clone()].into_iter().collect::<WatchSet>());
            tokio::spawn(async move { pool.watch(&CancellationToken::new(), &set).await })
        };
        settle().await;
        assert_eq!(pool.shared_entries(), 2);
        assert_eq!(pool.active_waits(), 2);

        a.fire();
        assert_eq!(wa.await.unwrap(), Ok(()));
        assert!(!wb.is_finished());
        b.fire();
        assert_eq!(wb.await.unwrap(), Ok(()));
    }
}
