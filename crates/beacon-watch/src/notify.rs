//! One-shot watch channels and the groups that fire them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

struct Signal {
    id: u64,
    fired: AtomicBool,
    notify: Notify,
}

/// A one-shot latch. Once fired it stays fired, so a waiter that was not
/// parked at the moment of the pulse still observes it.
///
/// Clones share the same channel and identity.
#[derive(Clone)]
pub struct WatchCh(Arc<Signal>);

impl WatchCh {
    pub fn new() -> Self {
        Self(Arc::new(Signal {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            fired: AtomicBool::new(false),
            notify: Notify::new(),
        }))
    }

    /// Process-unique identity of the channel.
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// Fire the channel. Never blocks; repeated calls are no-ops.
    pub fn fire(&self) {
        if !self.0.fired.swap(true, Ordering::AcqRel) {
            self.0.notify.notify_waiters();
        }
    }

    pub fn is_fired(&self) -> bool {
        self.0.fired.load(Ordering::Acquire)
    }

    /// Resolves once the channel has fired.
    pub async fn fired(&self) {
        let notified = self.0.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent fire is not lost.
        notified.as_mut().enable();
        if self.is_fired() {
            return;
        }
        notified.await;
    }
}

impl Default for WatchCh {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WatchCh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchCh")
            .field("id", &self.id())
            .field("fired", &self.is_fired())
            .finish()
    }
}

#[derive(Default)]
struct Waiters {
    chans: Vec<WatchCh>,
    shared: Option<WatchCh>,
}

/// Edge-triggered fan-out: `notify()` fires every registered channel and
/// forgets them, so callers re-register after each wake.
#[derive(Default)]
pub struct NotifyGroup {
    waiters: Mutex<Waiters>,
}

impl NotifyGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `ch` for the next notification.
    pub fn wait(&self, ch: &WatchCh) {
        let mut waiters = self.waiters.lock();
        if !waiters.chans.iter().any(|c| c.id() == ch.id()) {
            waiters.chans.push(ch.clone());
        }
    }

    /// Channel for the current generation of this group.
    ///
    /// Every subscriber between two notifications gets the same channel,
    /// which is what lets identical blocking reads share one wait.
    pub fn subscribe(&self) -> WatchCh {
        self.waiters
            .lock()
            .shared
            .get_or_insert_with(WatchCh::new)
            .clone()
    }

    /// Drop a registration without firing it.
    pub fn clear(&self, ch: &WatchCh) {
        self.waiters.lock().chans.retain(|c| c.id() != ch.id());
    }

    /// Fire and forget every registration.
    pub fn notify(&self) {
        let (chans, shared) = {
            let mut waiters = self.waiters.lock();
            (std::mem::take(&mut waiters.chans), waiters.shared.take())
        };
        for ch in chans.iter().chain(shared.iter()) {
            ch.fire();
        }
    }

    pub fn is_empty(&self) -> bool {
        let waiters = self.waiters.lock();
        waiters.chans.is_empty() && waiters.shared.is_none()
    }

    /// No registrations, and no one outside the group holds the shared
    /// channel. Such a group can be dropped without losing a wake.
    pub fn is_unused(&self) -> bool {
        let waiters = self.waiters.lock();
        waiters.chans.is_empty()
            && waiters.shared.as_ref().is_none_or(|ch| Arc::strong_count(&ch.0) == 1)
    }
}

/// An unordered set of channels waited on together.
#[derive(Clone, Default, Debug)]
pub struct WatchSet {
    chans: Vec<WatchCh>,
}

/// splitmix64 finalizer; spreads sequential ids before they are combined.
fn mix(id: u64) -> u64 {
    let mut z = id.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

impl WatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, ch: WatchCh) {
        if !self.chans.iter().any(|c| c.id() == ch.id()) {
            self.chans.push(ch);
        }
    }

    pub fn len(&self) -> usize {
        self.chans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chans.is_empty()
    }

    /// Order-independent identity of the set. Collisions are possible,
    /// compare [`WatchSet::ids`] to confirm a match.
    pub fn key(&self) -> u64 {
        self.chans.iter().fold(0, |acc, c| acc ^ mix(c.id()))
    }

    /// Sorted channel identities.
    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.chans.iter().map(WatchCh::id).collect();
        ids.sort_unstable();
        ids
    }

    pub fn any_fired(&self) -> bool {
        self.chans.iter().any(WatchCh::is_fired)
    }

    /// Resolves once any channel in the set fires. Never resolves for an
    /// empty set.
    pub async fn wait_any(&self) {
        if self.chans.is_empty() {
            return std::future::pending().await;
        }
        let waits = self.chans.iter().map(|c| Box::pin(c.fired()));
        futures::future::select_all(waits).await;
    }
}

impl FromIterator<WatchCh> for WatchSet {
    fn from_iter<I: IntoIterator<Item = WatchCh>>(iter: I) -> Self {
        let mut set = WatchSet::new();
        for ch in iter {
            set.add(ch);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn fire_is_a_sticky_latch() {
        let ch = WatchCh::new();
        assert!(!ch.is_fired());
        ch.fire();
        ch.fire();
        assert!(ch.is_fired());
        assert!(ch.clone().is_fired());
    }

    #[tokio::test]
    async fn fired_resolves_after_the_pulse() {
        let ch = WatchCh::new();
        ch.fire();
        // Fired before anyone waited; still observed.
        tokio::time::timeout(Duration::from_secs(1), ch.fired()).await.unwrap();
    }

    #[tokio::test]
    async fn notify_fires_and_clears_registrations() {
        let group = NotifyGroup::new();
        let a = WatchCh::new();
        let b = WatchCh::new();
        group.wait(&a);
        group.wait(&a);
        group.wait(&b);

        let waiter = {
            let a = a.clone();
            tokio::spawn(async move { a.fired().await })
        };
        group.notify();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(b.is_fired());
        assert!(group.is_empty());

        // Re-registration is required for the next pulse.
        let c = WatchCh::new();
        group.notify();
        assert!(!c.is_fired());
    }

    #[test]
    fn clear_drops_without_firing() {
        let group = NotifyGroup::new();
        let a = WatchCh::new();
        group.wait(&a);
        group.clear(&a);
        group.notify();
        assert!(!a.is_fired());
    }

    #[test]
    fn subscribe_shares_one_channel_per_generation() {
        let group = NotifyGroup::new();
        let first = group.subscribe();
        assert_eq!(first.id(), group.subscribe().id());
        group.notify();
        assert!(first.is_fired());
        let next = group.subscribe();
        assert_ne!(first.id(), next.id());
        assert!(!next.is_fired());
    }

    #[test]
    fn group_is_unused_once_subscribers_let_go() {
        let group = NotifyGroup::new();
        assert!(group.is_unused());

        let a = group.subscribe();
        let b = group.subscribe();
        assert!(!group.is_unused());
        drop(a);
        assert!(!group.is_unused());
        drop(b);
        assert!(group.is_unused());
        assert!(!group.is_empty());

        let ch = WatchCh::new();
        group.wait(&ch);
        drop(ch);
        assert!(!group.is_unused());
    }

    #[test]
    fn set_key_ignores_order_and_duplicates() {
        let a = WatchCh::new();
        let b = WatchCh::new();
        let ab: WatchSet = [a.clone(), b.clone()].into_iter().collect();
        let ba: WatchSet = [b.clone(), a.clone(), b.clone()].into_iter().collect();
        assert_eq!(ab.key(), ba.key());
        assert_eq!(ab.ids(), ba.ids());
        assert_eq!(ba.len(), 2);

        let only_a: WatchSet = [a].into_iter().collect();
        assert_ne!(only_a.key(), ab.key());
    }

    #[tokio::test]
    async fn wait_any_wakes_on_any_member() {
        let set: WatchSet = (0..40).map(|_| WatchCh::new()).collect();
        let last = set.chans[39].clone();
        let waiter = {
            let set = set.clone();
            tokio::spawn(async move { set.wait_any().await })
        };
        tokio::task::yield_now().await;
        last.fire();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(set.any_fired());
    }
}
