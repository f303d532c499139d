//! TombstoneGc — decides when tombstones are old enough to reap.
//!
//! Hints are grouped into fixed windows of `granularity` so a burst of
//! deletes shares one timer. When a window's deadline passes, its highest
//! hinted index is emitted; the leader turns it into a reap entry in the
//! log. Runs on the leader only.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{StateError, StateResult};

struct Bucket {
    max_index: u64,
    timer: JoinHandle<()>,
}

struct GcState {
    enabled: bool,
    runtime: Option<Handle>,
    buckets: HashMap<u64, Bucket>,
}

pub struct TombstoneGc {
    ttl: Duration,
    granularity: Duration,
    epoch: Instant,
    state: Arc<Mutex<GcState>>,
    expired_tx: mpsc::UnboundedSender<u64>,
    expired_rx: Mutex<Option<mpsc::UnboundedReceiver<u64>>>,
}

impl TombstoneGc {
    pub fn new(ttl: Duration, granularity: Duration) -> StateResult<Self> {
        if ttl.is_zero() || granularity.is_zero() {
            return Err(StateError::Config(
                "tombstone TTL and granularity must be positive".into(),
            ));
        }
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        Ok(Self {
            ttl,
            granularity,
            epoch: Instant::now(),
            state: Arc::new(Mutex::new(GcState {
                enabled: false,
                runtime: None,
                buckets: HashMap::new(),
            })),
            expired_tx,
            expired_rx: Mutex::new(Some(expired_rx)),
        })
    }

    /// Turn GC on (on gaining leadership) or off. Disabling drops every
    /// pending window.
    ///
    /// Enabling needs a Tokio runtime to run the timers on; without one
    /// GC stays off.
    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.state.lock();
        if state.enabled == enabled {
            return;
        }
        if enabled {
            match Handle::try_current() {
                Ok(handle) => state.runtime = Some(handle),
                Err(_) => {
                    warn!("tombstone GC needs a runtime; staying disabled");
                    return;
                }
            }
        } else {
            for (_, bucket) in state.buckets.drain() {
                bucket.timer.abort();
            }
            state.runtime = None;
        }
        state.enabled = enabled;
        info!(enabled, "tombstone GC toggled");
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// Record that tombstones up to `index` exist. No-op while disabled.
    pub fn hint(&self, index: u64) {
        let mut state = self.state.lock();
        if !state.enabled {
            return;
        }
        let Some(runtime) = state.runtime.clone() else {
            return;
        };

        let (bucket, fire_at) = self.bucket_for(Instant::now() + self.ttl);
        if let Some(existing) = state.buckets.get_mut(&bucket) {
            existing.max_index = existing.max_index.max(index);
            return;
        }

        let shared = self.state.clone();
        let tx = self.expired_tx.clone();
        let timer = runtime.spawn(async move {
            tokio::time::sleep_until(fire_at).await;
            let expired = shared.lock().buckets.remove(&bucket).map(|b| b.max_index);
            if let Some(index) = expired {
                debug!(index, "tombstone window expired");
                let _ = tx.send(index);
            }
        });
        state.buckets.insert(
            bucket,
            Bucket {
                max_index: index,
                timer,
            },
        );
    }

    /// Whether any window is still waiting to expire.
    pub fn pending_expiration(&self) -> bool {
        !self.state.lock().buckets.is_empty()
    }

    /// Receiver of expired reap indexes. Handed out once.
    pub fn take_expired(&self) -> Option<mpsc::UnboundedReceiver<u64>> {
        self.expired_rx.lock().take()
    }

    /// Window containing `deadline`, and the instant the window ends.
    fn bucket_for(&self, deadline: Instant) -> (u64, Instant) {
        let gran = self.granularity.as_nanos().max(1);
        let offset = deadline.duration_since(self.epoch).as_nanos();
        let bucket = offset / gran + 1;
        let end = u64::try_from(bucket * gran).unwrap_or(u64::MAX);
        (
            u64::try_from(bucket).unwrap_or(u64::MAX),
            self.epoch + Duration::from_nanos(end),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_durations() {
        assert!(TombstoneGc::new(Duration::ZERO, Duration::from_millis(5)).is_err());
        assert!(TombstoneGc::new(Duration::from_secs(1), Duration::ZERO).is_err());
    }

    #[test]
    fn hint_is_a_noop_while_disabled() {
        let gc = TombstoneGc::new(Duration::from_secs(1), Duration::from_millis(5)).unwrap();
        gc.hint(10);
        assert!(!gc.pending_expiration());
    }

    #[tokio::test(start_paused = true)]
    async fn coalesces_hints_into_one_window() {
        let gc = TombstoneGc::new(Duration::from_secs(10), Duration::from_secs(1)).unwrap();
        let mut expired = gc.take_expired().unwrap();
        assert!(gc.take_expired().is_none());
        gc.set_enabled(true);

        gc.hint(100);
        gc.hint(120);
        gc.hint(110);
        assert!(gc.pending_expiration());

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(expired.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(expired.recv().await, Some(120));
        assert!(!gc.pending_expiration());
    }

    #[tokio::test(start_paused = true)]
    async fn separate_windows_expire_in_order() {
        let gc = TombstoneGc::new(Duration::from_secs(10), Duration::from_secs(1)).unwrap();
        let mut expired = gc.take_expired().unwrap();
        gc.set_enabled(true);

        gc.hint(1);
        tokio::time::sleep(Duration::from_secs(5)).await;
        gc.hint(2);

        assert_eq!(expired.recv().await, Some(1));
        assert_eq!(expired.recv().await, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn disabling_drops_pending_windows() {
        let gc = TombstoneGc::new(Duration::from_secs(10), Duration::from_secs(1)).unwrap();
        let mut expired = gc.take_expired().unwrap();
        gc.set_enabled(true);
        gc.hint(7);
        gc.set_enabled(false);
        assert!(!gc.pending_expiration());

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(expired.try_recv().is_err());
        gc.hint(8);
        assert!(!gc.pending_expiration());
    }
}
