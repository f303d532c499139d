//! Session TTL timers. Leader-only: a session whose timer fires is
//! reported so the leader can destroy it through the log.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::types::Session;

struct Timer {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct TimerState {
    enabled: bool,
    runtime: Option<Handle>,
    next_generation: u64,
    timers: HashMap<String, Timer>,
}

pub struct SessionTimers {
    multiplier: u32,
    state: Arc<Mutex<TimerState>>,
    expired_tx: mpsc::UnboundedSender<String>,
    expired_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl SessionTimers {
    pub fn new(multiplier: u32) -> Self {
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        Self {
            multiplier: multiplier.max(1),
            state: Arc::new(Mutex::new(TimerState::default())),
            expired_tx,
            expired_rx: Mutex::new(Some(expired_rx)),
        }
    }

    /// Turn timers on or off. Disabling cancels every timer.
    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.state.lock();
        if state.enabled == enabled {
            return;
        }
        if enabled {
            match Handle::try_current() {
                Ok(handle) => state.runtime = Some(handle),
                Err(_) => {
                    warn!("session timers need a runtime; staying disabled");
                    return;
                }
            }
        } else {
            for (_, timer) in state.timers.drain() {
                timer.handle.abort();
            }
            state.runtime = None;
        }
        state.enabled = enabled;
        info!(enabled, "session timers toggled");
    }

    /// Arm (or re-arm) the timer of session `id`.
    pub fn reset(&self, id: &str, ttl: Duration) {
        let mut state = self.state.lock();
        if !state.enabled {
            return;
        }
        let Some(runtime) = state.runtime.clone() else {
            return;
        };

        state.next_generation += 1;
        let generation = state.next_generation;
        let wait = ttl.saturating_mul(self.multiplier);
        let shared = self.state.clone();
        let tx = self.expired_tx.clone();
        let session = id.to_string();
        let handle = runtime.spawn(async move {
            tokio::time::sleep(wait).await;
            let current = {
                let mut state = shared.lock();
                match state.timers.get(&session) {
                    Some(timer) if timer.generation == generation => {
                        state.timers.remove(&session);
                        true
                    }
                    _ => false,
                }
            };
            if current {
                debug!(%session, "session TTL expired");
                let _ = tx.send(session);
            }
        });

        if let Some(old) = state
            .timers
            .insert(id.to_string(), Timer { generation, handle })
        {
            old.handle.abort();
        }
    }

    pub fn clear(&self, id: &str) {
        if let Some(timer) = self.state.lock().timers.remove(id) {
            timer.handle.abort();
        }
    }

    pub fn clear_all(&self) {
        for (_, timer) in self.state.lock().timers.drain() {
            timer.handle.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Arm a timer for every session with a TTL, after gaining leadership.
    pub fn initialize(&self, sessions: &[Session]) {
        let mut armed = 0;
        for session in sessions {
            if let Some(ttl) = session.ttl.filter(|t| !t.is_zero()) {
                self.reset(&session.id, ttl);
                armed += 1;
            }
        }
        debug!(armed, "session timers initialized");
    }

    /// Receiver of expired session ids. Handed out once.
    pub fn take_expired(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.expired_rx.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str, ttl: Option<u64>) -> Session {
        Session {
            id: id.into(),
            node: "n1".into(),
            ttl: ttl.map(Duration::from_secs),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_ttl_times_multiplier() {
        let timers = SessionTimers::new(2);
        let mut expired = timers.take_expired().unwrap();
        timers.set_enabled(true);
        timers.reset("s1", Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(expired.try_recv().is_err());
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(expired.recv().await.as_deref(), Some("s1"));
        assert!(timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_replaces_the_running_timer() {
        let timers = SessionTimers::new(1);
        let mut expired = timers.take_expired().unwrap();
        timers.set_enabled(true);
        timers.reset("s1", Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(8)).await;
        timers.reset("s1", Duration::from_secs(10));
        assert_eq!(timers.len(), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(expired.try_recv().is_err());
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(expired.recv().await.as_deref(), Some("s1"));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_and_disable_cancel_timers() {
        let timers = SessionTimers::new(1);
        let mut expired = timers.take_expired().unwrap();
        timers.set_enabled(true);
        timers.initialize(&[session("a", Some(5)), session("b", Some(5)), session("c", None)]);
        assert_eq!(timers.len(), 2);

        timers.clear("a");
        assert_eq!(timers.len(), 1);
        timers.set_enabled(false);
        assert!(timers.is_empty());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(expired.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_ttl_saturates_instead_of_panicking() {
        let timers = SessionTimers::new(2);
        let mut expired = timers.take_expired().unwrap();
        timers.set_enabled(true);
        timers.reset("s1", Duration::from_secs(u64::MAX / 2 + 1));
        timers.initialize(&[session("s2", Some(u64::MAX))]);
        assert_eq!(timers.len(), 2);

        tokio::time::sleep(Duration::from_secs(86_400 * 365)).await;
        assert!(expired.try_recv().is_err());
        assert_eq!(timers.len(), 2);
    }

    #[test]
    fn disabled_timers_do_nothing() {
        let timers = SessionTimers::new(1);
        timers.reset("s1", Duration::from_secs(1));
        assert!(timers.is_empty());
    }
}
