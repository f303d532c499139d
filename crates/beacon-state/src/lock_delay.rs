//! Lock delay: keys whose lock was forcibly released stay unlockable for
//! a while.
//!
//! Deadlines are wall-clock and local to this server, so they are only
//! authoritative where they are checked before a lock request enters the
//! log.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Default)]
pub struct LockDelay {
    delays: Mutex<HashMap<String, Instant>>,
}

impl LockDelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse locks on `key` until `now + delay`. A later deadline
    /// already in place is kept.
    pub fn set_expiration(&self, key: &str, now: Instant, delay: Duration) {
        let until = now + delay;
        let mut delays = self.delays.lock();
        let entry = delays.entry(key.to_string()).or_insert(until);
        if *entry < until {
            *entry = until;
        }
    }

    /// Deadline of the delay on `key`, if one is still running at `now`.
    pub fn get_expiration(&self, key: &str, now: Instant) -> Option<Instant> {
        let mut delays = self.delays.lock();
        match delays.get(key) {
            Some(&until) if until > now => Some(until),
            Some(_) => {
                delays.remove(key);
                None
            }
            None => None,
        }
    }

    /// Drop every elapsed delay.
    pub fn prune(&self, now: Instant) {
        self.delays.lock().retain(|_, until| *until > now);
    }

    pub fn len(&self) -> usize {
        self.delays.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.delays.lock().is_empty()
    }
}
