//! StateStore — the domain store driven by the replicated log.
//!
//! Every write takes the log index it is applied at, runs in one write
//! transaction across all the tables it touches, raises their LastIndex
//! markers, and publishes its notifications only after the commit.

mod acl;
mod catalog;
mod graveyard;
mod kvs;
mod session;
mod snapshot;

pub use snapshot::{StateRestore, StateSnapshot};

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use beacon_table::{Db, DbOptions, ReadTxn, WriteTxn};
use beacon_watch::{WatchPool, WatchSet};
use tracing::debug;

use crate::config::{StoreConfig, StoreLimits};
use crate::error::StateResult;
use crate::lock_delay::LockDelay;
use crate::session_ttl::SessionTimers;
use crate::tables::Tables;
use crate::tombstone_gc::TombstoneGc;
use crate::watch::{PrefixWatch, TableWatches, WatchTarget};

/// Notification and timer state shared by every clone of the store.
pub(crate) struct Hub {
    pub tables: TableWatches,
    pub kv: PrefixWatch,
    pub gc: TombstoneGc,
    pub lock_delay: LockDelay,
    pub timers: SessionTimers,
    pub pool: WatchPool,
}

impl Hub {
    fn publish(&self, changes: Changes) {
        for table in &changes.tables {
            self.tables.notify(table);
        }
        for (key, subtree) in &changes.kv {
            self.kv.notify(key, *subtree);
        }
        if let Some(index) = changes.tombstone_hint {
            self.gc.hint(index);
        }
        for (key, delay) in &changes.lock_delays {
            self.lock_delay.set_expiration(key, changes.at, *delay);
        }
        for id in &changes.destroyed_sessions {
            self.timers.clear(id);
        }
        for (id, ttl) in &changes.created_sessions {
            self.timers.reset(id, *ttl);
        }
    }
}

/// Side effects of one write transaction, published after it commits.
pub(crate) struct Changes {
    at: Instant,
    tables: BTreeSet<&'static str>,
    kv: Vec<(String, bool)>,
    tombstone_hint: Option<u64>,
    lock_delays: Vec<(String, Duration)>,
    destroyed_sessions: Vec<String>,
    created_sessions: Vec<(String, Duration)>,
}

impl Changes {
    pub fn new() -> Self {
        Self {
            at: Instant::now(),
            tables: BTreeSet::new(),
            kv: Vec::new(),
            tombstone_hint: None,
            lock_delays: Vec::new(),
            destroyed_sessions: Vec::new(),
            created_sessions: Vec::new(),
        }
    }

    pub fn table(&mut self, table: &'static str) {
        self.tables.insert(table);
    }

    pub fn kv(&mut self, key: &str, subtree: bool) {
        self.kv.push((key.to_string(), subtree));
    }

    pub fn hint(&mut self, index: u64) {
        self.tombstone_hint = Some(self.tombstone_hint.map_or(index, |i| i.max(index)));
    }

    pub fn lock_delay(&mut self, key: &str, delay: Duration) {
        self.lock_delays.push((key.to_string(), delay));
    }

    pub fn session_destroyed(&mut self, id: &str) {
        self.destroyed_sessions.push(id.to_string());
    }

    pub fn session_created(&mut self, id: &str, ttl: Duration) {
        self.created_sessions.push((id.to_string(), ttl));
    }
}

/// Thread-safe domain store. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Db>,
    tables: Arc<Tables>,
    hub: Arc<Hub>,
    limits: StoreLimits,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path, config: &StoreConfig) -> StateResult<Self> {
        let limits = config.resolve()?;
        let db = Db::open(path, Self::db_options(&limits))?;
        let store = Self::init(db, limits)?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory(config: &StoreConfig) -> StateResult<Self> {
        let limits = config.resolve()?;
        let db = Db::open_in_memory(Self::db_options(&limits))?;
        let store = Self::init(db, limits)?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn db_options(limits: &StoreLimits) -> DbOptions {
        DbOptions {
            write_deadline: limits.write_deadline,
        }
    }

    fn init(db: Db, limits: StoreLimits) -> StateResult<Self> {
        let tables = Tables::init(&db)?;
        let hub = Hub {
            tables: TableWatches::new(),
            kv: PrefixWatch::new(),
            gc: TombstoneGc::new(limits.tombstone_ttl, limits.tombstone_granularity)?,
            lock_delay: LockDelay::new(),
            timers: SessionTimers::new(limits.session_ttl_multiplier),
            pool: WatchPool::new(),
        };
        Ok(Self {
            db: Arc::new(db),
            tables: Arc::new(tables),
            hub: Arc::new(hub),
            limits,
        })
    }

    pub fn limits(&self) -> &StoreLimits {
        &self.limits
    }

    /// The underlying database, for bookkeeping stored next to the rows.
    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn tombstone_gc(&self) -> &TombstoneGc {
        &self.hub.gc
    }

    pub fn session_timers(&self) -> &SessionTimers {
        &self.hub.timers
    }

    pub fn watch_pool(&self) -> &WatchPool {
        &self.hub.pool
    }

    pub fn kv_watch(&self) -> &PrefixWatch {
        &self.hub.kv
    }

    /// Deadline of the lock delay on `key`, if one is running.
    pub fn kvs_lock_delay(&self, key: &str) -> Option<Instant> {
        self.hub.lock_delay.get_expiration(key, Instant::now())
    }

    /// Highest LastIndex among the named tables.
    pub fn max_index(&self, tables: &[&str]) -> StateResult<u64> {
        let read = self.db.begin_read()?;
        self.tables.max_index(&read, tables)
    }

    /// Channels for the current generation of every target.
    pub fn watch_set(&self, targets: &[WatchTarget]) -> StateResult<WatchSet> {
        let mut set = WatchSet::new();
        for target in targets {
            let ch = match target {
                WatchTarget::Table(table) => self.hub.tables.subscribe(table)?,
                WatchTarget::KvPrefix(prefix) => self.hub.kv.subscribe(prefix),
            };
            set.add(ch);
        }
        Ok(set)
    }

    // ── Transaction plumbing ──────────────────────────────────────

    pub(crate) fn read(&self) -> StateResult<ReadTxn> {
        Ok(self.db.begin_read()?)
    }

    pub(crate) fn write(&self) -> StateResult<WriteTxn<'_>> {
        Ok(self.db.begin_write()?)
    }

    /// Commit `txn` and publish `changes` once it is durable.
    pub(crate) fn finish(&self, mut txn: WriteTxn<'_>, changes: Changes) -> StateResult<()> {
        let hub = self.hub.clone();
        txn.defer(move || hub.publish(changes));
        txn.commit()?;
        Ok(())
    }
}
