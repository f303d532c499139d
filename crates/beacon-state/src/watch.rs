//! Change notification for the state store: one notify group per table
//! and a prefix-addressed set of groups for KV keys.

use std::collections::{BTreeMap, HashMap};

use beacon_watch::{NotifyGroup, WatchCh};
use parking_lot::Mutex;
use tracing::trace;

use crate::error::{StateError, StateResult};
use crate::tables::ALL_TABLES;

/// Something a blocking query can wait on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WatchTarget {
    /// Any write to the named table.
    Table(String),
    /// Any write to a KV key starting with the prefix.
    KvPrefix(String),
}

impl WatchTarget {
    pub fn table(name: &str) -> Self {
        WatchTarget::Table(name.to_string())
    }

    pub fn kv_prefix(prefix: &str) -> Self {
        WatchTarget::KvPrefix(prefix.to_string())
    }
}

pub(crate) struct TableWatches {
    groups: HashMap<&'static str, NotifyGroup>,
}

impl TableWatches {
    pub fn new() -> Self {
        Self {
            groups: ALL_TABLES.iter().map(|t| (*t, NotifyGroup::new())).collect(),
        }
    }

    pub fn subscribe(&self, table: &str) -> StateResult<WatchCh> {
        self.groups
            .get(table)
            .map(NotifyGroup::subscribe)
            .ok_or_else(|| StateError::UnknownTable(table.to_string()))
    }

    pub fn notify(&self, table: &str) {
        if let Some(group) = self.groups.get(table) {
            group.notify();
        }
    }
}

/// Notify groups keyed by KV prefix.
///
/// A write to a key fires every group whose prefix the key starts with.
/// Fired groups are dropped; the next subscriber creates a fresh one.
#[derive(Default)]
pub struct PrefixWatch {
    groups: Mutex<BTreeMap<String, NotifyGroup>>,
}

impl PrefixWatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, prefix: &str) -> WatchCh {
        self.groups
            .lock()
            .entry(prefix.to_string())
            .or_default()
            .subscribe()
    }

    /// Fire the groups affected by a write to `key`. With `subtree`, also
    /// fire every group below `key` (a tree delete).
    pub fn notify(&self, key: &str, subtree: bool) {
        let mut groups = self.groups.lock();

        let mut fired: Vec<String> = key
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(key.len()))
            .map(|i| &key[..i])
            .filter(|p| groups.contains_key(*p))
            .map(str::to_string)
            .collect();
        if subtree {
            fired.extend(
                groups
                    .range::<str, _>((std::ops::Bound::Excluded(key), std::ops::Bound::Unbounded))
                    .map(|(p, _)| p)
                    .take_while(|p| p.starts_with(key))
                    .cloned(),
            );
        }

        for prefix in fired {
            if let Some(group) = groups.remove(&prefix) {
                trace!(%prefix, "kv watch fired");
                group.notify();
            }
        }
    }

    /// Drop the group for `prefix` if nobody is waiting on it. Groups
    /// otherwise live until a write fires them.
    pub fn release(&self, prefix: &str) {
        let mut groups = self.groups.lock();
        if groups.get(prefix).is_some_and(NotifyGroup::is_unused) {
            groups.remove(prefix);
            trace!(%prefix, "kv watch released");
        }
    }

    /// Number of prefixes with live subscribers.
    pub fn len(&self) -> usize {
        self.groups.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.lock().is_empty()
    }
}
