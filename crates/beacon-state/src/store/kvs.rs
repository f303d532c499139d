//! Key/value entries, locks and their tombstones.

use std::collections::BTreeSet;

use beacon_table::{ID_INDEX, Readable, WriteTxn};
use tracing::{debug, trace};

use super::{Changes, StateStore};
use crate::error::{StateError, StateResult};
use crate::tables::{BY_SESSION, KVS, TOMBSTONES};
use crate::types::{DirEntry, KvsOp};

impl StateStore {
    // ── Writes ─────────────────────────────────────────────────────

    /// Store `entry`. An existing lock holder and LockIndex are kept.
    pub fn kvs_set(&self, index: u64, entry: &DirEntry) -> StateResult<()> {
        let txn = self.write()?;
        let mut changes = Changes::new();
        self.kvs_set_txn(&txn, index, &mut changes, entry, false)?;
        self.finish(txn, changes)
    }

    /// Store `entry` only if its ModifyIndex matches the stored one. A zero
    /// ModifyIndex means the key must not exist yet.
    pub fn kvs_set_cas(&self, index: u64, entry: &DirEntry) -> StateResult<bool> {
        let txn = self.write()?;
        let mut changes = Changes::new();
        let existing = self.tables.kvs.first(&txn, ID_INDEX, &[&entry.key])?;
        let current = existing.map_or(0, |e| e.modify_index);
        if current != entry.modify_index {
            trace!(key = %entry.key, expected = entry.modify_index, current, "cas mismatch");
            return Ok(false);
        }
        self.kvs_set_txn(&txn, index, &mut changes, entry, false)?;
        self.finish(txn, changes)?;
        Ok(true)
    }

    /// Take the lock on `entry.key` for `entry.session`.
    pub fn kvs_lock(&self, index: u64, entry: &DirEntry) -> StateResult<bool> {
        let session = entry
            .session_id()
            .ok_or_else(|| StateError::MissingLockSession(entry.key.clone()))?;

        let txn = self.write()?;
        let mut changes = Changes::new();
        if self.tables.sessions.first(&txn, ID_INDEX, &[session])?.is_none() {
            debug!(key = %entry.key, %session, "lock with unknown session");
            return Ok(false);
        }

        let existing = self.tables.kvs.first(&txn, ID_INDEX, &[&entry.key])?;
        let lock_index = match &existing {
            Some(e) if e.session_id().is_some() => return Ok(false),
            Some(e) => e.lock_index + 1,
            None => 1,
        };
        let row = DirEntry {
            session: Some(session.to_string()),
            lock_index,
            ..entry.clone()
        };
        self.kvs_set_txn(&txn, index, &mut changes, &row, true)?;
        self.finish(txn, changes)?;
        Ok(true)
    }

    /// Release the lock on `entry.key` if `entry.session` holds it.
    pub fn kvs_unlock(&self, index: u64, entry: &DirEntry) -> StateResult<bool> {
        let session = entry
            .session_id()
            .ok_or_else(|| StateError::MissingLockSession(entry.key.clone()))?;

        let txn = self.write()?;
        let mut changes = Changes::new();
        let Some(existing) = self.tables.kvs.first(&txn, ID_INDEX, &[&entry.key])? else {
            return Ok(false);
        };
        if existing.session_id() != Some(session) {
            return Ok(false);
        }
        let row = DirEntry {
            session: None,
            lock_index: existing.lock_index,
            ..entry.clone()
        };
        self.kvs_set_txn(&txn, index, &mut changes, &row, true)?;
        self.finish(txn, changes)?;
        Ok(true)
    }

    /// Delete `key`, leaving a tombstone. A missing key is a no-op.
    pub fn kvs_delete(&self, index: u64, key: &str) -> StateResult<()> {
        let txn = self.write()?;
        let mut changes = Changes::new();
        self.kvs_delete_txn(&txn, index, &mut changes, key)?;
        self.finish(txn, changes)
    }

    /// Delete `key` only if its ModifyIndex equals `cas`. A key that is
    /// already gone counts as deleted.
    pub fn kvs_delete_cas(&self, index: u64, cas: u64, key: &str) -> StateResult<bool> {
        let txn = self.write()?;
        let mut changes = Changes::new();
        match self.tables.kvs.first(&txn, ID_INDEX, &[key])? {
            None => return Ok(true),
            Some(e) if e.modify_index != cas => return Ok(false),
            Some(_) => {}
        }
        self.kvs_delete_txn(&txn, index, &mut changes, key)?;
        self.finish(txn, changes)?;
        Ok(true)
    }

    /// Delete every key starting with `prefix`, tombstoning each one.
    pub fn kvs_delete_tree(&self, index: u64, prefix: &str) -> StateResult<()> {
        let txn = self.write()?;
        let mut changes = Changes::new();

        let doomed: Vec<DirEntry> = self
            .tables
            .kvs
            .get_prefix(&txn, ID_INDEX, &[], prefix)?
            .collect::<Result<_, _>>()?;
        for entry in &doomed {
            self.bury(&txn, index, &mut changes, &entry.key)?;
        }
        let deleted = self.tables.kvs.delete_prefix(&txn, ID_INDEX, &[], prefix)?;
        if deleted > 0 {
            self.tables.bump(&txn, KVS, index)?;
            changes.table(KVS);
            changes.kv(prefix, true);
        }

        self.finish(txn, changes)?;
        debug!(index, %prefix, deleted, "kv tree deleted");
        Ok(())
    }

    /// One keyed mutation, selected by `op`. Returns whether it took
    /// effect; plain sets and deletes always do.
    pub fn kvs_apply(&self, index: u64, op: KvsOp, entry: &DirEntry) -> StateResult<bool> {
        match op {
            KvsOp::Set => self.kvs_set(index, entry).map(|()| true),
            KvsOp::Cas => self.kvs_set_cas(index, entry),
            KvsOp::Lock => self.kvs_lock(index, entry),
            KvsOp::Unlock => self.kvs_unlock(index, entry),
            KvsOp::Delete => self.kvs_delete(index, &entry.key).map(|()| true),
            KvsOp::DeleteCas => self.kvs_delete_cas(index, entry.modify_index, &entry.key),
            KvsOp::DeleteTree => self.kvs_delete_tree(index, &entry.key).map(|()| true),
        }
    }

    /// Write one entry. Unless `locking`, the stored lock holder and
    /// LockIndex win over whatever `entry` carries.
    pub(crate) fn kvs_set_txn(
        &self,
        txn: &WriteTxn<'_>,
        index: u64,
        changes: &mut Changes,
        entry: &DirEntry,
        locking: bool,
    ) -> StateResult<()> {
        let existing = self.tables.kvs.first(txn, ID_INDEX, &[&entry.key])?;
        let mut row = entry.clone();
        row.create_index = existing.as_ref().map_or(index, |e| e.create_index);
        row.modify_index = index;
        if !locking {
            row.session = existing.as_ref().and_then(|e| e.session.clone());
            row.lock_index = existing.as_ref().map_or(0, |e| e.lock_index);
        }
        if row.session.as_deref() == Some("") {
            row.session = None;
        }

        self.tables.kvs.insert(txn, &row)?;
        self.tables.bump(txn, KVS, index)?;
        changes.table(KVS);
        changes.kv(&row.key, false);
        Ok(())
    }

    pub(crate) fn kvs_delete_txn(
        &self,
        txn: &WriteTxn<'_>,
        index: u64,
        changes: &mut Changes,
        key: &str,
    ) -> StateResult<()> {
        if self.tables.kvs.delete(txn, ID_INDEX, &[key])? == 0 {
            return Ok(());
        }
        self.bury(txn, index, changes, key)?;
        self.tables.bump(txn, KVS, index)?;
        changes.table(KVS);
        changes.kv(key, false);
        Ok(())
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// The entry at `key`. The index is the key's own last change, its
    /// tombstone's, or the tables' markers when it never existed.
    pub fn kvs_get(&self, key: &str) -> StateResult<(u64, Option<DirEntry>)> {
        let read = self.read()?;
        let entry = self.tables.kvs.first(&read, ID_INDEX, &[key])?;
        let mut index = entry.as_ref().map_or(0, |e| e.modify_index);
        if let Some(stone) = self.tables.tombstones.first(&read, ID_INDEX, &[key])? {
            index = index.max(stone.modify_index);
        }
        if index == 0 {
            index = self.tables.max_index(&read, &[KVS, TOMBSTONES])?;
        }
        Ok((index, entry))
    }

    /// Every entry under `prefix`, in key order.
    pub fn kvs_list(&self, prefix: &str) -> StateResult<(u64, Vec<DirEntry>)> {
        let read = self.read()?;
        let entries: Vec<DirEntry> = self
            .tables
            .kvs
            .get_prefix(&read, ID_INDEX, &[], prefix)?
            .collect::<Result<_, _>>()?;
        let live = entries.iter().map(|e| e.modify_index).max().unwrap_or(0);
        let index = self.prefix_index(&read, prefix, live)?;
        Ok((index, entries))
    }

    /// Keys under `prefix`. With a separator, keys below the next
    /// separator after the prefix are rolled up into one `dir/` entry.
    pub fn kvs_list_keys(&self, prefix: &str, separator: &str) -> StateResult<(u64, Vec<String>)> {
        let read = self.read()?;
        let mut live = 0;
        let mut keys = Vec::new();
        let mut seen = BTreeSet::new();
        for entry in self.tables.kvs.get_prefix(&read, ID_INDEX, &[], prefix)? {
            let entry = entry?;
            live = live.max(entry.modify_index);

            let rest = &entry.key[prefix.len()..];
            let key = match rest.find(separator).filter(|_| !separator.is_empty()) {
                Some(at) => format!("{prefix}{}", &rest[..at + separator.len()]),
                None => entry.key,
            };
            if seen.insert(key.clone()) {
                keys.push(key);
            }
        }
        let index = self.prefix_index(&read, prefix, live)?;
        Ok((index, keys))
    }

    fn prefix_index<R: Readable>(&self, reader: &R, prefix: &str, live: u64) -> StateResult<u64> {
        let index = live.max(self.graveyard_max(reader, prefix)?);
        if index == 0 {
            return self.tables.max_index(reader, &[KVS, TOMBSTONES]);
        }
        Ok(index)
    }

    /// Keys locked by `session`.
    pub(crate) fn kvs_held_by<R: Readable>(&self, reader: &R, session: &str) -> StateResult<Vec<DirEntry>> {
        Ok(self
            .tables
            .kvs
            .get(reader, BY_SESSION, &[session])?
            .collect::<Result<_, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use crate::StateError;
    use crate::store::test_support::*;
    use crate::tables::KVS;
    use crate::types::{DirEntry, KvsOp};

    fn locked_store() -> crate::StateStore {
        let store = store();
        store.ensure_node(1, &node("n1", "10.0.0.1")).unwrap();
        store.session_create(2, &session("s1", "n1")).unwrap();
        store.session_create(3, &session("s2", "n1")).unwrap();
        store
    }

    #[test]
    fn set_and_get() {
        let store = store();
        assert_eq!(store.kvs_get("foo").unwrap(), (0, None));

        store.kvs_set(1, &DirEntry::new("foo", "bar")).unwrap();
        store.kvs_set(2, &DirEntry::new("foo", "baz")).unwrap();
        let (index, entry) = store.kvs_get("foo").unwrap();
        let entry = entry.unwrap();
        assert_eq!(index, 2);
        assert_eq!(entry.value, b"baz");
        assert_eq!((entry.create_index, entry.modify_index), (1, 2));
    }

    #[test]
    fn cas_semantics() {
        let store = store();
        let mut entry = DirEntry::new("foo", "bar");
        entry.modify_index = 5;
        assert!(!store.kvs_set_cas(1, &entry).unwrap());

        entry.modify_index = 0;
        assert!(store.kvs_set_cas(2, &entry).unwrap());
        // Must-not-exist fails once the key is there.
        assert!(!store.kvs_set_cas(3, &entry).unwrap());

        entry.modify_index = 2;
        entry.value = b"new".to_vec();
        assert!(store.kvs_set_cas(4, &entry).unwrap());
        let (_, stored) = store.kvs_get("foo").unwrap();
        assert_eq!(stored.unwrap().value, b"new");
        // A failed CAS leaves the marker alone.
        assert_eq!(store.max_index(&[KVS]).unwrap(), 4);
    }

    #[test]
    fn lock_and_unlock() {
        let store = locked_store();

        let err = store.kvs_lock(4, &DirEntry::new("lock", "x")).unwrap_err();
        assert!(matches!(err, StateError::MissingLockSession(_)));
        assert!(!store.kvs_lock(4, &DirEntry::new("lock", "x").with_session("nope")).unwrap());

        assert!(store.kvs_lock(5, &DirEntry::new("lock", "x").with_session("s1")).unwrap());
        assert!(!store.kvs_lock(6, &DirEntry::new("lock", "x").with_session("s2")).unwrap());
        let (_, entry) = store.kvs_get("lock").unwrap();
        let entry = entry.unwrap();
        assert_eq!(entry.session.as_deref(), Some("s1"));
        assert_eq!(entry.lock_index, 1);

        assert!(!store.kvs_unlock(7, &DirEntry::new("lock", "x").with_session("s2")).unwrap());
        assert!(!store.kvs_unlock(7, &DirEntry::new("other", "x").with_session("s1")).unwrap());
        assert!(store.kvs_unlock(8, &DirEntry::new("lock", "y").with_session("s1")).unwrap());
        let entry = store.kvs_get("lock").unwrap().1.unwrap();
        assert_eq!(entry.session, None);
        assert_eq!(entry.lock_index, 1);
        assert_eq!(entry.value, b"y");

        assert!(store.kvs_lock(9, &DirEntry::new("lock", "z").with_session("s2")).unwrap());
        assert_eq!(store.kvs_get("lock").unwrap().1.unwrap().lock_index, 2);
    }

    #[test]
    fn plain_set_keeps_the_lock() {
        let store = locked_store();
        assert!(store.kvs_lock(4, &DirEntry::new("lock", "x").with_session("s1")).unwrap());
        store.kvs_set(5, &DirEntry::new("lock", "overwritten")).unwrap();

        let entry = store.kvs_get("lock").unwrap().1.unwrap();
        assert_eq!(entry.session.as_deref(), Some("s1"));
        assert_eq!(entry.lock_index, 1);
        assert_eq!(entry.value, b"overwritten");
    }

    #[test]
    fn delete_cas() {
        let store = store();
        store.kvs_set(1, &DirEntry::new("foo", "bar")).unwrap();
        assert!(!store.kvs_delete_cas(2, 7, "foo").unwrap());
        assert!(store.kvs_get("foo").unwrap().1.is_some());
        assert!(store.kvs_delete_cas(3, 1, "foo").unwrap());
        assert!(store.kvs_get("foo").unwrap().1.is_none());
        assert!(store.kvs_delete_cas(4, 1, "foo").unwrap());
    }

    #[test]
    fn delete_tree_tombstones_each_key() {
        let store = store();
        store.kvs_set(1, &DirEntry::new("foo/a", "1")).unwrap();
        store.kvs_set(2, &DirEntry::new("foo/b/c", "2")).unwrap();
        store.kvs_set(3, &DirEntry::new("food", "3")).unwrap();
        store.kvs_delete_tree(4, "foo/").unwrap();

        let (index, entries) = store.kvs_list("foo/").unwrap();
        assert!(entries.is_empty());
        assert_eq!(index, 4);
        assert_eq!(store.tombstones().unwrap().len(), 2);
        assert!(store.kvs_get("food").unwrap().1.is_some());

        // Nothing under the prefix: no marker movement.
        store.kvs_delete_tree(5, "bar/").unwrap();
        assert_eq!(store.max_index(&[KVS]).unwrap(), 4);
    }

    #[test]
    fn list_and_list_keys() {
        let store = store();
        for (i, key) in ["a/b", "a/c/d", "a/c/e", "a/f", "b"].iter().enumerate() {
            store.kvs_set(i as u64 + 1, &DirEntry::new(*key, "v")).unwrap();
        }

        let (index, entries) = store.kvs_list("a/").unwrap();
        assert_eq!(index, 4);
        assert_eq!(entries.len(), 4);

        let (_, keys) = store.kvs_list_keys("a/", "/").unwrap();
        assert_eq!(keys, vec!["a/b", "a/c/", "a/f"]);
        let (_, keys) = store.kvs_list_keys("a/", "").unwrap();
        assert_eq!(keys.len(), 4);

        // Empty prefix falls back to the table markers.
        let (index, entries) = store.kvs_list("zzz").unwrap();
        assert!(entries.is_empty());
        assert_eq!(index, 5);
    }

    #[test]
    fn apply_dispatches_on_op() {
        let store = locked_store();
        let entry = DirEntry::new("k", "v").with_session("s1");
        assert!(store.kvs_apply(4, KvsOp::Lock, &entry).unwrap());
        assert!(store.kvs_apply(5, KvsOp::Unlock, &entry).unwrap());
        assert!(store.kvs_apply(6, KvsOp::Set, &DirEntry::new("k", "v2")).unwrap());
        assert!(store.kvs_apply(7, KvsOp::Delete, &DirEntry::new("k", "")).unwrap());
        assert!(store.kvs_get("k").unwrap().1.is_none());
    }
}
