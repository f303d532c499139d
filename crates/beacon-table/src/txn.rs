//! Read and write transactions.
//!
//! Both kinds expose the same raw read surface through [`Readable`], so
//! typed table reads work the same inside a write (seeing its own
//! uncommitted changes) and inside a read snapshot.

use parking_lot::MutexGuard;
use redb::{ReadTransaction, ReadableTable, StorageError, TableDefinition, WriteTransaction};
use tracing::trace;

use crate::error::{TableResult, map_err};
use crate::key;

type RawTable<'a> = TableDefinition<'a, &'static [u8], &'static [u8]>;

fn raw(name: &str) -> RawTable<'_> {
    TableDefinition::new(name)
}

/// Hook run once the write transaction that registered it has committed.
pub type CommitHook = Box<dyn FnOnce() + Send + 'static>;

/// Raw reads shared by read and write transactions.
pub trait Readable {
    /// Value stored under `key`, if any.
    fn get_raw(&self, table: &str, key: &[u8]) -> TableResult<Option<Vec<u8>>>;

    /// Every `(key, value)` whose key starts with `prefix`, in key order.
    fn scan_raw(&self, table: &str, prefix: &[u8]) -> TableResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Greatest key starting with `prefix`.
    fn last_raw(&self, table: &str, prefix: &[u8]) -> TableResult<Option<Vec<u8>>>;

    /// Rows referenced by the index entries under `prefix`, as
    /// `(row-id, encoded row)` in index order.
    fn lookup_rows(&self, table: &str, prefix: &[u8]) -> TableResult<Vec<(u64, Vec<u8>)>>;
}

fn get_in<T>(table: &T, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    Ok(table.get(key)?.map(|v| v.value().to_vec()))
}

fn scan_in<T>(table: &T, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    let mut out = Vec::new();
    for item in table.range(prefix..)? {
        let (k, v) = item?;
        if !k.value().starts_with(prefix) {
            break;
        }
        out.push((k.value().to_vec(), v.value().to_vec()));
    }
    Ok(out)
}

fn last_in<T>(table: &T, prefix: &[u8]) -> Result<Option<Vec<u8>>, StorageError>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    let end = key::prefix_end(prefix);
    let mut range = match &end {
        Some(end) => table.range(prefix..end.as_slice())?,
        None => table.range(prefix..)?,
    };
    match range.next_back() {
        Some(item) => {
            let (k, _) = item?;
            Ok(Some(k.value().to_vec()))
        }
        None => Ok(None),
    }
}

fn lookup_in<T>(table: &T, prefix: &[u8]) -> Result<Vec<(u64, Vec<u8>)>, StorageError>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    let mut rows = Vec::new();
    for (entry, _) in scan_in(table, prefix)? {
        let Some(row_id) = key::row_id_of_entry(&entry) else {
            continue;
        };
        if let Some(row) = table.get(key::row_key(row_id).as_slice())? {
            rows.push((row_id, row.value().to_vec()));
        }
    }
    Ok(rows)
}

// ── Write transaction ──────────────────────────────────────────

/// The single open write transaction.
///
/// Holds the database's writer slot until committed or dropped. Dropping
/// without committing aborts every change.
pub struct WriteTxn<'db> {
    inner: WriteTransaction,
    deferred: Vec<CommitHook>,
    writer: MutexGuard<'db, ()>,
}

impl<'db> WriteTxn<'db> {
    pub(crate) fn new(inner: WriteTransaction, writer: MutexGuard<'db, ()>) -> Self {
        Self {
            inner,
            deferred: Vec::new(),
            writer,
        }
    }

    /// Register a hook that runs after a successful commit, in
    /// registration order. Hooks never run if the transaction aborts.
    pub fn defer<F>(&mut self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.deferred.push(Box::new(hook));
    }

    /// Make every change durable and visible, then run the deferred hooks.
    ///
    /// The writer slot is released before the hooks run.
    pub fn commit(self) -> TableResult<()> {
        let WriteTxn {
            inner,
            deferred,
            writer,
        } = self;
        inner.commit().map_err(map_err!(Transaction))?;
        drop(writer);

        if !deferred.is_empty() {
            trace!(hooks = deferred.len(), "running commit hooks");
        }
        for hook in deferred {
            hook();
        }
        Ok(())
    }

    /// Discard every change. Deferred hooks are dropped unrun.
    pub fn abort(self) -> TableResult<()> {
        self.inner.abort().map_err(map_err!(Transaction))
    }

    pub(crate) fn ensure_table(&self, name: &str) -> TableResult<()> {
        self.inner.open_table(raw(name)).map_err(map_err!(Table))?;
        Ok(())
    }

    pub(crate) fn put_raw(&self, table: &str, key: &[u8], value: &[u8]) -> TableResult<()> {
        let mut t = self.inner.open_table(raw(table)).map_err(map_err!(Table))?;
        t.insert(key, value).map_err(map_err!(Write))?;
        Ok(())
    }

    pub(crate) fn remove_raw(&self, table: &str, key: &[u8]) -> TableResult<bool> {
        let mut t = self.inner.open_table(raw(table)).map_err(map_err!(Table))?;
        let removed = t.remove(key).map_err(map_err!(Write))?.is_some();
        Ok(removed)
    }
}

impl Readable for WriteTxn<'_> {
    fn get_raw(&self, table: &str, key: &[u8]) -> TableResult<Option<Vec<u8>>> {
        let t = self.inner.open_table(raw(table)).map_err(map_err!(Table))?;
        get_in(&t, key).map_err(map_err!(Read))
    }

    fn scan_raw(&self, table: &str, prefix: &[u8]) -> TableResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let t = self.inner.open_table(raw(table)).map_err(map_err!(Table))?;
        scan_in(&t, prefix).map_err(map_err!(Read))
    }

    fn last_raw(&self, table: &str, prefix: &[u8]) -> TableResult<Option<Vec<u8>>> {
        let t = self.inner.open_table(raw(table)).map_err(map_err!(Table))?;
        last_in(&t, prefix).map_err(map_err!(Read))
    }

    fn lookup_rows(&self, table: &str, prefix: &[u8]) -> TableResult<Vec<(u64, Vec<u8>)>> {
        let t = self.inner.open_table(raw(table)).map_err(map_err!(Table))?;
        lookup_in(&t, prefix).map_err(map_err!(Read))
    }
}

// ── Read transaction ───────────────────────────────────────────

/// A consistent read-only snapshot.
pub struct ReadTxn {
    inner: ReadTransaction,
}

impl ReadTxn {
    pub(crate) fn new(inner: ReadTransaction) -> Self {
        Self { inner }
    }
}

impl Readable for ReadTxn {
    fn get_raw(&self, table: &str, key: &[u8]) -> TableResult<Option<Vec<u8>>> {
        let t = self.inner.open_table(raw(table)).map_err(map_err!(Table))?;
        get_in(&t, key).map_err(map_err!(Read))
    }

    fn scan_raw(&self, table: &str, prefix: &[u8]) -> TableResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let t = self.inner.open_table(raw(table)).map_err(map_err!(Table))?;
        scan_in(&t, prefix).map_err(map_err!(Read))
    }

    fn last_raw(&self, table: &str, prefix: &[u8]) -> TableResult<Option<Vec<u8>>> {
        let t = self.inner.open_table(raw(table)).map_err(map_err!(Table))?;
        last_in(&t, prefix).map_err(map_err!(Read))
    }

    fn lookup_rows(&self, table: &str, prefix: &[u8]) -> TableResult<Vec<(u64, Vec<u8>)>> {
        let t = self.inner.open_table(raw(table)).map_err(map_err!(Table))?;
        lookup_in(&t, prefix).map_err(map_err!(Read))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::db::{Db, DbOptions};

    fn db() -> Db {
        let db = Db::open_in_memory(DbOptions::default()).unwrap();
        db.create_table("t").unwrap();
        db
    }

    #[test]
    fn hooks_run_after_commit_in_order() {
        let db = db();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut txn = db.begin_write().unwrap();
        for i in 0..3 {
            let log = log.clone();
            txn.defer(move || log.lock().push(i));
        }
        assert!(log.lock().is_empty());
        txn.commit().unwrap();
        assert_eq!(*log.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn hooks_never_run_on_abort_or_drop() {
        let db = db();
        let fired = Arc::new(AtomicUsize::new(0));

        let mut txn = db.begin_write().unwrap();
        let f = fired.clone();
        txn.defer(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        txn.abort().unwrap();

        let mut txn = db.begin_write().unwrap();
        let f = fired.clone();
        txn.defer(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        drop(txn);

        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn hook_may_open_a_new_write() {
        let db = Arc::new(db());
        let mut txn = db.begin_write().unwrap();
        txn.put_raw("t", b"a", b"1").unwrap();
        let inner = db.clone();
        txn.defer(move || {
            let txn = inner.begin_write().unwrap();
            txn.put_raw("t", b"b", b"2").unwrap();
            txn.commit().unwrap();
        });
        txn.commit().unwrap();

        let read = db.begin_read().unwrap();
        assert_eq!(read.get_raw("t", b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn scan_stops_at_prefix_boundary() {
        let db = db();
        let txn = db.begin_write().unwrap();
        for k in ["a", "ab", "abc", "b", "ba"] {
            txn.put_raw("t", k.as_bytes(), b"").unwrap();
        }
        let keys: Vec<_> = txn
            .scan_raw("t", b"ab")
            .unwrap()
            .into_iter()
            .map(|(k, _)| String::from_utf8(k).unwrap())
            .collect();
        assert_eq!(keys, vec!["ab", "abc"]);
        assert_eq!(txn.last_raw("t", b"a").unwrap(), Some(b"abc".to_vec()));
        assert_eq!(txn.last_raw("t", b"c").unwrap(), None);
        assert_eq!(txn.scan_raw("t", b"").unwrap().len(), 5);
    }

    #[test]
    fn readers_see_a_stable_snapshot() {
        let db = db();
        let before = db.begin_read().unwrap();

        let txn = db.begin_write().unwrap();
        txn.put_raw("t", b"k", b"v").unwrap();
        txn.commit().unwrap();

        assert!(before.get_raw("t", b"k").unwrap().is_none());
        let after = db.begin_read().unwrap();
        assert_eq!(after.get_raw("t", b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn remove_reports_presence() {
        let db = db();
        let txn = db.begin_write().unwrap();
        txn.put_raw("t", b"k", b"v").unwrap();
        assert!(txn.remove_raw("t", b"k").unwrap());
        assert!(!txn.remove_raw("t", b"k").unwrap());
    }
}
