//! Db — the redb database shared by every table.
//!
//! Owns the single writer slot. redb already serializes write
//! transactions; the slot exists so that a writer stuck behind another
//! one is detected instead of waiting forever.

use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use redb::{Database, ReadableDatabase};
use tracing::{debug, error};

use crate::error::{TableResult, map_err};
use crate::txn::{ReadTxn, Readable, WriteTxn};

/// Reserved table for bookkeeping that is not a row of any table.
pub const META_TABLE: &str = "_meta";

/// Options for opening a [`Db`].
#[derive(Debug, Clone)]
pub struct DbOptions {
    /// How long `begin_write` may wait for the writer slot before the
    /// process is aborted (default: 30 seconds).
    pub write_deadline: Duration,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            write_deadline: Duration::from_secs(30),
        }
    }
}

/// Thread-safe handle to the underlying redb database.
pub struct Db {
    inner: Database,
    writer: Mutex<()>,
    write_deadline: Duration,
}

impl Db {
    /// Open (or create) a persistent database at the given path.
    pub fn open(path: &Path, options: DbOptions) -> TableResult<Self> {
        let inner = Database::create(path).map_err(map_err!(Open))?;
        let db = Self::init(inner, options)?;
        debug!(?path, "database opened");
        Ok(db)
    }

    /// Create an ephemeral in-memory database (for testing).
    pub fn open_in_memory(options: DbOptions) -> TableResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let inner = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let db = Self::init(inner, options)?;
        debug!("in-memory database opened");
        Ok(db)
    }

    fn init(inner: Database, options: DbOptions) -> TableResult<Self> {
        let db = Self {
            inner,
            writer: Mutex::new(()),
            write_deadline: options.write_deadline,
        };
        db.create_table(META_TABLE)?;
        Ok(db)
    }

    /// Start the write transaction.
    ///
    /// # Panics
    ///
    /// Panics when another write transaction keeps the writer slot for
    /// longer than the configured write deadline. A writer that never
    /// finishes cannot be recovered from in-process, so the replica is
    /// taken down rather than left hanging.
    pub fn begin_write(&self) -> TableResult<WriteTxn<'_>> {
        let Some(guard) = self.writer.try_lock_for(self.write_deadline) else {
            error!(
                deadline = ?self.write_deadline,
                "write transaction blocked past deadline"
            );
            panic!(
                "possible deadlock: write transaction blocked for more than {:?}",
                self.write_deadline
            );
        };
        let inner = self.inner.begin_write().map_err(map_err!(Transaction))?;
        Ok(WriteTxn::new(inner, guard))
    }

    /// Start a read transaction over a consistent snapshot.
    pub fn begin_read(&self) -> TableResult<ReadTxn> {
        let inner = self.inner.begin_read().map_err(map_err!(Transaction))?;
        Ok(ReadTxn::new(inner))
    }

    /// Create a table's storage if it does not exist yet.
    pub(crate) fn create_table(&self, name: &str) -> TableResult<()> {
        let txn = self.begin_write()?;
        txn.ensure_table(name)?;
        txn.commit()
    }

    /// Read a bookkeeping value from the metadata table.
    pub fn meta_get<R: Readable>(&self, reader: &R, key: &str) -> TableResult<Option<Vec<u8>>> {
        reader.get_raw(META_TABLE, key.as_bytes())
    }

    /// Write a bookkeeping value to the metadata table.
    pub fn meta_put(&self, txn: &WriteTxn<'_>, key: &str, value: &[u8]) -> TableResult<()> {
        txn.put_raw(META_TABLE, key.as_bytes(), value)
    }
}
