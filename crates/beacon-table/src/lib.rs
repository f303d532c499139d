//! beacon-table — indexed row store for Beacon.
//!
//! Backed by [redb](https://docs.rs/redb), provides typed tables with a
//! mandatory unique `id` index plus any number of secondary indexes, all
//! updated atomically inside one write transaction that may span many
//! tables.
//!
//! # Architecture
//!
//! Each logical table owns one redb table of `&[u8]` keys. Three key
//! spaces share it:
//!
//! ```text
//! 0x00 | name                         → table metadata (LastIndex marker)
//! 0x01 | row-id (u64 BE)              → JSON-serialized row
//! 0x02 | index ordinal | fields | id  → (empty)
//! ```
//!
//! Index fields are each terminated by a reserved `0x00` byte, so the
//! byte order of index entries is the lexicographic order of the field
//! tuple, and a query on the leading fields is a plain prefix scan.
//!
//! Only one write transaction is open at a time; readers get MVCC
//! snapshots and never block the writer or each other.

pub mod db;
pub mod error;
mod key;
pub mod table;
pub mod txn;

pub use db::{Db, DbOptions};
pub use error::{TableError, TableResult};
pub use table::{Cursor, ID_INDEX, IndexSpec, Table};
pub use txn::{ReadTxn, Readable, WriteTxn};
