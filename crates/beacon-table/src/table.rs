//! Typed tables with a mandatory unique `id` index.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::db::Db;
use crate::error::{TableError, TableResult, map_err};
use crate::key;
use crate::txn::{Readable, WriteTxn};

/// Name of the primary index every table must declare.
pub const ID_INDEX: &str = "id";

const LAST_INDEX_KEY: &str = "last_index";

type Extractor<T> = Box<dyn Fn(&T) -> Vec<String> + Send + Sync>;

/// Declaration of one index: its ordered fields and how to read them
/// from a row.
pub struct IndexSpec<T> {
    name: &'static str,
    fields: Vec<&'static str>,
    unique: bool,
    allow_blank: bool,
    extract: Extractor<T>,
}

impl<T> IndexSpec<T> {
    /// `extract` must return exactly one value per field, in field order.
    pub fn new<F>(name: &'static str, fields: &[&'static str], extract: F) -> Self
    where
        F: Fn(&T) -> Vec<String> + Send + Sync + 'static,
    {
        Self {
            name,
            fields: fields.to_vec(),
            unique: false,
            allow_blank: false,
            extract: Box::new(extract),
        }
    }

    /// At most one row per field tuple.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Rows with a blank field are left out of this index instead of
    /// being rejected.
    pub fn allow_blank(mut self) -> Self {
        self.allow_blank = true;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> fmt::Debug for IndexSpec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexSpec")
            .field("name", &self.name)
            .field("fields", &self.fields)
            .field("unique", &self.unique)
            .field("allow_blank", &self.allow_blank)
            .finish()
    }
}

/// A typed table. Rows are stored as JSON under a private row-id, and
/// every index maps its encoded field tuple to that row-id.
pub struct Table<T> {
    name: String,
    indexes: Vec<IndexSpec<T>>,
    next_row_id: AtomicU64,
    _row: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for Table<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("indexes", &self.indexes)
            .finish()
    }
}

fn validate_schema<T>(table: &str, indexes: &[IndexSpec<T>]) -> TableResult<()> {
    let invalid = |reason: &str| TableError::Schema {
        table: table.to_string(),
        reason: reason.to_string(),
    };

    if indexes.len() > usize::from(u8::MAX) + 1 {
        return Err(invalid("too many indexes"));
    }
    let ids: Vec<_> = indexes.iter().filter(|i| i.name == ID_INDEX).collect();
    match ids.as_slice() {
        [] => return Err(invalid("missing id index")),
        [id] => {
            if !id.unique {
                return Err(invalid("id index must be unique"));
            }
            if id.allow_blank {
                return Err(invalid("id index must not allow blank values"));
            }
        }
        _ => return Err(invalid("duplicate id index")),
    }
    for (i, index) in indexes.iter().enumerate() {
        if index.fields.is_empty() {
            return Err(invalid(&format!("index {} has no fields", index.name)));
        }
        if indexes[..i].iter().any(|o| o.name == index.name) {
            return Err(invalid(&format!("duplicate index {}", index.name)));
        }
    }
    Ok(())
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> TableResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

impl<T> Table<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Validate the schema and attach it to the table's storage.
    pub fn init(db: &Db, name: &str, indexes: Vec<IndexSpec<T>>) -> TableResult<Self> {
        validate_schema(name, &indexes)?;
        db.create_table(name)?;

        let last = {
            let read = db.begin_read()?;
            read.last_raw(name, &key::row_space())?
        };
        let last_row_id = last.as_deref().and_then(key::row_id_of_row_key).unwrap_or(0);
        debug!(table = %name, indexes = indexes.len(), last_row_id, "table ready");

        Ok(Self {
            name: name.to_string(),
            indexes,
            next_row_id: AtomicU64::new(last_row_id + 1),
            _row: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ── Reads ──────────────────────────────────────────────────

    /// Rows whose leading index fields equal `parts`, in index order.
    pub fn get<R: Readable>(&self, reader: &R, index: &str, parts: &[&str]) -> TableResult<Cursor<T>> {
        let prefix = self.query_prefix(index, parts, None)?;
        Ok(Cursor::new(reader.lookup_rows(&self.name, &prefix)?))
    }

    /// Like [`Table::get`], with the next field matched as a string prefix.
    pub fn get_prefix<R: Readable>(
        &self,
        reader: &R,
        index: &str,
        parts: &[&str],
        partial: &str,
    ) -> TableResult<Cursor<T>> {
        let prefix = self.query_prefix(index, parts, Some(partial))?;
        Ok(Cursor::new(reader.lookup_rows(&self.name, &prefix)?))
    }

    /// First match of [`Table::get`].
    pub fn first<R: Readable>(&self, reader: &R, index: &str, parts: &[&str]) -> TableResult<Option<T>> {
        self.get(reader, index, parts)?.next().transpose()
    }

    /// Every row, in `id` order.
    pub fn all<R: Readable>(&self, reader: &R) -> TableResult<Cursor<T>> {
        self.get(reader, ID_INDEX, &[])
    }

    /// Highest raft index that modified this table, 0 if never.
    pub fn last_index<R: Readable>(&self, reader: &R) -> TableResult<u64> {
        match reader.get_raw(&self.name, &key::meta_key(LAST_INDEX_KEY))? {
            None => Ok(0),
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    TableError::Deserialize(format!("corrupt last index marker on table {}", self.name))
                })?;
                Ok(u64::from_be_bytes(raw))
            }
        }
    }

    // ── Writes ─────────────────────────────────────────────────

    /// Insert a row, replacing any row with the same `id` tuple.
    pub fn insert(&self, txn: &WriteTxn<'_>, row: &T) -> TableResult<()> {
        // Every index key is computed before anything is written.
        let mut keys = Vec::with_capacity(self.indexes.len());
        for (ordinal, index) in self.indexes.iter().enumerate() {
            keys.push(self.row_index_key(ordinal as u8, index, row)?);
        }

        for (index, key) in self.indexes.iter().zip(&keys) {
            let Some(key) = key else { continue };
            if index.name == ID_INDEX {
                for (row_id, bytes) in txn.lookup_rows(&self.name, key)? {
                    let old: T = decode(&bytes)?;
                    self.remove_row(txn, row_id, &old)?;
                }
            }
        }
        for (index, key) in self.indexes.iter().zip(&keys) {
            let Some(key) = key else { continue };
            if index.unique && index.name != ID_INDEX && !txn.scan_raw(&self.name, key)?.is_empty() {
                return Err(TableError::UniqueViolation {
                    table: self.name.clone(),
                    index: index.name.to_string(),
                });
            }
        }

        let row_id = self.next_row_id.fetch_add(1, Ordering::SeqCst);
        let value = serde_json::to_vec(row).map_err(map_err!(Serialize))?;
        txn.put_raw(&self.name, &key::row_key(row_id), &value)?;
        for key in keys.iter().flatten() {
            txn.put_raw(&self.name, &key::index_entry(key, row_id), &[])?;
        }
        Ok(())
    }

    /// Delete every row matching `parts` on `index`. Returns the count.
    pub fn delete(&self, txn: &WriteTxn<'_>, index: &str, parts: &[&str]) -> TableResult<usize> {
        let prefix = self.query_prefix(index, parts, None)?;
        self.delete_matching(txn, &prefix)
    }

    /// Delete every row matching `parts` plus a prefix on the next field.
    pub fn delete_prefix(
        &self,
        txn: &WriteTxn<'_>,
        index: &str,
        parts: &[&str],
        partial: &str,
    ) -> TableResult<usize> {
        let prefix = self.query_prefix(index, parts, Some(partial))?;
        self.delete_matching(txn, &prefix)
    }

    /// Raise the LastIndex marker to `index`; never lowers it.
    pub fn bump_index(&self, txn: &WriteTxn<'_>, index: u64) -> TableResult<()> {
        if index > self.last_index(txn)? {
            txn.put_raw(&self.name, &key::meta_key(LAST_INDEX_KEY), &index.to_be_bytes())?;
        }
        Ok(())
    }

    /// Remove every row, index entry and the LastIndex marker.
    pub fn truncate(&self, txn: &WriteTxn<'_>) -> TableResult<usize> {
        let mut rows = 0;
        for (k, _) in txn.scan_raw(&self.name, &[])? {
            if key::row_id_of_row_key(&k).is_some() {
                rows += 1;
            }
            txn.remove_raw(&self.name, &k)?;
        }
        debug!(table = %self.name, rows, "table truncated");
        Ok(rows)
    }

    fn delete_matching(&self, txn: &WriteTxn<'_>, prefix: &[u8]) -> TableResult<usize> {
        // Collect first: removal rewrites the index being scanned.
        let rows = txn.lookup_rows(&self.name, prefix)?;
        for (row_id, bytes) in &rows {
            let row: T = decode(bytes)?;
            self.remove_row(txn, *row_id, &row)?;
        }
        Ok(rows.len())
    }

    fn remove_row(&self, txn: &WriteTxn<'_>, row_id: u64, row: &T) -> TableResult<()> {
        for (ordinal, index) in self.indexes.iter().enumerate() {
            if let Some(k) = self.row_index_key(ordinal as u8, index, row)? {
                txn.remove_raw(&self.name, &key::index_entry(&k, row_id))?;
            }
        }
        txn.remove_raw(&self.name, &key::row_key(row_id))?;
        Ok(())
    }

    // ── Key encoding ───────────────────────────────────────────

    fn index(&self, name: &str) -> TableResult<(u8, &IndexSpec<T>)> {
        self.indexes
            .iter()
            .enumerate()
            .find(|(_, i)| i.name == name)
            .map(|(ordinal, i)| (ordinal as u8, i))
            .ok_or_else(|| TableError::UnknownIndex {
                table: self.name.clone(),
                index: name.to_string(),
            })
    }

    fn check_reserved(&self, index: &IndexSpec<T>, field: &str, value: &str) -> TableResult<()> {
        if value.as_bytes().contains(&key::SEPARATOR) {
            return Err(TableError::ReservedByte {
                table: self.name.clone(),
                index: index.name.to_string(),
                field: field.to_string(),
            });
        }
        Ok(())
    }

    /// Encoded key of `row` in `index`, or `None` when a blank field
    /// keeps the row out of an index that allows blanks.
    fn row_index_key(&self, ordinal: u8, index: &IndexSpec<T>, row: &T) -> TableResult<Option<Vec<u8>>> {
        let values = (index.extract)(row);
        if values.len() != index.fields.len() {
            return Err(TableError::Schema {
                table: self.name.clone(),
                reason: format!(
                    "index {} extracted {} values for {} fields",
                    index.name,
                    values.len(),
                    index.fields.len()
                ),
            });
        }

        let mut buf = key::index_space(ordinal);
        for (field, value) in index.fields.iter().zip(&values) {
            if value.is_empty() {
                if index.allow_blank {
                    return Ok(None);
                }
                return Err(TableError::MissingField {
                    table: self.name.clone(),
                    index: index.name.to_string(),
                    field: field.to_string(),
                });
            }
            self.check_reserved(index, field, value)?;
            key::push_field(&mut buf, value);
        }
        Ok(Some(buf))
    }

    fn query_prefix(&self, name: &str, parts: &[&str], partial: Option<&str>) -> TableResult<Vec<u8>> {
        let (ordinal, index) = self.index(name)?;
        let given = parts.len() + usize::from(partial.is_some());
        if given > index.fields.len() {
            return Err(TableError::TooManyFields {
                table: self.name.clone(),
                index: index.name.to_string(),
                max: index.fields.len(),
                given,
            });
        }

        let mut buf = key::index_space(ordinal);
        for (field, value) in index.fields.iter().zip(parts) {
            self.check_reserved(index, field, value)?;
            key::push_field(&mut buf, value);
        }
        if let Some(partial) = partial {
            self.check_reserved(index, index.fields[parts.len()], partial)?;
            buf.extend_from_slice(partial.as_bytes());
        }
        Ok(buf)
    }
}

/// Lazily decoded query result.
pub struct Cursor<T> {
    rows: std::vec::IntoIter<(u64, Vec<u8>)>,
    _row: PhantomData<fn() -> T>,
}

impl<T> Cursor<T> {
    fn new(rows: Vec<(u64, Vec<u8>)>) -> Self {
        Self {
            rows: rows.into_iter(),
            _row: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Iterator for Cursor<T> {
    type Item = TableResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let (_, bytes) = self.rows.next()?;
        Some(decode(&bytes))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.rows.size_hint()
    }
}

impl<T: DeserializeOwned> ExactSizeIterator for Cursor<T> {}
