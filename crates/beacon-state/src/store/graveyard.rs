//! Tombstones left behind by deleted keys, and their reaping.

use beacon_table::{ID_INDEX, Readable, WriteTxn};
use tracing::debug;

use super::{Changes, StateStore};
use crate::error::StateResult;
use crate::tables::TOMBSTONES;
use crate::types::Tombstone;

impl StateStore {
    /// Remove every tombstone at or below `reap_index`.
    pub fn reap_tombstones(&self, index: u64, reap_index: u64) -> StateResult<usize> {
        let txn = self.write()?;
        let mut changes = Changes::new();

        let mut reaped = 0;
        let dead: Vec<Tombstone> = self
            .tables
            .tombstones
            .all(&txn)?
            .filter(|t| t.as_ref().map_or(true, |t| t.modify_index <= reap_index))
            .collect::<Result<_, _>>()?;
        for stone in &dead {
            reaped += self.tables.tombstones.delete(&txn, ID_INDEX, &[&stone.key])?;
        }
        // The marker moves to the reap point so a query over an emptied
        // prefix still sees an index no lower than before.
        self.tables.bump(&txn, TOMBSTONES, reap_index.max(index))?;
        changes.table(TOMBSTONES);

        self.finish(txn, changes)?;
        debug!(index, reap_index, reaped, "tombstones reaped");
        Ok(reaped)
    }

    /// Leave a tombstone for `key`, deleted at `index`.
    pub(crate) fn bury(&self, txn: &WriteTxn<'_>, index: u64, changes: &mut Changes, key: &str) -> StateResult<()> {
        self.tables.tombstones.insert(
            txn,
            &Tombstone {
                key: key.to_string(),
                modify_index: index,
            },
        )?;
        self.tables.bump(txn, TOMBSTONES, index)?;
        changes.table(TOMBSTONES);
        changes.hint(index);
        Ok(())
    }

    /// Highest tombstone index at or below `prefix`, 0 if none.
    pub(crate) fn graveyard_max<R: Readable>(&self, reader: &R, prefix: &str) -> StateResult<u64> {
        let mut max = 0;
        for stone in self.tables.tombstones.get_prefix(reader, ID_INDEX, &[], prefix)? {
            max = max.max(stone?.modify_index);
        }
        Ok(max)
    }

    /// Every tombstone, in key order.
    pub fn tombstones(&self) -> StateResult<Vec<Tombstone>> {
        let read = self.read()?;
        Ok(self.tables.tombstones.all(&read)?.collect::<Result<_, _>>()?)
    }
}
