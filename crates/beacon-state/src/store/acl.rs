//! ACL tokens.

use beacon_table::ID_INDEX;

use super::{Changes, StateStore};
use crate::error::{StateError, StateResult};
use crate::tables::ACLS;
use crate::types::Acl;

impl StateStore {
    pub fn acl_set(&self, index: u64, acl: &Acl) -> StateResult<()> {
        if acl.id.is_empty() {
            return Err(StateError::MissingAclId);
        }
        let txn = self.write()?;
        let mut changes = Changes::new();

        let existing = self.tables.acls.first(&txn, ID_INDEX, &[&acl.id])?;
        let row = Acl {
            create_index: existing.map_or(index, |a| a.create_index),
            modify_index: index,
            ..acl.clone()
        };
        self.tables.acls.insert(&txn, &row)?;
        self.tables.bump(&txn, ACLS, index)?;
        changes.table(ACLS);
        self.finish(txn, changes)
    }

    /// Delete an ACL. A missing ACL is a no-op.
    pub fn acl_delete(&self, index: u64, id: &str) -> StateResult<()> {
        let txn = self.write()?;
        let mut changes = Changes::new();
        if self.tables.acls.delete(&txn, ID_INDEX, &[id])? > 0 {
            self.tables.bump(&txn, ACLS, index)?;
            changes.table(ACLS);
        }
        self.finish(txn, changes)
    }

    pub fn acl_get(&self, id: &str) -> StateResult<(u64, Option<Acl>)> {
        let read = self.read()?;
        let index = self.tables.max_index(&read, &[ACLS])?;
        Ok((index, self.tables.acls.first(&read, ID_INDEX, &[id])?))
    }

    pub fn acl_list(&self) -> StateResult<(u64, Vec<Acl>)> {
        let read = self.read()?;
        let index = self.tables.max_index(&read, &[ACLS])?;
        let acls = self.tables.acls.all(&read)?.collect::<Result<_, _>>()?;
        Ok((index, acls))
    }
}
