//! Point-in-time dumps of the whole store, and their restoration.

use std::sync::Arc;

use beacon_table::{ReadTxn, WriteTxn};
use serde::de::DeserializeOwned;
use tracing::info;

use super::{Changes, StateStore};
use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// A consistent read view of every table.
pub struct StateSnapshot {
    read: ReadTxn,
    tables: Arc<Tables>,
    last_index: u64,
}

impl StateStore {
    /// Open a snapshot. Later writes are invisible to it.
    pub fn snapshot(&self) -> StateResult<StateSnapshot> {
        let read = self.read()?;
        let last_index = self.tables.max_index(&read, &ALL_TABLES)?;
        Ok(StateSnapshot {
            read,
            tables: self.tables.clone(),
            last_index,
        })
    }

    /// Start replacing the whole store. Every table is emptied inside the
    /// restore's transaction, so nothing changes until [`StateRestore::commit`].
    pub fn restore(&self) -> StateResult<StateRestore<'_>> {
        let txn = self.write()?;
        self.tables.truncate_all(&txn)?;
        Ok(StateRestore {
            store: self,
            txn,
            max_tombstone: 0,
            rows: 0,
            sessions: Vec::new(),
        })
    }
}

impl StateSnapshot {
    /// Highest LastIndex of any table.
    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    pub fn nodes(&self) -> StateResult<Vec<Node>> {
        Ok(self.tables.nodes.all(&self.read)?.collect::<Result<_, _>>()?)
    }

    pub fn services(&self) -> StateResult<Vec<ServiceNode>> {
        Ok(self.tables.services.all(&self.read)?.collect::<Result<_, _>>()?)
    }

    pub fn checks(&self) -> StateResult<Vec<HealthCheck>> {
        Ok(self.tables.checks.all(&self.read)?.collect::<Result<_, _>>()?)
    }

    pub fn kvs(&self) -> StateResult<Vec<DirEntry>> {
        Ok(self.tables.kvs.all(&self.read)?.collect::<Result<_, _>>()?)
    }

    pub fn tombstones(&self) -> StateResult<Vec<Tombstone>> {
        Ok(self.tables.tombstones.all(&self.read)?.collect::<Result<_, _>>()?)
    }

    /// Sessions. Their check bindings are rebuilt from them on restore.
    pub fn sessions(&self) -> StateResult<Vec<Session>> {
        Ok(self.tables.sessions.all(&self.read)?.collect::<Result<_, _>>()?)
    }

    pub fn acls(&self) -> StateResult<Vec<Acl>> {
        Ok(self.tables.acls.all(&self.read)?.collect::<Result<_, _>>()?)
    }

    /// LastIndex marker of every table, in snapshot order.
    pub fn table_indexes(&self) -> StateResult<Vec<(&'static str, u64)>> {
        let mut indexes = Vec::with_capacity(ALL_TABLES.len());
        for table in ALL_TABLES {
            indexes.push((table, self.tables.last_index(&self.read, table)?));
        }
        Ok(indexes)
    }
}

/// An in-progress restore. Dropping it without committing leaves the
/// store untouched.
pub struct StateRestore<'a> {
    store: &'a StateStore,
    txn: WriteTxn<'a>,
    max_tombstone: u64,
    rows: usize,
    sessions: Vec<Session>,
}

impl StateRestore<'_> {
    pub fn node(&mut self, node: &Node) -> StateResult<()> {
        self.store.tables.nodes.insert(&self.txn, node)?;
        self.bump(NODES, node.modify_index)
    }

    pub fn service(&mut self, service: &ServiceNode) -> StateResult<()> {
        self.store.tables.services.insert(&self.txn, service)?;
        self.bump(SERVICES, service.modify_index)
    }

    pub fn check(&mut self, check: &HealthCheck) -> StateResult<()> {
        self.store.tables.checks.insert(&self.txn, check)?;
        self.bump(CHECKS, check.modify_index)
    }

    pub fn kvs(&mut self, entry: &DirEntry) -> StateResult<()> {
        self.store.tables.kvs.insert(&self.txn, entry)?;
        self.bump(KVS, entry.modify_index)
    }

    pub fn tombstone(&mut self, stone: &Tombstone) -> StateResult<()> {
        self.store.tables.tombstones.insert(&self.txn, stone)?;
        self.max_tombstone = self.max_tombstone.max(stone.modify_index);
        self.bump(TOMBSTONES, stone.modify_index)
    }

    /// Restore a session together with its check bindings.
    pub fn session(&mut self, session: &Session) -> StateResult<()> {
        self.store.tables.sessions.insert(&self.txn, session)?;
        for check_id in &session.checks {
            self.store.tables.session_checks.insert(
                &self.txn,
                &SessionCheck {
                    node: session.node.clone(),
                    check_id: check_id.clone(),
                    session: session.id.clone(),
                },
            )?;
            self.store.tables.bump(&self.txn, SESSION_CHECKS, session.modify_index)?;
        }
        if session.ttl.is_some_and(|t| !t.is_zero()) {
            self.sessions.push(session.clone());
        }
        self.bump(SESSIONS, session.modify_index)
    }

    pub fn acl(&mut self, acl: &Acl) -> StateResult<()> {
        self.store.tables.acls.insert(&self.txn, acl)?;
        self.bump(ACLS, acl.modify_index)
    }

    /// Raise a table's LastIndex to the value recorded in the snapshot.
    pub fn table_index(&mut self, table: &str, index: u64) -> StateResult<()> {
        self.store.tables.bump(&self.txn, table, index)
    }

    /// Decode one JSON row for `table` and restore it.
    pub fn row(&mut self, table: &str, value: serde_json::Value) -> StateResult<()> {
        match table {
            NODES => self.node(&decode(value)?),
            SERVICES => self.service(&decode(value)?),
            CHECKS => self.check(&decode(value)?),
            KVS => self.kvs(&decode(value)?),
            TOMBSTONES => self.tombstone(&decode(value)?),
            SESSIONS => self.session(&decode(value)?),
            ACLS => self.acl(&decode(value)?),
            other => Err(StateError::UnknownTable(other.to_string())),
        }
    }

    /// Commit the restore and wake every watcher. Session timers are
    /// re-armed from the restored sessions alone.
    pub fn commit(self) -> StateResult<()> {
        let mut changes = Changes::new();
        for table in ALL_TABLES {
            changes.table(table);
        }
        changes.kv("", true);
        if self.max_tombstone > 0 {
            changes.hint(self.max_tombstone);
        }
        let rows = self.rows;
        let store = self.store;
        store.finish(self.txn, changes)?;

        let timers = store.session_timers();
        timers.clear_all();
        timers.initialize(&self.sessions);
        info!(rows, "state restored");
        Ok(())
    }

    fn bump(&mut self, table: &str, index: u64) -> StateResult<()> {
        self.rows += 1;
        self.store.tables.bump(&self.txn, table, index)
    }
}

fn decode<T: DeserializeOwned>(value: serde_json::Value) -> StateResult<T> {
    serde_json::from_value(value)
        .map_err(|e| beacon_table::TableError::Deserialize(e.to_string()).into())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::store::test_support::*;
    use crate::tables::ALL_TABLES;
    use crate::types::*;

    fn populated() -> crate::StateStore {
        let store = store();
        store
            .ensure_registration(
                1,
                &RegisterRequest {
                    node: "n1".into(),
                    address: "10.0.0.1".into(),
                    service: Some(service("web", "web", &["v1"])),
                    check: Some(check("", "c1", "web", HealthStatus::Passing)),
                    checks: vec![],
                },
            )
            .unwrap();
        let mut s = session("s1", "n1");
        s.checks = vec!["c1".into()];
        store.session_create(2, &s).unwrap();
        store.kvs_lock(3, &DirEntry::new("lock", "x").with_session("s1")).unwrap();
        store.kvs_set(4, &DirEntry::new("gone", "x")).unwrap();
        store.kvs_delete(5, "gone").unwrap();
        store
            .acl_set(
                6,
                &Acl {
                    id: "a1".into(),
                    ..Default::default()
                },
            )
            .unwrap();
        store
    }

    fn copy(from: &crate::StateStore, to: &crate::StateStore) {
        let snap = from.snapshot().unwrap();
        let mut restore = to.restore().unwrap();
        for n in snap.nodes().unwrap() {
            restore.node(&n).unwrap();
        }
        for s in snap.services().unwrap() {
            restore.service(&s).unwrap();
        }
        for c in snap.checks().unwrap() {
            restore.check(&c).unwrap();
        }
        for e in snap.kvs().unwrap() {
            restore.kvs(&e).unwrap();
        }
        for t in snap.tombstones().unwrap() {
            restore.tombstone(&t).unwrap();
        }
        for s in snap.sessions().unwrap() {
            restore.session(&s).unwrap();
        }
        for a in snap.acls().unwrap() {
            restore.acl(&a).unwrap();
        }
        for (table, index) in snap.table_indexes().unwrap() {
            restore.table_index(table, index).unwrap();
        }
        restore.commit().unwrap();
    }

    #[test]
    fn snapshot_ignores_later_writes() {
        let store = populated();
        let snap = store.snapshot().unwrap();
        store.kvs_set(7, &DirEntry::new("late", "x")).unwrap();

        assert_eq!(snap.last_index(), 6);
        assert_eq!(snap.kvs().unwrap().len(), 1);
    }

    #[test]
    fn restore_reproduces_rows_and_markers() {
        let source = populated();
        let target = store();
        target.kvs_set(100, &DirEntry::new("stale", "x")).unwrap();
        copy(&source, &target);

        assert_eq!(target.kvs_get("stale").unwrap().1, None);
        for table in ALL_TABLES {
            assert_eq!(
                target.max_index(&[table]).unwrap(),
                source.max_index(&[table]).unwrap(),
                "{table}"
            );
        }
        assert_eq!(target.node_dump().unwrap(), source.node_dump().unwrap());
        assert_eq!(target.kvs_list("").unwrap(), source.kvs_list("").unwrap());
        assert_eq!(target.tombstones().unwrap(), source.tombstones().unwrap());
        assert_eq!(target.session_list().unwrap(), source.session_list().unwrap());

        // Check bindings came back with the session.
        target
            .ensure_check(7, &check("n1", "c1", "web", HealthStatus::Critical))
            .unwrap();
        assert!(target.session_get("s1").unwrap().1.is_none());
        assert_eq!(target.kvs_get("lock").unwrap().1.unwrap().session, None);
    }

    #[tokio::test(start_paused = true)]
    async fn restore_rearms_timers_for_restored_sessions_only() {
        let source = populated();
        let mut ttl = session("s2", "n1");
        ttl.ttl = Some(Duration::from_secs(30));
        source.session_create(7, &ttl).unwrap();

        let target = store();
        target.ensure_node(1, &node("n1", "10.0.0.1")).unwrap();
        target.session_timers().set_enabled(true);
        let mut doomed = session("old", "n1");
        doomed.ttl = Some(Duration::from_secs(10));
        target.session_create(2, &doomed).unwrap();
        assert_eq!(target.session_timers().len(), 1);

        copy(&source, &target);
        assert!(target.session_get("old").unwrap().1.is_none());
        // s1 has no TTL; only s2 is armed.
        assert_eq!(target.session_timers().len(), 1);

        let mut expired = target.session_timers().take_expired().unwrap();
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert!(expired.try_recv().is_err());
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(expired.recv().await.as_deref(), Some("s2"));
    }

    #[test]
    fn dropped_restore_changes_nothing() {
        let store = populated();
        {
            let mut restore = store.restore().unwrap();
            restore.node(&node("other", "10.0.0.9")).unwrap();
        }
        assert_eq!(store.nodes().unwrap().1.len(), 1);
        assert_eq!(store.max_index(&ALL_TABLES).unwrap(), 6);
    }
}
