//! Table and index definitions for the Beacon state store.
//!
//! Every table has a unique `id` index; secondary indexes marked
//! `allow_blank` leave out rows whose field is empty.

use beacon_table::{Db, ID_INDEX, IndexSpec, Readable, Table, TableResult, WriteTxn};

use crate::error::{StateError, StateResult};
use crate::types::*;

pub const NODES: &str = "nodes";
pub const SERVICES: &str = "services";
pub const CHECKS: &str = "checks";
pub const KVS: &str = "kvs";
pub const TOMBSTONES: &str = "tombstones";
pub const SESSIONS: &str = "sessions";
pub const SESSION_CHECKS: &str = "session_checks";
pub const ACLS: &str = "acls";

/// Every table, in snapshot order.
pub const ALL_TABLES: [&str; 8] = [
    NODES,
    SERVICES,
    CHECKS,
    KVS,
    TOMBSTONES,
    SESSIONS,
    SESSION_CHECKS,
    ACLS,
];

pub(crate) const BY_NODE: &str = "node";
pub(crate) const BY_SERVICE: &str = "service";
pub(crate) const BY_STATUS: &str = "status";
pub(crate) const BY_NODE_SERVICE: &str = "node_service";
pub(crate) const BY_NODE_CHECK: &str = "node_check";
pub(crate) const BY_SESSION: &str = "session";

pub(crate) struct Tables {
    pub nodes: Table<Node>,
    pub services: Table<ServiceNode>,
    pub checks: Table<HealthCheck>,
    pub kvs: Table<DirEntry>,
    pub tombstones: Table<Tombstone>,
    pub sessions: Table<Session>,
    pub session_checks: Table<SessionCheck>,
    pub acls: Table<Acl>,
}

impl Tables {
    pub fn init(db: &Db) -> TableResult<Self> {
        Ok(Self {
            nodes: Table::init(
                db,
                NODES,
                vec![IndexSpec::new(ID_INDEX, &["node"], |n: &Node| vec![n.node.clone()]).unique()],
            )?,
            services: Table::init(
                db,
                SERVICES,
                vec![
                    IndexSpec::new(ID_INDEX, &["node", "service_id"], |s: &ServiceNode| {
                        vec![s.node.clone(), s.service_id.clone()]
                    })
                    .unique(),
                    IndexSpec::new(BY_NODE, &["node"], |s: &ServiceNode| vec![s.node.clone()]),
                    IndexSpec::new(BY_SERVICE, &["service_name"], |s: &ServiceNode| {
                        vec![s.service_name.clone()]
                    }),
                ],
            )?,
            checks: Table::init(
                db,
                CHECKS,
                vec![
                    IndexSpec::new(ID_INDEX, &["node", "check_id"], |c: &HealthCheck| {
                        vec![c.node.clone(), c.check_id.clone()]
                    })
                    .unique(),
                    IndexSpec::new(BY_NODE, &["node"], |c: &HealthCheck| vec![c.node.clone()]),
                    IndexSpec::new(BY_STATUS, &["status"], |c: &HealthCheck| {
                        vec![c.status.as_str().to_string()]
                    }),
                    IndexSpec::new(BY_SERVICE, &["service_name"], |c: &HealthCheck| {
                        vec![c.service_name.clone()]
                    })
                    .allow_blank(),
                    IndexSpec::new(BY_NODE_SERVICE, &["node", "service_id"], |c: &HealthCheck| {
                        vec![c.node.clone(), c.service_id.clone()]
                    })
                    .allow_blank(),
                ],
            )?,
            kvs: Table::init(
                db,
                KVS,
                vec![
                    IndexSpec::new(ID_INDEX, &["key"], |e: &DirEntry| vec![e.key.clone()]).unique(),
                    IndexSpec::new(BY_SESSION, &["session"], |e: &DirEntry| {
                        vec![e.session.clone().unwrap_or_default()]
                    })
                    .allow_blank(),
                ],
            )?,
            tombstones: Table::init(
                db,
                TOMBSTONES,
                vec![IndexSpec::new(ID_INDEX, &["key"], |t: &Tombstone| vec![t.key.clone()]).unique()],
            )?,
            sessions: Table::init(
                db,
                SESSIONS,
                vec![
                    IndexSpec::new(ID_INDEX, &["id"], |s: &Session| vec![s.id.clone()]).unique(),
                    IndexSpec::new(BY_NODE, &["node"], |s: &Session| vec![s.node.clone()]),
                ],
            )?,
            session_checks: Table::init(
                db,
                SESSION_CHECKS,
                vec![
                    IndexSpec::new(ID_INDEX, &["node", "check_id", "session"], |m: &SessionCheck| {
                        vec![m.node.clone(), m.check_id.clone(), m.session.clone()]
                    })
                    .unique(),
                    IndexSpec::new(BY_NODE_CHECK, &["node", "check_id"], |m: &SessionCheck| {
                        vec![m.node.clone(), m.check_id.clone()]
                    }),
                    IndexSpec::new(BY_SESSION, &["session"], |m: &SessionCheck| vec![m.session.clone()]),
                ],
            )?,
            acls: Table::init(
                db,
                ACLS,
                vec![IndexSpec::new(ID_INDEX, &["id"], |a: &Acl| vec![a.id.clone()]).unique()],
            )?,
        })
    }

    /// LastIndex marker of the named table.
    pub fn last_index<R: Readable>(&self, reader: &R, table: &str) -> StateResult<u64> {
        let index = match table {
            NODES => self.nodes.last_index(reader)?,
            SERVICES => self.services.last_index(reader)?,
            CHECKS => self.checks.last_index(reader)?,
            KVS => self.kvs.last_index(reader)?,
            TOMBSTONES => self.tombstones.last_index(reader)?,
            SESSIONS => self.sessions.last_index(reader)?,
            SESSION_CHECKS => self.session_checks.last_index(reader)?,
            ACLS => self.acls.last_index(reader)?,
            other => return Err(StateError::UnknownTable(other.to_string())),
        };
        Ok(index)
    }

    /// Highest LastIndex among `tables`.
    pub fn max_index<R: Readable>(&self, reader: &R, tables: &[&str]) -> StateResult<u64> {
        let mut max = 0;
        for table in tables {
            max = max.max(self.last_index(reader, table)?);
        }
        Ok(max)
    }

    /// Raise the named table's LastIndex marker.
    pub fn bump(&self, txn: &WriteTxn<'_>, table: &str, index: u64) -> StateResult<()> {
        match table {
            NODES => self.nodes.bump_index(txn, index)?,
            SERVICES => self.services.bump_index(txn, index)?,
            CHECKS => self.checks.bump_index(txn, index)?,
            KVS => self.kvs.bump_index(txn, index)?,
            TOMBSTONES => self.tombstones.bump_index(txn, index)?,
            SESSIONS => self.sessions.bump_index(txn, index)?,
            SESSION_CHECKS => self.session_checks.bump_index(txn, index)?,
            ACLS => self.acls.bump_index(txn, index)?,
            other => return Err(StateError::UnknownTable(other.to_string())),
        }
        Ok(())
    }

    /// Empty every table, markers included.
    pub fn truncate_all(&self, txn: &WriteTxn<'_>) -> StateResult<()> {
        self.nodes.truncate(txn)?;
        self.services.truncate(txn)?;
        self.checks.truncate(txn)?;
        self.kvs.truncate(txn)?;
        self.tombstones.truncate(txn)?;
        self.sessions.truncate(txn)?;
        self.session_checks.truncate(txn)?;
        self.acls.truncate(txn)?;
        Ok(())
    }
}
