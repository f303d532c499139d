//! Fsm — applies committed log entries to the state store.
//!
//! Applying is deterministic: every replica feeding the same entries in
//! the same order reaches the same rows, the same LastIndex markers and
//! the same responses.

use std::io::{BufRead, Write};
use std::time::Instant;

use beacon_state::{KvsOp, StateResult, StateStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::command::{AclOp, ApplyResponse, Command, SessionOp};
use crate::error::{FsmError, FsmResult};

const SNAPSHOT_VERSION: u32 = 1;

/// One line of a snapshot stream.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Record {
    Header { version: u32, index: u64 },
    Row { table: String, row: serde_json::Value },
    Index { table: String, index: u64 },
}

/// Leader-side verdict on a command about to be proposed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accept,
    /// A lock on `key` was forcibly released and may not be retaken yet.
    LockDelayed { key: String, until: Instant },
}

pub struct Fsm {
    store: StateStore,
}

impl Fsm {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Decode and apply the entry at `index`.
    pub fn apply(&self, index: u64, data: &[u8]) -> FsmResult<ApplyResponse> {
        let command = Command::decode(data).map_err(|e| FsmError::Decode {
            index,
            reason: e.to_string(),
        })?;
        self.apply_command(index, &command)
    }

    pub fn apply_command(&self, index: u64, command: &Command) -> FsmResult<ApplyResponse> {
        match self.dispatch(index, command) {
            Ok(true) => Ok(ApplyResponse::ok()),
            Ok(false) => {
                debug!(index, "command had no effect");
                Ok(ApplyResponse::rejected())
            }
            Err(e) if e.is_invariant_violation() => {
                warn!(index, error = %e, "command refused");
                Ok(ApplyResponse::failed(e.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn dispatch(&self, index: u64, command: &Command) -> StateResult<bool> {
        let store = &self.store;
        match command {
            Command::Register(req) => store.ensure_registration(index, req).map(|()| true),
            Command::Deregister {
                node,
                service_id,
                check_id,
            } => {
                if let Some(service_id) = service_id.as_deref().filter(|s| !s.is_empty()) {
                    store.delete_service(index, node, service_id)?;
                } else if let Some(check_id) = check_id.as_deref().filter(|c| !c.is_empty()) {
                    store.delete_check(index, node, check_id)?;
                } else {
                    store.delete_node(index, node)?;
                }
                Ok(true)
            }
            Command::Kvs { op, entry } => store.kvs_apply(index, *op, entry),
            Command::Session { op, session } => match op {
                SessionOp::Create => store.session_create(index, session).map(|()| true),
                SessionOp::Destroy => store.session_destroy(index, &session.id).map(|()| true),
            },
            Command::Acl { op, acl } => match op {
                AclOp::Set => store.acl_set(index, acl).map(|()| true),
                AclOp::Delete => store.acl_delete(index, &acl.id).map(|()| true),
            },
            Command::TombstoneReap { reap_index } => {
                store.reap_tombstones(index, *reap_index).map(|_| true)
            }
        }
    }

    /// Check a command at the leader, before it enters the log.
    ///
    /// Lock delays are local wall-clock state, so they are enforced here
    /// and never during apply.
    pub fn admit(&self, command: &Command, now: Instant) -> Admission {
        if let Command::Kvs {
            op: KvsOp::Lock,
            entry,
        } = command
        {
            if let Some(until) = self.store.kvs_lock_delay(&entry.key).filter(|u| *u > now) {
                debug!(key = %entry.key, "lock refused during lock delay");
                return Admission::LockDelayed {
                    key: entry.key.clone(),
                    until,
                };
            }
        }
        Admission::Accept
    }

    /// Write a snapshot of every table as JSON lines. Returns the index
    /// the snapshot is current as of.
    pub fn snapshot<W: Write>(&self, mut out: W) -> FsmResult<u64> {
        let snap = self.store.snapshot()?;
        let index = snap.last_index();
        write_record(
            &mut out,
            &Record::Header {
                version: SNAPSHOT_VERSION,
                index,
            },
        )?;

        let mut rows = 0;
        rows += write_rows(&mut out, beacon_state::NODES, snap.nodes()?)?;
        rows += write_rows(&mut out, beacon_state::SERVICES, snap.services()?)?;
        rows += write_rows(&mut out, beacon_state::CHECKS, snap.checks()?)?;
        rows += write_rows(&mut out, beacon_state::KVS, snap.kvs()?)?;
        rows += write_rows(&mut out, beacon_state::TOMBSTONES, snap.tombstones()?)?;
        rows += write_rows(&mut out, beacon_state::SESSIONS, snap.sessions()?)?;
        rows += write_rows(&mut out, beacon_state::ACLS, snap.acls()?)?;
        for (table, table_index) in snap.table_indexes()? {
            write_record(
                &mut out,
                &Record::Index {
                    table: table.to_string(),
                    index: table_index,
                },
            )?;
        }
        out.flush()?;

        info!(index, rows, "snapshot written");
        Ok(index)
    }

    /// Replace the whole store with a snapshot stream. Returns the index
    /// recorded in its header.
    pub fn restore<R: BufRead>(&self, input: R) -> FsmResult<u64> {
        let mut lines = input.lines();
        let header = match lines.next() {
            Some(line) => parse_record(&line?)?,
            None => return Err(FsmError::Snapshot("empty stream".into())),
        };
        let index = match header {
            Record::Header { version, index } if version == SNAPSHOT_VERSION => index,
            Record::Header { version, .. } => {
                return Err(FsmError::Snapshot(format!("unsupported version {version}")));
            }
            _ => return Err(FsmError::Snapshot("missing header".into())),
        };

        let mut restore = self.store.restore()?;
        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match parse_record(&line)? {
                Record::Row { table, row } => restore.row(&table, row)?,
                Record::Index { table, index } => restore.table_index(&table, index)?,
                Record::Header { .. } => return Err(FsmError::Snapshot("duplicate header".into())),
            }
        }
        restore.commit()?;

        info!(index, "snapshot restored");
        Ok(index)
    }
}

fn write_record<W: Write>(out: &mut W, record: &Record) -> FsmResult<()> {
    serde_json::to_writer(&mut *out, record).map_err(|e| FsmError::Snapshot(e.to_string()))?;
    out.write_all(b"\n")?;
    Ok(())
}

fn write_rows<W: Write, T: Serialize>(out: &mut W, table: &str, rows: Vec<T>) -> FsmResult<usize> {
    let count = rows.len();
    for row in rows {
        let row = serde_json::to_value(row).map_err(|e| FsmError::Snapshot(e.to_string()))?;
        write_record(
            out,
            &Record::Row {
                table: table.to_string(),
                row,
            },
        )?;
    }
    Ok(count)
}

fn parse_record(line: &str) -> FsmResult<Record> {
    serde_json::from_str(line).map_err(|e| FsmError::Snapshot(e.to_string()))
}
