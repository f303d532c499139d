//! openraft adapter for the FSM.
//!
//! Committed entries carry [`Command`]s and produce [`ApplyResponse`]s.
//! The applied log id and the last membership are kept in the engine's
//! metadata table next to the rows they describe. Snapshots are the
//! FSM's JSON-lines stream.

use std::io::Cursor;
use std::sync::Arc;

use openraft::storage::{RaftSnapshotBuilder, RaftStateMachine};
use openraft::{
    Entry, EntryPayload, ErrorSubject, ErrorVerb, LogId, Snapshot, SnapshotMeta, StorageError,
    StoredMembership, TokioRuntime,
};
use tracing::{debug, info};

use crate::command::{ApplyResponse, Command};
use crate::fsm::Fsm;

openraft::declare_raft_types!(
    /// Beacon Raft type configuration.
    pub TypeConfig:
        D = Command,
        R = ApplyResponse,
        NodeId = u64,
        Node = openraft::BasicNode,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = TokioRuntime,
);

pub type BeaconRaft = openraft::Raft<TypeConfig>;

const APPLIED_KEY: &str = "raft.last_applied";
const MEMBERSHIP_KEY: &str = "raft.membership";

type Membership = StoredMembership<u64, openraft::BasicNode>;

fn read_err(e: impl std::fmt::Display) -> StorageError<u64> {
    StorageError::from_io_error(
        ErrorSubject::StateMachine,
        ErrorVerb::Read,
        std::io::Error::other(e.to_string()),
    )
}

fn write_err(e: impl std::fmt::Display) -> StorageError<u64> {
    StorageError::from_io_error(
        ErrorSubject::StateMachine,
        ErrorVerb::Write,
        std::io::Error::other(e.to_string()),
    )
}

pub struct StateMachine {
    fsm: Arc<Fsm>,
}

pub struct SnapshotBuilder {
    fsm: Arc<Fsm>,
}

impl StateMachine {
    pub fn new(fsm: Arc<Fsm>) -> Self {
        Self { fsm }
    }

    pub fn fsm(&self) -> &Arc<Fsm> {
        &self.fsm
    }
}

fn load_meta<T: serde::de::DeserializeOwned>(fsm: &Fsm, key: &str) -> Result<Option<T>, StorageError<u64>> {
    let db = fsm.store().db();
    let read = db.begin_read().map_err(read_err)?;
    match db.meta_get(&read, key).map_err(read_err)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(read_err)?)),
        None => Ok(None),
    }
}

fn save_meta<T: serde::Serialize>(fsm: &Fsm, key: &str, value: &T) -> Result<(), StorageError<u64>> {
    let data = serde_json::to_vec(value).map_err(write_err)?;
    let db = fsm.store().db();
    let txn = db.begin_write().map_err(write_err)?;
    db.meta_put(&txn, key, &data).map_err(write_err)?;
    txn.commit().map_err(write_err)?;
    Ok(())
}

impl RaftStateMachine<TypeConfig> for StateMachine {
    type SnapshotBuilder = SnapshotBuilder;

    async fn applied_state(&mut self) -> Result<(Option<LogId<u64>>, Membership), StorageError<u64>> {
        let applied = load_meta(&self.fsm, APPLIED_KEY)?;
        let membership = load_meta(&self.fsm, MEMBERSHIP_KEY)?.unwrap_or_default();
        Ok((applied, membership))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<ApplyResponse>, StorageError<u64>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
        I::IntoIter: Send,
    {
        let mut responses = Vec::new();
        for entry in entries {
            let log_id = entry.log_id;
            let response = match entry.payload {
                EntryPayload::Blank => ApplyResponse::ok(),
                EntryPayload::Normal(command) => self
                    .fsm
                    .apply_command(log_id.index, &command)
                    .map_err(write_err)?,
                EntryPayload::Membership(membership) => {
                    save_meta(&self.fsm, MEMBERSHIP_KEY, &Membership::new(Some(log_id), membership))?;
                    ApplyResponse::ok()
                }
            };
            save_meta(&self.fsm, APPLIED_KEY, &log_id)?;
            debug!(index = log_id.index, success = response.success, "entry applied");
            responses.push(response);
        }
        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        SnapshotBuilder {
            fsm: Arc::clone(&self.fsm),
        }
    }

    async fn begin_receiving_snapshot(&mut self) -> Result<Box<Cursor<Vec<u8>>>, StorageError<u64>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<u64, openraft::BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<u64>> {
        let index = self.fsm.restore(Cursor::new(snapshot.into_inner())).map_err(write_err)?;
        save_meta(&self.fsm, APPLIED_KEY, &meta.last_log_id)?;
        save_meta(&self.fsm, MEMBERSHIP_KEY, &meta.last_membership)?;
        info!(index, snapshot_id = %meta.snapshot_id, "installed snapshot");
        Ok(())
    }

    async fn get_current_snapshot(&mut self) -> Result<Option<Snapshot<TypeConfig>>, StorageError<u64>> {
        let applied: Option<LogId<u64>> = load_meta(&self.fsm, APPLIED_KEY)?;
        if applied.is_none() {
            return Ok(None);
        }
        let mut builder = self.get_snapshot_builder().await;
        Ok(Some(builder.build_snapshot().await?))
    }
}

impl RaftSnapshotBuilder<TypeConfig> for SnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<u64>> {
        let last_applied: Option<LogId<u64>> = load_meta(&self.fsm, APPLIED_KEY)?;
        let membership: Membership = load_meta(&self.fsm, MEMBERSHIP_KEY)?.unwrap_or_default();

        let mut data = Vec::new();
        self.fsm.snapshot(&mut data).map_err(read_err)?;

        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership: membership,
            snapshot_id: format!("snap-{}", last_applied.map_or(0, |l| l.index)),
        };
        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}
