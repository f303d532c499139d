//! Sessions: creation against live checks, and destruction with the
//! release or deletion of every lock they hold.

use beacon_table::{ID_INDEX, WriteTxn};
use tracing::debug;

use super::{Changes, StateStore};
use crate::error::{StateError, StateResult};
use crate::tables::{BY_NODE, BY_SESSION, KVS, SESSION_CHECKS, SESSIONS};
use crate::types::{DirEntry, HealthStatus, MAX_SESSION_TTL, Session, SessionBehavior, SessionCheck};

impl StateStore {
    /// Create (or replace) a session. Its node and every bound check must
    /// exist, and no bound check may be critical. A TTL may not exceed
    /// [`MAX_SESSION_TTL`].
    pub fn session_create(&self, index: u64, session: &Session) -> StateResult<()> {
        if session.id.is_empty() {
            return Err(StateError::MissingSessionId);
        }
        if let Some(ttl) = session.ttl.filter(|t| *t > MAX_SESSION_TTL) {
            return Err(StateError::SessionTtlTooLong {
                ttl,
                max: MAX_SESSION_TTL,
            });
        }
        let txn = self.write()?;
        let mut changes = Changes::new();

        if self.tables.nodes.first(&txn, ID_INDEX, &[&session.node])?.is_none() {
            return Err(StateError::MissingNode(session.node.clone()));
        }
        for check_id in &session.checks {
            let check = self
                .tables
                .checks
                .first(&txn, ID_INDEX, &[&session.node, check_id])?
                .ok_or_else(|| StateError::MissingCheck(check_id.clone()))?;
            if check.status == HealthStatus::Critical {
                return Err(StateError::CheckCritical(check_id.clone()));
            }
        }

        let existing = self.tables.sessions.first(&txn, ID_INDEX, &[&session.id])?;
        let row = Session {
            create_index: existing.as_ref().map_or(index, |s| s.create_index),
            modify_index: index,
            ..session.clone()
        };
        self.tables.sessions.insert(&txn, &row)?;
        self.tables.bump(&txn, SESSIONS, index)?;
        changes.table(SESSIONS);

        let stale = self.tables.session_checks.delete(&txn, BY_SESSION, &[&session.id])?;
        for check_id in &session.checks {
            self.tables.session_checks.insert(
                &txn,
                &SessionCheck {
                    node: session.node.clone(),
                    check_id: check_id.clone(),
                    session: session.id.clone(),
                },
            )?;
        }
        if stale > 0 || !session.checks.is_empty() {
            self.tables.bump(&txn, SESSION_CHECKS, index)?;
            changes.table(SESSION_CHECKS);
        }
        if let Some(ttl) = session.ttl.filter(|t| !t.is_zero()) {
            changes.session_created(&session.id, ttl);
        }

        self.finish(txn, changes)?;
        debug!(index, id = %session.id, node = %session.node, "session created");
        Ok(())
    }

    /// Destroy a session. A missing session is a no-op.
    pub fn session_destroy(&self, index: u64, id: &str) -> StateResult<()> {
        let txn = self.write()?;
        let mut changes = Changes::new();
        self.delete_session_txn(&txn, index, &mut changes, id)?;
        self.finish(txn, changes)
    }

    pub(crate) fn delete_session_txn(
        &self,
        txn: &WriteTxn<'_>,
        index: u64,
        changes: &mut Changes,
        id: &str,
    ) -> StateResult<()> {
        let Some(session) = self.tables.sessions.first(txn, ID_INDEX, &[id])? else {
            return Ok(());
        };
        self.tables.sessions.delete(txn, ID_INDEX, &[id])?;
        self.tables.bump(txn, SESSIONS, index)?;
        changes.table(SESSIONS);

        let delay = session.lock_delay.min(self.limits.max_lock_delay);
        let held = self.kvs_held_by(txn, id)?;
        for entry in &held {
            match session.behavior {
                SessionBehavior::Release => {
                    let released = released(entry, index);
                    self.tables.kvs.insert(txn, &released)?;
                    self.tables.bump(txn, KVS, index)?;
                    changes.table(KVS);
                    changes.kv(&entry.key, false);
                }
                SessionBehavior::Delete => {
                    self.kvs_delete_txn(txn, index, changes, &entry.key)?;
                }
            }
            if !delay.is_zero() {
                changes.lock_delay(&entry.key, delay);
            }
        }

        if self.tables.session_checks.delete(txn, BY_SESSION, &[id])? > 0 {
            self.tables.bump(txn, SESSION_CHECKS, index)?;
            changes.table(SESSION_CHECKS);
        }
        changes.session_destroyed(id);
        debug!(index, %id, locks = held.len(), behavior = ?session.behavior, "session destroyed");
        Ok(())
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub fn session_get(&self, id: &str) -> StateResult<(u64, Option<Session>)> {
        let read = self.read()?;
        let index = self.tables.max_index(&read, &[SESSIONS])?;
        Ok((index, self.tables.sessions.first(&read, ID_INDEX, &[id])?))
    }

    pub fn session_list(&self) -> StateResult<(u64, Vec<Session>)> {
        let read = self.read()?;
        let index = self.tables.max_index(&read, &[SESSIONS])?;
        let sessions = self.tables.sessions.all(&read)?.collect::<Result<_, _>>()?;
        Ok((index, sessions))
    }

    pub fn node_sessions(&self, node: &str) -> StateResult<(u64, Vec<Session>)> {
        let read = self.read()?;
        let index = self.tables.max_index(&read, &[SESSIONS])?;
        let sessions = self
            .tables
            .sessions
            .get(&read, BY_NODE, &[node])?
            .collect::<Result<_, _>>()?;
        Ok((index, sessions))
    }
}

/// `entry` with its lock holder cleared, as modified at `index`.
fn released(entry: &DirEntry, index: u64) -> DirEntry {
    DirEntry {
        session: None,
        modify_index: index,
        ..entry.clone()
    }
}
