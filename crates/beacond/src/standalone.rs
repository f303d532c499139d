//! Standalone mode — one process is the whole cluster.
//!
//! The daemon is its own leader: commands read from stdin are admitted,
//! given the next log index and applied directly. Tombstone GC and
//! session TTL timers run here and feed their results back through the
//! same path, the way a leader turns them into log entries.

use std::io::Write;
use std::time::Instant;

use beacon_fsm::{Admission, ApplyResponse, Command, Fsm, SessionOp};
use beacon_state::{ALL_TABLES, Session, StateStore, TOMBSTONES};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::config::BeaconConfig;

/// Sole leader of a single-node log.
pub struct Leader {
    fsm: Fsm,
    next_index: u64,
}

impl Leader {
    /// Resume after the highest index the store has seen.
    pub fn new(store: StateStore) -> anyhow::Result<Self> {
        let next_index = store.max_index(&ALL_TABLES)? + 1;
        Ok(Self {
            fsm: Fsm::new(store),
            next_index,
        })
    }

    pub fn store(&self) -> &StateStore {
        self.fsm.store()
    }

    /// Index the next accepted command will be applied at.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Take over leader duties: start GC and arm session timers.
    pub fn establish(&self) -> anyhow::Result<()> {
        let store = self.store();
        store.tombstone_gc().set_enabled(true);
        store.session_timers().set_enabled(true);

        if !store.tombstones()?.is_empty() {
            store.tombstone_gc().hint(store.max_index(&[TOMBSTONES])?);
        }
        let (_, sessions) = store.session_list()?;
        store.session_timers().initialize(&sessions);
        info!(
            next_index = self.next_index,
            sessions = sessions.len(),
            "leadership established"
        );
        Ok(())
    }

    /// Admit `command` and apply it at the next index.
    ///
    /// A refused admission consumes no index. Storage failures are
    /// returned as errors.
    pub fn propose(&mut self, command: &Command) -> anyhow::Result<ApplyResponse> {
        if let Admission::LockDelayed { key, until } = self.fsm.admit(command, Instant::now()) {
            debug!(%key, remaining = ?until.saturating_duration_since(Instant::now()), "lock delayed");
            return Ok(ApplyResponse::rejected());
        }
        let index = self.next_index;
        let response = self.fsm.apply_command(index, command)?;
        self.next_index += 1;
        Ok(response)
    }

    /// Handle one line of input. Lines that do not decode are answered
    /// with a failure and never reach the log.
    pub fn handle_line(&mut self, line: &str) -> anyhow::Result<ApplyResponse> {
        match Command::decode(line.as_bytes()) {
            Ok(command) => self.propose(&command),
            Err(e) => {
                warn!(error = %e, "undecodable command");
                Ok(ApplyResponse::failed(format!("invalid command: {e}")))
            }
        }
    }

    /// Write a snapshot of the whole store.
    pub fn dump<W: Write>(&self, out: W) -> anyhow::Result<u64> {
        Ok(self.fsm.snapshot(out)?)
    }
}

fn destroy(id: String) -> Command {
    Command::Session {
        op: SessionOp::Destroy,
        session: Session {
            id,
            ..Default::default()
        },
    }
}

/// Run the standalone daemon until stdin closes or Ctrl-C.
pub async fn run_standalone(config: BeaconConfig) -> anyhow::Result<()> {
    info!("Beacon daemon starting in standalone mode");
    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = config.db_path();

    let store = StateStore::open(&db_path, &config.store)?;
    info!(path = ?db_path, "state store opened");

    let mut reaps = store
        .tombstone_gc()
        .take_expired()
        .ok_or_else(|| anyhow::anyhow!("tombstone GC receiver already taken"))?;
    let mut expired = store
        .session_timers()
        .take_expired()
        .ok_or_else(|| anyhow::anyhow!("session timer receiver already taken"))?;

    let mut leader = Leader::new(store)?;
    leader.establish()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("input closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let response = leader.handle_line(&line)?;
                let mut out = serde_json::to_vec(&response)?;
                out.push(b'\n');
                stdout.write_all(&out).await?;
                stdout.flush().await?;
            }
            Some(reap_index) = reaps.recv() => {
                let response = leader.propose(&Command::TombstoneReap { reap_index })?;
                debug!(reap_index, success = response.success, "tombstones reaped");
            }
            Some(id) = expired.recv() => {
                info!(session = %id, "session expired");
                leader.propose(&destroy(id))?;
            }
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    let store = leader.store();
    store.tombstone_gc().set_enabled(false);
    store.session_timers().set_enabled(false);
    info!(last_index = leader.next_index() - 1, "Beacon daemon stopped");
    Ok(())
}

/// Write a snapshot of the store under `config` to stdout.
pub fn run_dump(config: BeaconConfig) -> anyhow::Result<()> {
    let store = StateStore::open(&config.db_path(), &config.store)?;
    let leader = Leader::new(store)?;
    let stdout = std::io::stdout();
    let index = leader.dump(std::io::BufWriter::new(stdout.lock()))?;
    info!(index, "snapshot dumped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use beacon_state::{DirEntry, KvsOp, StoreConfig};

    use super::*;

    fn leader() -> Leader {
        Leader::new(StateStore::open_in_memory(&StoreConfig::default()).unwrap()).unwrap()
    }

    fn line(value: serde_json::Value) -> String {
        value.to_string()
    }

    #[test]
    fn commands_get_consecutive_indexes() {
        let mut leader = leader();
        assert_eq!(leader.next_index(), 1);
        let set = line(serde_json::json!({
            "type": "kvs", "op": "set", "entry": {"key": "a", "value": [49]}
        }));
        assert!(leader.handle_line(&set).unwrap().success);
        assert!(leader.handle_line(&set).unwrap().success);
        assert_eq!(leader.next_index(), 3);
        let (index, entry) = leader.store().kvs_get("a").unwrap();
        assert_eq!(index, 2);
        assert_eq!(entry.unwrap().create_index, 1);
    }

    #[test]
    fn garbage_is_answered_without_using_an_index() {
        let mut leader = leader();
        let resp = leader.handle_line("{\"type\":\"bogus\"}").unwrap();
        assert!(!resp.success);
        assert!(resp.error.unwrap().starts_with("invalid command"));
        assert_eq!(leader.next_index(), 1);
    }

    #[test]
    fn lock_delay_is_enforced_before_the_log() {
        let mut leader = leader();
        let register = line(serde_json::json!({
            "type": "register", "node": "n1", "address": "10.0.0.1"
        }));
        leader.handle_line(&register).unwrap();
        leader
            .propose(&Command::Session {
                op: SessionOp::Create,
                session: Session {
                    id: "s1".into(),
                    node: "n1".into(),
                    lock_delay: Duration::from_secs(30),
                    ..Default::default()
                },
            })
            .unwrap();
        let lock = |session: &str| Command::Kvs {
            op: KvsOp::Lock,
            entry: DirEntry::new("leader", "x").with_session(session),
        };
        assert!(leader.propose(&lock("s1")).unwrap().success);
        leader.propose(&destroy("s1".into())).unwrap();

        let before = leader.next_index();
        assert_eq!(leader.propose(&lock("s1")).unwrap(), ApplyResponse::rejected());
        assert_eq!(leader.next_index(), before);
    }

    #[test]
    fn reopened_store_resumes_after_its_last_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beacon.redb");
        {
            let store = StateStore::open(&path, &StoreConfig::default()).unwrap();
            let mut leader = Leader::new(store).unwrap();
            for key in ["a", "b", "c"] {
                leader
                    .propose(&Command::Kvs {
                        op: KvsOp::Set,
                        entry: DirEntry::new(key, "v"),
                    })
                    .unwrap();
            }
        }
        let store = StateStore::open(&path, &StoreConfig::default()).unwrap();
        assert_eq!(Leader::new(store).unwrap().next_index(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn establish_rearms_gc_and_session_timers() {
        let config = StoreConfig {
            tombstone_ttl: "2s".into(),
            tombstone_granularity: "100ms".into(),
            max_query_time: "1s".into(),
            default_query_time: "500ms".into(),
            ..Default::default()
        };
        let mut leader = Leader::new(StateStore::open_in_memory(&config).unwrap()).unwrap();
        let mut reaps = leader.store().tombstone_gc().take_expired().unwrap();

        // Written while not leading: nothing is armed yet.
        leader
            .handle_line(&line(serde_json::json!({"type": "register", "node": "n1", "address": "a"})))
            .unwrap();
        leader
            .handle_line(&line(serde_json::json!({
                "type": "session", "op": "create",
                "session": {"id": "s1", "node": "n1", "ttl": {"secs": 5, "nanos": 0}}
            })))
            .unwrap();
        leader
            .handle_line(&line(serde_json::json!({"type": "kvs", "op": "set", "entry": {"key": "k"}})))
            .unwrap();
        leader
            .handle_line(&line(serde_json::json!({"type": "kvs", "op": "delete", "entry": {"key": "k"}})))
            .unwrap();
        assert!(leader.store().session_timers().is_empty());
        assert!(!leader.store().tombstone_gc().pending_expiration());

        leader.establish().unwrap();
        assert_eq!(leader.store().session_timers().len(), 1);
        assert_eq!(reaps.recv().await, Some(4));
    }
}
