//! Domain types for the Beacon state store.
//!
//! Every stored row carries the log index that created it and the one
//! that last modified it. All types are serializable to/from JSON, which
//! is both their row encoding and their snapshot encoding.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ── Catalog ────────────────────────────────────────────────────────

/// A registered node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub node: String,
    pub address: String,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

/// A service as registered on one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeService {
    pub id: String,
    pub service: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

/// Stored service row: a service instance joined with its node.
///
/// `address` is the node's address; it is filled in on reads and left
/// blank in storage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceNode {
    pub node: String,
    #[serde(default)]
    pub address: String,
    pub service_id: String,
    pub service_name: String,
    #[serde(default)]
    pub service_tags: Vec<String>,
    #[serde(default)]
    pub service_address: String,
    #[serde(default)]
    pub service_port: u16,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

impl ServiceNode {
    pub fn to_node_service(&self) -> NodeService {
        NodeService {
            id: self.service_id.clone(),
            service: self.service_name.clone(),
            tags: self.service_tags.clone(),
            address: self.service_address.clone(),
            port: self.service_port,
            create_index: self.create_index,
            modify_index: self.modify_index,
        }
    }

    /// Case-insensitive tag match.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.service_tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }
}

/// Health of a check. A check registered without a status is critical.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Passing,
    Warning,
    #[default]
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Passing => "passing",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A health check on a node, optionally scoped to one of its services.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    #[serde(default)]
    pub node: String,
    pub check_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: HealthStatus,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

/// A node, its optional service and any checks, registered atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub node: String,
    pub address: String,
    #[serde(default)]
    pub service: Option<NodeService>,
    #[serde(default)]
    pub check: Option<HealthCheck>,
    #[serde(default)]
    pub checks: Vec<HealthCheck>,
}

/// A node with every service registered on it, keyed by service id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeServices {
    pub node: Node,
    pub services: BTreeMap<String, NodeService>,
}

/// One service of a node together with the checks scoped to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceWithChecks {
    pub service: NodeService,
    pub checks: Vec<HealthCheck>,
}

/// A service instance with its node and the checks that gate it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckServiceNode {
    pub node: Node,
    pub service: NodeService,
    pub checks: Vec<HealthCheck>,
}

/// Everything registered against one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node: String,
    pub address: String,
    pub services: Vec<NodeService>,
    pub checks: Vec<HealthCheck>,
}

/// Service name to the union of its tags.
pub type Services = BTreeMap<String, Vec<String>>;

// ── KV ─────────────────────────────────────────────────────────────

/// A key/value entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub key: String,
    #[serde(default)]
    pub value: Vec<u8>,
    #[serde(default)]
    pub flags: u64,
    /// Session holding the lock on this key, if any.
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
    #[serde(default)]
    pub lock_index: u64,
}

impl DirEntry {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    /// Session name, treating an empty string as no session.
    pub(crate) fn session_id(&self) -> Option<&str> {
        self.session.as_deref().filter(|s| !s.is_empty())
    }
}

/// The mode of a keyed KV mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KvsOp {
    Set,
    Cas,
    Lock,
    Unlock,
    Delete,
    DeleteCas,
    DeleteTree,
}

/// Marker left behind by a deleted key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub key: String,
    pub modify_index: u64,
}

// ── Sessions ───────────────────────────────────────────────────────

/// What happens to a session's locks when it is destroyed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionBehavior {
    /// Clear the lock holder, keeping the keys.
    #[default]
    Release,
    /// Delete the locked keys.
    Delete,
}

/// Longest TTL a session may be created with.
pub const MAX_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub node: String,
    /// Checks on `node` that must stay non-critical for the session to live.
    #[serde(default)]
    pub checks: Vec<String>,
    #[serde(default)]
    pub lock_delay: Duration,
    #[serde(default)]
    pub behavior: SessionBehavior,
    #[serde(default)]
    pub ttl: Option<Duration>,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

/// Mapping row binding a session to one of its checks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCheck {
    pub node: String,
    pub check_id: String,
    pub session: String,
}

// ── ACLs ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub rules: String,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_status_defaults_to_critical() {
        let hc: HealthCheck = serde_json::from_str(r#"{"check_id":"c1"}"#).unwrap();
        assert_eq!(hc.status, HealthStatus::Critical);
        let hc: HealthCheck = serde_json::from_str(r#"{"check_id":"c1","status":"passing"}"#).unwrap();
        assert_eq!(hc.status, HealthStatus::Passing);
    }

    #[test]
    fn session_behavior_defaults_to_release() {
        let s: Session = serde_json::from_str(r#"{"id":"s1","node":"n1"}"#).unwrap();
        assert_eq!(s.behavior, SessionBehavior::Release);
        assert!(s.ttl.is_none());
    }

    #[test]
    fn kvs_op_wire_names() {
        assert_eq!(serde_json::to_string(&KvsOp::DeleteTree).unwrap(), "\"delete-tree\"");
        let op: KvsOp = serde_json::from_str("\"delete-cas\"").unwrap();
        assert_eq!(op, KvsOp::DeleteCas);
    }

    #[test]
    fn empty_session_is_no_session() {
        assert_eq!(DirEntry::new("k", "v").with_session("").session_id(), None);
        assert_eq!(DirEntry::new("k", "v").with_session("s").session_id(), Some("s"));
    }

    #[test]
    fn tag_match_ignores_case() {
        let sn = ServiceNode {
            service_tags: vec!["Master".into()],
            ..Default::default()
        };
        assert!(sn.has_tag("master"));
        assert!(!sn.has_tag("slave"));
    }
}
