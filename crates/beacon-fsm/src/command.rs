//! Log entry payloads and their results.

use beacon_state::{Acl, DirEntry, KvsOp, RegisterRequest, Session};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionOp {
    Create,
    Destroy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AclOp {
    Set,
    Delete,
}

/// One replicated mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Command {
    /// Register a node with an optional service and checks.
    Register(RegisterRequest),
    /// Remove a service, a check, or (when neither is named) the node.
    Deregister {
        node: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        service_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        check_id: Option<String>,
    },
    Kvs { op: KvsOp, entry: DirEntry },
    Session { op: SessionOp, session: Session },
    Acl { op: AclOp, acl: Acl },
    /// Reap tombstones at or below `reap_index`.
    TombstoneReap { reap_index: u64 },
}

impl Command {
    /// Decode a log entry payload.
    pub fn decode(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Outcome of applying one command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResponse {
    /// Whether the command took effect. A failed CAS or a contended lock
    /// is `false` without an error.
    pub success: bool,
    /// Why the command was refused, when it broke an invariant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApplyResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn rejected() -> Self {
        Self {
            success: false,
            error: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(reason.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format() {
        let cmd = Command::Kvs {
            op: KvsOp::Cas,
            entry: DirEntry::new("foo", "bar"),
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "kvs");
        assert_eq!(json["op"], "cas");
        assert_eq!(Command::decode(&cmd.encode().unwrap()).unwrap(), cmd);

        let reap: Command = serde_json::from_str(r#"{"type":"tombstone-reap","reap_index":9}"#).unwrap();
        assert_eq!(reap, Command::TombstoneReap { reap_index: 9 });
    }

    #[test]
    fn deregister_defaults_to_the_node() {
        let cmd: Command = serde_json::from_str(r#"{"type":"deregister","node":"n1"}"#).unwrap();
        assert_eq!(
            cmd,
            Command::Deregister {
                node: "n1".into(),
                service_id: None,
                check_id: None,
            }
        );
    }

    #[test]
    fn register_payload_is_flattened() {
        let cmd: Command = serde_json::from_str(
            r#"{"type":"register","node":"n1","address":"10.0.0.1",
                "service":{"id":"web","service":"redis","port":8000}}"#,
        )
        .unwrap();
        let Command::Register(req) = cmd else {
            panic!("wrong variant");
        };
        assert_eq!(req.service.unwrap().port, 8000);
    }

    #[test]
    fn response_omits_missing_error() {
        assert_eq!(serde_json::to_string(&ApplyResponse::ok()).unwrap(), r#"{"success":true}"#);
        let back: ApplyResponse = serde_json::from_str(r#"{"success":false,"error":"x"}"#).unwrap();
        assert_eq!(back, ApplyResponse::failed("x"));
    }
}
