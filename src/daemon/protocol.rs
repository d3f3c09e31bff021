//! IPC protocol types for daemon communication
//!
//! Messages are sent as newline-delimited JSON over Unix sockets, both for
//! client requests to the daemon and for the daemon's call-outs to listener
//! peers.

use serde::{Deserialize, Serialize};

use crate::daemon::listeners::ConnectionId;
use crate::daemon::peer::PeerToken;
use crate::error::{ConfError, ErrorKind};
use crate::sources::UnsetFlags;
use crate::value::{Entry, Lookup, Value};

fn default_true() -> bool {
    true
}

/// Requests sent from clients to the daemon
///
/// `database` fields name a database by the signature returned from
/// `GetDatabase`; `None` addresses the default database. Keys travel as plain
/// strings so malformed ones come back as `BadKey` rather than a parse error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum DaemonRequest {
    /// Check if daemon is alive
    Ping,
    /// Daemon and database statistics
    Status,
    /// Request daemon shutdown
    Shutdown,
    /// Flush, drop and reopen every database, then replay the saved state
    Reload,
    /// Open (or find) the database for an ordered list of source addresses
    GetDatabase {
        #[serde(default)]
        addresses: Vec<String>,
    },
    Lookup {
        #[serde(default)]
        database: Option<String>,
        key: String,
        #[serde(default)]
        locale: Option<String>,
        #[serde(default = "default_true")]
        use_schema_default: bool,
    },
    LookupDefault {
        #[serde(default)]
        database: Option<String>,
        key: String,
        #[serde(default)]
        locale: Option<String>,
    },
    Set {
        #[serde(default)]
        database: Option<String>,
        key: String,
        value: Value,
    },
    Unset {
        #[serde(default)]
        database: Option<String>,
        key: String,
        #[serde(default)]
        locale: Option<String>,
    },
    RecursiveUnset {
        #[serde(default)]
        database: Option<String>,
        key: String,
        #[serde(default)]
        locale: Option<String>,
        #[serde(default)]
        flags: UnsetFlags,
    },
    DirExists {
        #[serde(default)]
        database: Option<String>,
        dir: String,
    },
    RemoveDir {
        #[serde(default)]
        database: Option<String>,
        dir: String,
    },
    AllEntries {
        #[serde(default)]
        database: Option<String>,
        dir: String,
        #[serde(default)]
        locale: Option<String>,
    },
    AllDirs {
        #[serde(default)]
        database: Option<String>,
        dir: String,
    },
    SetSchema {
        #[serde(default)]
        database: Option<String>,
        key: String,
        #[serde(default)]
        schema_key: Option<String>,
    },
    AddListener {
        #[serde(default)]
        database: Option<String>,
        location: String,
        peer: PeerToken,
        #[serde(default)]
        name: Option<String>,
    },
    RemoveListener {
        #[serde(default)]
        database: Option<String>,
        connection_id: ConnectionId,
    },
    /// Schedule a write-back on the next loop turn
    Sync {
        #[serde(default)]
        database: Option<String>,
    },
    /// Write back before replying
    SynchronousSync {
        #[serde(default)]
        database: Option<String>,
    },
    ClearCache {
        #[serde(default)]
        database: Option<String>,
    },
    AddClient {
        peer: PeerToken,
    },
    RemoveClient {
        peer: PeerToken,
    },
}

impl DaemonRequest {
    /// Requests refused once shutdown has begun.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            DaemonRequest::Reload
                | DaemonRequest::GetDatabase { .. }
                | DaemonRequest::Set { .. }
                | DaemonRequest::Unset { .. }
                | DaemonRequest::RecursiveUnset { .. }
                | DaemonRequest::RemoveDir { .. }
                | DaemonRequest::SetSchema { .. }
                | DaemonRequest::AddListener { .. }
                | DaemonRequest::RemoveListener { .. }
                | DaemonRequest::Sync { .. }
                | DaemonRequest::SynchronousSync { .. }
                | DaemonRequest::ClearCache { .. }
                | DaemonRequest::AddClient { .. }
                | DaemonRequest::RemoveClient { .. }
        )
    }
}

/// Per-database figures reported by `Status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseStatus {
    pub signature: String,
    pub addresses: Vec<String>,
    pub listeners: usize,
    pub sync_pending: bool,
    pub sync_count: u64,
}

/// Daemon-wide figures reported by `Status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub pid: u32,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub in_shutdown: bool,
    pub clients: usize,
    pub databases: Vec<DatabaseStatus>,
}

/// Responses sent from daemon to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", content = "data")]
pub enum DaemonResponse {
    /// Pong response
    Pong,
    Status(DaemonStatus),
    /// Shutdown acknowledged
    ShuttingDown,
    Reloaded,
    Database { signature: String },
    Value(Lookup),
    DefaultValue {
        value: Option<Value>,
        is_writable: bool,
    },
    Exists(bool),
    Entries(Vec<Entry>),
    Dirs(Vec<String>),
    ListenerAdded { connection_id: ConnectionId },
    ListenerRemoved { removed: bool },
    /// The request succeeded with nothing to report
    Done,
    /// Error occurred
    Error { kind: ErrorKind, message: String },
}

impl From<ConfError> for DaemonResponse {
    fn from(err: ConfError) -> Self {
        DaemonResponse::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// A change delivered to one listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub database: String,
    pub connection_id: ConnectionId,
    pub key: String,
    pub value: Option<Value>,
    pub is_default: bool,
    pub is_writable: bool,
}

/// Tells a peer that a subscription it held before a restart now has a new id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerUpdate {
    pub database: String,
    pub location: String,
    pub old_id: ConnectionId,
    pub new_id: ConnectionId,
}

/// Call-outs from the daemon to a listener peer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum PeerRequest {
    Notify(Notification),
    UpdateListener(ListenerUpdate),
    DropAllCaches,
    Ping,
}

/// A peer's answer to a [`PeerRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "data")]
pub enum PeerReply {
    Ok,
    Unsupported,
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serialization() {
        let req = DaemonRequest::Set {
            database: None,
            key: "/apps/x".to_string(),
            value: Value::Int(3),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"method\":\"Set\""));

        let parsed: DaemonRequest = serde_json::from_str(&json).unwrap();
        match parsed {
            DaemonRequest::Set { key, value, .. } => {
                assert_eq!(key, "/apps/x");
                assert_eq!(value, Value::Int(3));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn omitted_fields_take_defaults() {
        let parsed: DaemonRequest =
            serde_json::from_str(r#"{"method":"Lookup","params":{"key":"/a"}}"#).unwrap();
        match parsed {
            DaemonRequest::Lookup {
                database,
                locale,
                use_schema_default,
                ..
            } => {
                assert!(database.is_none());
                assert!(locale.is_none());
                assert!(use_schema_default);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn error_response_carries_kind() {
        let resp = DaemonResponse::from(ConfError::NoWritableDatabase("/a".into()));
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("no_writable_database"));

        let parsed: DaemonResponse = serde_json::from_str(&json).unwrap();
        match parsed {
            DaemonResponse::Error { kind, message } => {
                assert_eq!(kind, ErrorKind::NoWritableDatabase);
                assert!(message.contains("/a"));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn mutating_requests() {
        assert!(!DaemonRequest::Ping.is_mutating());
        assert!(!DaemonRequest::Status.is_mutating());
        assert!(DaemonRequest::AddClient {
            peer: PeerToken::new("unix:/tmp/x")
        }
        .is_mutating());
    }

    #[test]
    fn peer_request_serialization() {
        let req = PeerRequest::Notify(Notification {
            database: "def".to_string(),
            connection_id: ConnectionId(4),
            key: "/apps/x".to_string(),
            value: Some(Value::Bool(true)),
            is_default: false,
            is_writable: true,
        });
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"connection_id\":4"));
        let back: PeerRequest = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, PeerRequest::Notify(n) if n.connection_id == ConnectionId(4)));

        let reply: PeerReply = serde_json::from_str(r#"{"status":"Unsupported"}"#).unwrap();
        assert_eq!(reply, PeerReply::Unsupported);
    }
}
