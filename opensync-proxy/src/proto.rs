//! Typed request/reply messages between engine and plugin clients.
//!
//! The enums are serde-derived so an out-of-process transport can put them
//! on a wire unchanged; the in-process channel ships them as values.

use opensync_plugin::PluginConfig;
use opensync_types::{Change, ObjType};
use serde::{Deserialize, Serialize};

/// A request sent to a member's client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Prepare plugin state from the member configuration.
    Initialize { config: PluginConfig },
    /// Report available object types.
    Discover,
    /// Open one sink's connection (`objtype = None` is the main sink).
    Connect {
        objtype: Option<ObjType>,
        slow_sync: bool,
    },
    /// Report changes for one object type.
    GetChanges { objtype: ObjType, slow_sync: bool },
    /// Write one change.
    CommitChange { objtype: ObjType, change: Change },
    /// Batch-completion signal after a run of commits.
    CommittedAll { objtype: ObjType },
    /// Mark a successful sync for one sink.
    SyncDone { objtype: Option<ObjType> },
    /// Close one sink's connection.
    Disconnect { objtype: Option<ObjType> },
    /// Release all plugin state and stop the client.
    Finalize,
    /// Custom message passthrough to the plugin.
    CallPlugin { name: String, data: Vec<u8> },
}

/// Discriminant of a [`Request`], used for timeout lookup and request-log
/// auditing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    Initialize,
    Discover,
    Connect,
    GetChanges,
    CommitChange,
    CommittedAll,
    SyncDone,
    Disconnect,
    Finalize,
    CallPlugin,
}

impl Request {
    /// The request's discriminant.
    #[must_use]
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Initialize { .. } => RequestKind::Initialize,
            Request::Discover => RequestKind::Discover,
            Request::Connect { .. } => RequestKind::Connect,
            Request::GetChanges { .. } => RequestKind::GetChanges,
            Request::CommitChange { .. } => RequestKind::CommitChange,
            Request::CommittedAll { .. } => RequestKind::CommittedAll,
            Request::SyncDone { .. } => RequestKind::SyncDone,
            Request::Disconnect { .. } => RequestKind::Disconnect,
            Request::Finalize => RequestKind::Finalize,
            Request::CallPlugin { .. } => RequestKind::CallPlugin,
        }
    }

    /// The sink this request addresses, if it is sink-scoped.
    #[must_use]
    pub fn objtype(&self) -> Option<&ObjType> {
        match self {
            Request::Connect { objtype, .. }
            | Request::SyncDone { objtype }
            | Request::Disconnect { objtype } => objtype.as_ref(),
            Request::GetChanges { objtype, .. }
            | Request::CommitChange { objtype, .. }
            | Request::CommittedAll { objtype } => Some(objtype),
            _ => None,
        }
    }
}

impl RequestKind {
    /// Position of this request in the per-member phase order
    /// (connect = 0, get-changes = 1, commit = 2, sync-done = 3,
    /// disconnect = 4). `None` for requests outside the round phases.
    ///
    /// For any single member the sequence of sent phase indices must be
    /// non-decreasing; the order-audit tests assert it over the request
    /// log.
    #[must_use]
    pub fn phase_index(&self) -> Option<u8> {
        match self {
            RequestKind::Connect => Some(0),
            RequestKind::GetChanges => Some(1),
            RequestKind::CommitChange | RequestKind::CommittedAll => Some(2),
            RequestKind::SyncDone => Some(3),
            RequestKind::Disconnect => Some(4),
            _ => None,
        }
    }
}

/// A successful reply from a member's client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Reply {
    /// The request completed with nothing to report.
    Ok,
    /// Reply to `Discover`: the plugin's object types and whether it
    /// accepts the batch-completion signal.
    Discovered {
        objtypes: Vec<ObjType>,
        batch_commit: bool,
    },
    /// Reply to `GetChanges`.
    Changes(Vec<Change>),
    /// Reply to `CommitChange`, naming the committed uid.
    Committed { uid: String },
    /// Reply to `CallPlugin`.
    Custom(Vec<u8>),
}

/// An application-level failure reported by the plugin, as opposed to a
/// transport fault (timeout, hangup) synthesized by the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Human-readable failure description.
    pub message: String,
}

impl RemoteError {
    /// Creates a remote error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}
