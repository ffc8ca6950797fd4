use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::updates::Updates;

pub type RequestId = u64;
pub type WatchId = u64;

/// Commands sent FROM client TO the store server over WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum StoreCommand {
    /// Atomic multi-path set
    Write { request_id: RequestId, updates: Updates },

    /// Updates the server applies if this connection drops
    RegisterDeferred { request_id: RequestId, updates: Updates },

    /// Forget every deferred write of this connection
    CancelDeferred { request_id: RequestId },

    /// Start a live subscription; the first snapshot follows immediately
    Watch { request_id: RequestId, path: String },

    Unwatch { request_id: RequestId, watch_id: WatchId },

    ReadOnce { request_id: RequestId, path: String },
}

impl StoreCommand {
    pub fn request_id(&self) -> RequestId {
        match self {
            Self::Write { request_id, .. }
            | Self::RegisterDeferred { request_id, .. }
            | Self::CancelDeferred { request_id }
            | Self::Watch { request_id, .. }
            | Self::Unwatch { request_id, .. }
            | Self::ReadOnce { request_id, .. } => *request_id,
        }
    }
}

/// Events sent FROM the store server TO the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum StoreEvent {
    /// Connection accepted
    Ready { connection_id: Uuid },

    /// Write, deferred registration, cancel or unwatch succeeded
    Ack { request_id: RequestId },

    /// Result of a read
    Value { request_id: RequestId, value: Option<Value> },

    /// Watch registered under `watch_id`
    Watching { request_id: RequestId, watch_id: WatchId },

    /// Current value of a watched path
    Snapshot { watch_id: WatchId, value: Option<Value> },

    /// The watch was cancelled by the server
    WatchFailed { watch_id: WatchId, error: WireError },

    /// The request failed
    Rejected { request_id: RequestId, error: WireError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireErrorKind {
    Unavailable,
    Disconnected,
    PermissionDenied,
    InvalidPath,
    Protocol,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: WireErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}
