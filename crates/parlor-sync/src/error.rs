use parlor_store::StoreError;
use parlor_types::{ChannelId, InvalidKey, RoomId, Uid};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The store could not be reached. Nothing is retried internally.
    #[error("store unreachable: {0}")]
    Connectivity(#[source] StoreError),

    #[error("permission denied at {path}")]
    Permission { path: String },

    /// One mirror of a membership pair committed and the other did not.
    #[error(
        "membership of {uid} in {channel_id} is half written after {attempts} attempts: {last}"
    )]
    ConsistencyViolation {
        uid: Uid,
        channel_id: ChannelId,
        attempts: u32,
        last: StoreError,
    },

    #[error("unexpected data at {path}: {source}")]
    Decoding {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    InvalidKey(#[from] InvalidKey),

    #[error("channel {0} does not exist")]
    UnknownChannel(ChannelId),

    #[error("room {room_id} does not exist in {channel_id}")]
    UnknownRoom { channel_id: ChannelId, room_id: RoomId },

    #[error("{uid} is not a member of {channel_id}")]
    NotAMember { uid: Uid, channel_id: ChannelId },

    #[error("session has been logged out")]
    SessionClosed,

    #[error("store rejected the request: {0}")]
    Store(#[source] StoreError),
}

impl SyncError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }

    pub(crate) fn decoding(path: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Decoding {
            path: path.into(),
            source,
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::PermissionDenied { path } => Self::Permission { path },
            err if err.is_connectivity() => Self::Connectivity(err),
            err => Self::Store(err),
        }
    }
}
