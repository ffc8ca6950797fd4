use parlor_types::protocol::{WatchId, WireError, WireErrorKind};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unavailable(String),

    #[error("connection to the store is closed")]
    Disconnected,

    #[error("permission denied at {path}")]
    PermissionDenied { path: String },

    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("unknown watch {0}")]
    UnknownWatch(WatchId),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("persistence failed: {0}")]
    Persistence(String),
}

impl StoreError {
    /// The store could not be reached; nothing was applied.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Disconnected)
    }

    pub fn to_wire(&self) -> WireError {
        let (kind, path) = match self {
            Self::Unavailable(_) => (WireErrorKind::Unavailable, None),
            Self::Disconnected => (WireErrorKind::Disconnected, None),
            Self::PermissionDenied { path } => (WireErrorKind::PermissionDenied, Some(path.clone())),
            Self::InvalidPath { path, .. } => (WireErrorKind::InvalidPath, Some(path.clone())),
            Self::UnknownWatch(_) | Self::Protocol(_) => (WireErrorKind::Protocol, None),
            Self::Persistence(_) => (WireErrorKind::Internal, None),
        };

        WireError {
            kind,
            message: self.to_string(),
            path,
        }
    }
}

impl From<WireError> for StoreError {
    fn from(err: WireError) -> Self {
        let path = err.path.unwrap_or_default();
        match err.kind {
            WireErrorKind::Unavailable => Self::Unavailable(err.message),
            WireErrorKind::Disconnected => Self::Disconnected,
            WireErrorKind::PermissionDenied => Self::PermissionDenied { path },
            WireErrorKind::InvalidPath => Self::InvalidPath {
                path,
                reason: err.message,
            },
            WireErrorKind::Protocol => Self::Protocol(err.message),
            WireErrorKind::Internal => Self::Persistence(err.message),
        }
    }
}
