use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use parlor_types::Updates;
use parlor_types::protocol::WatchId;

use crate::StoreError;

/// Capability to talk to the realtime keyed store over one connection.
///
/// Every component of the sync layer receives one of these explicitly;
/// there is no ambient store handle.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Atomic multi-path set. `null` values delete.
    async fn write(&self, updates: Updates) -> Result<(), StoreError>;

    /// Register updates the store applies on its own if this connection is
    /// lost. Registering a path again replaces the earlier value.
    /// Returns once the store has acknowledged the registration.
    async fn register_deferred_write(&self, updates: Updates) -> Result<(), StoreError>;

    /// Drop every deferred write registered by this connection.
    async fn cancel_deferred_writes(&self) -> Result<(), StoreError>;

    /// Live subscription to `path`. The current value is delivered first.
    async fn watch(&self, path: &str) -> Result<Watch, StoreError>;

    /// Release a watch. Unknown ids are ignored.
    async fn unwatch(&self, id: WatchId) -> Result<(), StoreError>;

    async fn read_once(&self, path: &str) -> Result<Option<Value>, StoreError>;

    /// Whether `write` applies all paths of one call atomically.
    fn atomic_multi_path(&self) -> bool {
        true
    }
}

/// Receiving side of a live subscription. Values and errors arrive on
/// separate channels.
#[derive(Debug)]
pub struct Watch {
    pub id: WatchId,
    pub path: String,
    pub values: mpsc::UnboundedReceiver<Option<Value>>,
    pub errors: mpsc::UnboundedReceiver<StoreError>,
}

impl Watch {
    pub fn channel(id: WatchId, path: impl Into<String>) -> (WatchSender, Watch) {
        let (value_tx, value_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        (
            WatchSender {
                values: value_tx,
                errors: error_tx,
            },
            Watch {
                id,
                path: path.into(),
                values: value_rx,
                errors: error_rx,
            },
        )
    }
}

/// Store-side end of a [`Watch`].
#[derive(Debug, Clone)]
pub struct WatchSender {
    values: mpsc::UnboundedSender<Option<Value>>,
    errors: mpsc::UnboundedSender<StoreError>,
}

impl WatchSender {
    /// Returns false once the receiving side is gone.
    pub fn send_value(&self, value: Option<Value>) -> bool {
        self.values.send(value).is_ok()
    }

    pub fn send_error(&self, error: StoreError) -> bool {
        self.errors.send(error).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.values.is_closed()
    }
}
