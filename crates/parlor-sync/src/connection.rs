//! Liveness of this client's connection to the store.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use parlor_store::{StoreClient, Watch};
use parlor_types::paths::CONNECTED;
use parlor_types::protocol::WatchId;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::SyncError;

/// Owns the `.info/connected` watch for one session and fans transitions
/// out to subscribers. Stopping or dropping the monitor releases the watch.
pub struct ConnectionMonitor {
    store: Arc<dyn StoreClient>,
    watch_id: WatchId,
    state: Arc<Mutex<MonitorState>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct MonitorState {
    connected: bool,
    subscribers: Vec<mpsc::UnboundedSender<bool>>,
}

impl ConnectionMonitor {
    pub async fn start(store: Arc<dyn StoreClient>) -> Result<Self, SyncError> {
        let Watch {
            id,
            mut values,
            mut errors,
            ..
        } = store.watch(CONNECTED).await?;

        let connected = as_flag(values.recv().await.flatten());
        info!("Connection monitor started, connected={}", connected);

        let state = Arc::new(Mutex::new(MonitorState {
            connected,
            subscribers: Vec::new(),
        }));

        let task_state = state.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    value = values.recv() => match value {
                        Some(value) => publish(&task_state, as_flag(value)),
                        None => break,
                    },
                    Some(err) = errors.recv() => warn!("Connection watch error: {}", err),
                }
            }
            // watch released by the store
            publish(&task_state, false);
            debug!("Connection watch closed");
        });

        Ok(Self {
            store,
            watch_id: id,
            state,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    /// Stream of transitions. The current value is delivered first.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<bool> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = lock(&self.state);
        if tx.send(state.connected).is_ok() {
            state.subscribers.push(tx);
        }
        rx
    }

    /// Call `on_change` with the current value and on every transition until
    /// the returned task is aborted or the monitor stops.
    pub fn watch_connection<F>(&self, mut on_change: F) -> JoinHandle<()>
    where
        F: FnMut(bool) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            while let Some(connected) = rx.recv().await {
                on_change(connected);
            }
        })
    }

    /// Release the store watch and end every subscription. Idempotent.
    pub async fn stop(&self) -> Result<(), SyncError> {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(task) = task else {
            return Ok(());
        };

        task.abort();
        lock(&self.state).subscribers.clear();
        self.store.unwatch(self.watch_id).await?;
        info!("Connection monitor stopped");
        Ok(())
    }
}

impl Drop for ConnectionMonitor {
    fn drop(&mut self) {
        let task = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

fn lock(state: &Mutex<MonitorState>) -> MutexGuard<'_, MonitorState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn publish(state: &Mutex<MonitorState>, connected: bool) {
    let mut state = lock(state);
    if state.connected == connected {
        return;
    }
    state.connected = connected;
    info!("Store connection {}", if connected { "up" } else { "down" });
    state.subscribers.retain(|tx| tx.send(connected).is_ok());
}

fn as_flag(value: Option<Value>) -> bool {
    matches!(value, Some(Value::Bool(true)))
}
