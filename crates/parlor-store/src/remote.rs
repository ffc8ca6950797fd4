//! `StoreClient` over the store server's WebSocket protocol.
//!
//! One background task owns the socket. Requests are correlated by
//! `request_id`; watches keep a local id that survives reconnects, and are
//! re-registered with the server every time the socket comes back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, trace, warn};

use parlor_types::Updates;
use parlor_types::paths::CONNECTED;
use parlor_types::protocol::{RequestId, StoreCommand, StoreEvent, WatchId};

use crate::StoreError;
use crate::client::{StoreClient, Watch, WatchSender};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// e.g. `ws://127.0.0.1:3300/store`
    pub url: String,
    pub reconnect_delay: Duration,
    pub request_timeout: Duration,
}

impl RemoteConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect_delay: Duration::from_secs(1),
            request_timeout: Duration::from_secs(10),
        }
    }

    pub fn from_env() -> Self {
        let url = std::env::var("PARLOR_STORE_URL")
            .unwrap_or_else(|_| "ws://127.0.0.1:3300/store".into());
        let reconnect_ms: u64 = std::env::var("PARLOR_RECONNECT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1000);
        let timeout_ms: u64 = std::env::var("PARLOR_REQUEST_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10_000);

        Self {
            url,
            reconnect_delay: Duration::from_millis(reconnect_ms),
            request_timeout: Duration::from_millis(timeout_ms),
        }
    }
}

pub struct RemoteStore {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

struct Shared {
    config: RemoteConfig,
    state: Mutex<RemoteState>,
}

#[derive(Default)]
struct RemoteState {
    outgoing: Option<mpsc::UnboundedSender<StoreCommand>>,
    next_request: RequestId,
    next_watch: WatchId,
    pending: HashMap<RequestId, Pending>,
    watches: HashMap<WatchId, RemoteWatch>,
    /// server watch id -> local watch id, valid for the current socket only
    server_watches: HashMap<WatchId, WatchId>,
}

struct RemoteWatch {
    path: String,
    server_id: Option<WatchId>,
    sender: WatchSender,
}

enum Pending {
    Reply(oneshot::Sender<Result<Option<Value>, StoreError>>),
    /// `reply` is `None` when re-registering after a reconnect.
    Watch {
        local: WatchId,
        reply: Option<oneshot::Sender<Result<(), StoreError>>>,
    },
}

impl RemoteStore {
    /// Connect to the store server. The first attempt must succeed; later
    /// disconnects are retried in the background every `reconnect_delay`.
    pub async fn connect(config: RemoteConfig) -> Result<Self, StoreError> {
        let (ws, _) = connect_async(config.url.as_str())
            .await
            .map_err(|e| StoreError::Unavailable(format!("connect to {} failed: {}", config.url, e)))?;
        info!("Connected to store at {}", config.url);

        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(RemoteState {
                next_request: 1,
                next_watch: 1,
                ..Default::default()
            }),
        });
        let task = tokio::spawn(run(shared.clone(), ws));

        Ok(Self { shared, task })
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock().outgoing.is_some()
    }

    async fn request<F>(&self, make: F) -> Result<Option<Value>, StoreError>
    where
        F: FnOnce(RequestId) -> StoreCommand,
    {
        let (tx, rx) = oneshot::channel();
        let request_id = self.shared.lock().issue(make, Pending::Reply(tx))?;
        self.await_reply(request_id, rx).await
    }

    async fn await_reply<T>(
        &self,
        request_id: RequestId,
        rx: oneshot::Receiver<Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.shared.config.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            // pending entry dropped by a disconnect
            Ok(Err(_)) => Err(StoreError::Disconnected),
            Err(_) => {
                self.shared.lock().pending.remove(&request_id);
                Err(StoreError::Unavailable(format!("request {} timed out", request_id)))
            }
        }
    }
}

impl Drop for RemoteStore {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl StoreClient for RemoteStore {
    async fn write(&self, updates: Updates) -> Result<(), StoreError> {
        self.request(|request_id| StoreCommand::Write { request_id, updates })
            .await
            .map(drop)
    }

    async fn register_deferred_write(&self, updates: Updates) -> Result<(), StoreError> {
        self.request(|request_id| StoreCommand::RegisterDeferred { request_id, updates })
            .await
            .map(drop)
    }

    async fn cancel_deferred_writes(&self) -> Result<(), StoreError> {
        self.request(|request_id| StoreCommand::CancelDeferred { request_id })
            .await
            .map(drop)
    }

    async fn watch(&self, path: &str) -> Result<Watch, StoreError> {
        if path == CONNECTED {
            let mut state = self.shared.lock();
            let local = state.allocate_watch();
            let (sender, watch) = Watch::channel(local, path);
            sender.send_value(Some(Value::Bool(state.outgoing.is_some())));
            state.watches.insert(
                local,
                RemoteWatch {
                    path: path.to_string(),
                    server_id: None,
                    sender,
                },
            );
            return Ok(watch);
        }

        let (tx, rx) = oneshot::channel();
        let (local, watch, request_id) = {
            let mut state = self.shared.lock();
            let local = state.allocate_watch();
            let (sender, watch) = Watch::channel(local, path);
            state.watches.insert(
                local,
                RemoteWatch {
                    path: path.to_string(),
                    server_id: None,
                    sender,
                },
            );

            let owned = path.to_string();
            let issued = state.issue(
                |request_id| StoreCommand::Watch {
                    request_id,
                    path: owned,
                },
                Pending::Watch {
                    local,
                    reply: Some(tx),
                },
            );
            match issued {
                Ok(request_id) => (local, watch, request_id),
                Err(e) => {
                    state.watches.remove(&local);
                    return Err(e);
                }
            }
        };

        match self.await_reply(request_id, rx).await {
            Ok(()) => Ok(watch),
            Err(e) => {
                self.shared.lock().watches.remove(&local);
                Err(e)
            }
        }
    }

    async fn unwatch(&self, id: WatchId) -> Result<(), StoreError> {
        let server_id = {
            let mut state = self.shared.lock();
            match state.watches.remove(&id) {
                Some(watch) => watch.server_id,
                None => return Ok(()),
            }
        };

        let Some(server_id) = server_id else {
            return Ok(());
        };
        self.shared.lock().server_watches.remove(&server_id);

        match self
            .request(|request_id| StoreCommand::Unwatch {
                request_id,
                watch_id: server_id,
            })
            .await
        {
            // the server forgets watches of a dead socket on its own
            Ok(_) | Err(StoreError::Disconnected) | Err(StoreError::UnknownWatch(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn read_once(&self, path: &str) -> Result<Option<Value>, StoreError> {
        if path == CONNECTED {
            return Ok(Some(Value::Bool(self.is_connected())));
        }
        let path = path.to_string();
        self.request(|request_id| StoreCommand::ReadOnce { request_id, path })
            .await
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_connected(&self, outgoing: mpsc::UnboundedSender<StoreCommand>) {
        let mut state = self.lock();
        state.outgoing = Some(outgoing);

        let mut rewatch = Vec::new();
        for (local, watch) in &state.watches {
            if watch.path == CONNECTED {
                watch.sender.send_value(Some(Value::Bool(true)));
            } else {
                rewatch.push((*local, watch.path.clone()));
            }
        }

        if !rewatch.is_empty() {
            info!("Re-registering {} watches", rewatch.len());
        }
        for (local, path) in rewatch {
            if let Err(e) = state.issue(
                |request_id| StoreCommand::Watch { request_id, path },
                Pending::Watch { local, reply: None },
            ) {
                warn!("Could not re-register watch {}: {}", local, e);
            }
        }
    }

    fn on_disconnected(&self) {
        let mut state = self.lock();
        state.outgoing = None;
        state.server_watches.clear();

        let pending: Vec<Pending> = state.pending.drain().map(|(_, p)| p).collect();
        for entry in pending {
            match entry {
                Pending::Reply(tx) => {
                    let _ = tx.send(Err(StoreError::Disconnected));
                }
                Pending::Watch {
                    local,
                    reply: Some(tx),
                } => {
                    state.watches.remove(&local);
                    let _ = tx.send(Err(StoreError::Disconnected));
                }
                Pending::Watch { reply: None, .. } => {}
            }
        }

        state.watches.retain(|_, watch| {
            watch.server_id = None;
            if watch.path == CONNECTED {
                return watch.sender.send_value(Some(Value::Bool(false)));
            }
            true
        });
    }

    fn handle_event(&self, event: StoreEvent) {
        let mut state = self.lock();
        match event {
            StoreEvent::Ready { connection_id } => {
                debug!("Store assigned connection {}", connection_id)
            }
            StoreEvent::Ack { request_id } => state.reply(request_id, Ok(None)),
            StoreEvent::Value { request_id, value } => state.reply(request_id, Ok(value)),
            StoreEvent::Watching {
                request_id,
                watch_id,
            } => state.watch_registered(request_id, watch_id),
            StoreEvent::Snapshot { watch_id, value } => state.snapshot(watch_id, value),
            StoreEvent::WatchFailed { watch_id, error } => {
                state.watch_failed(watch_id, StoreError::from(error))
            }
            StoreEvent::Rejected { request_id, error } => {
                state.reject(request_id, StoreError::from(error))
            }
        }
    }
}

impl RemoteState {
    fn allocate_watch(&mut self) -> WatchId {
        let id = self.next_watch;
        self.next_watch += 1;
        id
    }

    /// Queue a command on the live socket.
    fn issue<F>(&mut self, make: F, pending: Pending) -> Result<RequestId, StoreError>
    where
        F: FnOnce(RequestId) -> StoreCommand,
    {
        let outgoing = self.outgoing.clone().ok_or(StoreError::Disconnected)?;
        let request_id = self.next_request;
        self.next_request += 1;

        self.pending.insert(request_id, pending);
        if outgoing.send(make(request_id)).is_err() {
            self.pending.remove(&request_id);
            return Err(StoreError::Disconnected);
        }
        Ok(request_id)
    }

    /// Fire-and-forget unwatch for a server id nobody listens to anymore.
    fn release_server_watch(&mut self, server_id: WatchId) {
        self.server_watches.remove(&server_id);
        let Some(outgoing) = self.outgoing.clone() else {
            return;
        };
        let request_id = self.next_request;
        self.next_request += 1;
        let _ = outgoing.send(StoreCommand::Unwatch {
            request_id,
            watch_id: server_id,
        });
    }

    fn reply(&mut self, request_id: RequestId, result: Result<Option<Value>, StoreError>) {
        match self.pending.remove(&request_id) {
            Some(Pending::Reply(tx)) => {
                let _ = tx.send(result);
            }
            Some(Pending::Watch { local, .. }) => {
                warn!("Watch request {} answered without a watch id", request_id);
                self.watches.remove(&local);
            }
            // timed out, or an unwatch nobody waits for
            None => {}
        }
    }

    fn watch_registered(&mut self, request_id: RequestId, server_id: WatchId) {
        let Some(Pending::Watch { local, reply }) = self.pending.remove(&request_id) else {
            warn!("Unexpected watch id {} for request {}", server_id, request_id);
            self.release_server_watch(server_id);
            return;
        };

        match self.watches.get_mut(&local) {
            Some(watch) => {
                watch.server_id = Some(server_id);
                self.server_watches.insert(server_id, local);
                if let Some(tx) = reply {
                    let _ = tx.send(Ok(()));
                }
            }
            // unwatched while the request was in flight
            None => self.release_server_watch(server_id),
        }
    }

    fn snapshot(&mut self, server_id: WatchId, value: Option<Value>) {
        let Some(local) = self.server_watches.get(&server_id).copied() else {
            trace!("Snapshot for released watch {}", server_id);
            return;
        };
        let delivered = self
            .watches
            .get(&local)
            .is_some_and(|watch| watch.sender.send_value(value));
        if !delivered {
            self.watches.remove(&local);
            self.release_server_watch(server_id);
        }
    }

    fn watch_failed(&mut self, server_id: WatchId, err: StoreError) {
        let Some(local) = self.server_watches.remove(&server_id) else {
            return;
        };
        if let Some(watch) = self.watches.remove(&local) {
            warn!("Watch on {} cancelled by the store: {}", watch.path, err);
            watch.sender.send_error(err);
        }
    }

    fn reject(&mut self, request_id: RequestId, err: StoreError) {
        match self.pending.remove(&request_id) {
            Some(Pending::Reply(tx)) => {
                let _ = tx.send(Err(err));
            }
            Some(Pending::Watch { local, reply }) => {
                if let Some(watch) = self.watches.remove(&local) {
                    match reply {
                        Some(tx) => {
                            let _ = tx.send(Err(err));
                        }
                        None => {
                            watch.sender.send_error(err);
                        }
                    }
                }
            }
            None => {}
        }
    }
}

// -- Socket task --

async fn run(shared: Arc<Shared>, mut ws: WsStream) {
    loop {
        session(&shared, ws).await;
        shared.on_disconnected();
        warn!("Lost connection to store at {}", shared.config.url);

        ws = loop {
            tokio::time::sleep(shared.config.reconnect_delay).await;
            match connect_async(shared.config.url.as_str()).await {
                Ok((ws, _)) => break ws,
                Err(e) => debug!("Reconnect to {} failed: {}", shared.config.url, e),
            }
        };
        info!("Reconnected to store at {}", shared.config.url);
    }
}

async fn session(shared: &Shared, ws: WsStream) {
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<StoreCommand>();
    shared.on_connected(out_tx);

    loop {
        tokio::select! {
            cmd = out_rx.recv() => {
                let Some(cmd) = cmd else { break };
                let text = match serde_json::to_string(&cmd) {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to encode store command: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    warn!("Store socket write failed: {}", e);
                    break;
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<StoreEvent>(text.as_str()) {
                            Ok(event) => shared.handle_event(event),
                            Err(e) => warn!("Malformed store event: {}", e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Store socket error: {}", e);
                        break;
                    }
                }
            }
        }
    }
}
