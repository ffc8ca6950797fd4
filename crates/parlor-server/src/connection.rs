use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use parlor_store::{MemoryClient, MemoryStore, StoreClient, StoreError, Watch};
use parlor_types::protocol::{RequestId, StoreCommand, StoreEvent, WatchId};

/// Serve one store connection until the socket closes or stops answering
/// pings. Closing the connection runs its deferred writes.
pub async fn handle_connection(socket: WebSocket, store: MemoryStore, heartbeat_interval: Duration) {
    let (mut sender, mut receiver) = socket.split();

    let client = store.connect();
    let connection_id = client.id();
    info!("Store connection {} opened", connection_id);

    let ready = StoreEvent::Ready { connection_id };
    match serde_json::to_string(&ready) {
        Ok(text) => {
            if sender.send(Message::Text(text.into())).await.is_err() {
                return;
            }
        }
        Err(e) => {
            warn!("Failed to encode ready event: {}", e);
            return;
        }
    }

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<StoreEvent>();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward responses and snapshots -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(heartbeat_interval);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    let Some(event) = event else { break };
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to encode store event: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Default::default())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let mut recv_task = tokio::spawn(async move {
        let mut handler = CommandHandler {
            client,
            events: event_tx,
            forwarders: HashMap::new(),
        };

        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<StoreCommand>(text.as_str()) {
                    Ok(cmd) => handler.handle(cmd).await,
                    Err(e) => {
                        warn!(
                            "Connection {} bad command: {} -- raw: {}",
                            connection_id,
                            e,
                            text.as_str().chars().take(200).collect::<String>()
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        handler
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        result = &mut recv_task => {
            send_task.abort();
            if let Ok(handler) = result {
                handler.shutdown();
            }
        }
    }

    store.close_connection(connection_id);
    info!("Store connection {} closed", connection_id);
}

struct CommandHandler {
    client: MemoryClient,
    events: mpsc::UnboundedSender<StoreEvent>,
    forwarders: HashMap<WatchId, JoinHandle<()>>,
}

impl CommandHandler {
    async fn handle(&mut self, cmd: StoreCommand) {
        trace!("Connection {} <- {:?}", self.client.id(), cmd);
        let request_id = cmd.request_id();

        let event = match cmd {
            StoreCommand::Write { updates, .. } => {
                debug!("Connection {} writing {} paths", self.client.id(), updates.len());
                reply(request_id, self.client.write(updates).await)
            }
            StoreCommand::RegisterDeferred { updates, .. } => {
                reply(request_id, self.client.register_deferred_write(updates).await)
            }
            StoreCommand::CancelDeferred { .. } => {
                reply(request_id, self.client.cancel_deferred_writes().await)
            }
            StoreCommand::Watch { path, .. } => match self.client.watch(&path).await {
                Ok(watch) => {
                    let watch_id = watch.id;
                    // Watching must reach the client before the first snapshot
                    let _ = self.events.send(StoreEvent::Watching {
                        request_id,
                        watch_id,
                    });
                    self.forwarders
                        .insert(watch_id, spawn_forwarder(watch, self.events.clone()));
                    return;
                }
                Err(e) => rejected(request_id, &e),
            },
            StoreCommand::Unwatch { watch_id, .. } => {
                if let Some(forwarder) = self.forwarders.remove(&watch_id) {
                    forwarder.abort();
                }
                reply(request_id, self.client.unwatch(watch_id).await)
            }
            StoreCommand::ReadOnce { path, .. } => match self.client.read_once(&path).await {
                Ok(value) => StoreEvent::Value { request_id, value },
                Err(e) => rejected(request_id, &e),
            },
        };

        let _ = self.events.send(event);
    }

    fn shutdown(self) {
        for (_, forwarder) in self.forwarders {
            forwarder.abort();
        }
    }
}

fn spawn_forwarder(watch: Watch, events: mpsc::UnboundedSender<StoreEvent>) -> JoinHandle<()> {
    let Watch {
        id: watch_id,
        mut values,
        mut errors,
        ..
    } = watch;

    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                value = values.recv() => match value {
                    Some(value) => StoreEvent::Snapshot { watch_id, value },
                    None => break,
                },
                Some(err) = errors.recv() => StoreEvent::WatchFailed {
                    watch_id,
                    error: err.to_wire(),
                },
            };
            if events.send(event).is_err() {
                break;
            }
        }
    })
}

fn reply(request_id: RequestId, result: Result<(), StoreError>) -> StoreEvent {
    match result {
        Ok(()) => StoreEvent::Ack { request_id },
        Err(e) => rejected(request_id, &e),
    }
}

fn rejected(request_id: RequestId, err: &StoreError) -> StoreEvent {
    StoreEvent::Rejected {
        request_id,
        error: err.to_wire(),
    }
}
