use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use parlor_types::Updates;
use parlor_types::paths::{self, CONNECTED};
use parlor_types::protocol::WatchId;

use crate::client::{StoreClient, Watch, WatchSender};
use crate::db::Database;
use crate::{StoreError, tree};

pub type ConnectionId = Uuid;

/// In-process realtime store.
///
/// Holds the JSON tree, live watches and per-connection deferred writes.
/// Clones share the same tree; each [`MemoryClient`] is one connection.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    db: Option<Database>,
}

struct State {
    root: Value,
    next_watch_id: WatchId,
    watchers: HashMap<WatchId, Watcher>,
    connections: HashMap<ConnectionId, Slot>,
    faults: Faults,
}

struct Watcher {
    connection_id: ConnectionId,
    path: String,
    last: Option<Value>,
    sender: WatchSender,
}

#[derive(Default)]
struct Slot {
    connected: bool,
    deferred: Updates,
}

#[derive(Default)]
struct Faults {
    denied: Vec<String>,
    failing: Vec<FailRule>,
    non_atomic: bool,
}

struct FailRule {
    prefix: String,
    remaining: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::from_parts(Value::Object(Default::default()), None)
    }

    /// Store whose writes are persisted to `db`; the tree is loaded from it.
    pub fn with_database(db: Database) -> anyhow::Result<Self> {
        let root = db.load_tree()?;
        Ok(Self::from_parts(root, Some(db)))
    }

    fn from_parts(root: Value, db: Option<Database>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    root,
                    next_watch_id: 1,
                    watchers: HashMap::new(),
                    connections: HashMap::new(),
                    faults: Faults::default(),
                }),
                db,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a new live connection.
    pub fn connect(&self) -> MemoryClient {
        let id = Uuid::new_v4();
        self.state().connections.insert(
            id,
            Slot {
                connected: true,
                deferred: Updates::new(),
            },
        );
        debug!("Connection {} opened", id);
        MemoryClient {
            store: self.clone(),
            id,
        }
    }

    /// Read without going through a connection.
    pub fn peek(&self, path: &str) -> Option<Value> {
        tree::get(&self.state().root, path)
    }

    pub fn connection_count(&self) -> usize {
        self.state().connections.len()
    }

    pub fn watch_count(&self) -> usize {
        self.state().watchers.len()
    }

    pub fn deferred_count(&self, id: ConnectionId) -> usize {
        self.state()
            .connections
            .get(&id)
            .map_or(0, |slot| slot.deferred.len())
    }

    // -- Fault injection --

    /// Reject every write (and deferred registration) touching `prefix`.
    pub fn deny_writes_under(&self, prefix: &str) {
        self.state().faults.denied.push(tree::canonical(prefix));
    }

    /// Fail the next `times` writes touching `prefix` as if the store
    /// were unreachable.
    pub fn fail_writes_under(&self, prefix: &str, times: usize) {
        self.state().faults.failing.push(FailRule {
            prefix: tree::canonical(prefix),
            remaining: times,
        });
    }

    /// With `false`, a multi-path write is applied one path at a time and
    /// may stop part way.
    pub fn set_atomic(&self, atomic: bool) {
        self.state().faults.non_atomic = !atomic;
    }

    pub fn clear_faults(&self) {
        self.state().faults = Faults::default();
    }

    // -- Connection lifecycle --

    /// The socket of `id` is gone: run its deferred writes and tell its
    /// `.info/connected` watchers.
    pub fn drop_connection(&self, id: ConnectionId) {
        let mut state = self.state();
        let deferred = match state.connections.get_mut(&id) {
            Some(slot) if slot.connected => {
                slot.connected = false;
                std::mem::take(&mut slot.deferred)
            }
            _ => return,
        };

        info!("Connection {} lost, applying {} deferred writes", id, deferred.len());
        if let Err(e) = self.commit(&mut state, deferred) {
            warn!("Deferred writes for {} failed: {}", id, e);
        }
        state.send_connected(id, false);
    }

    /// Bring a dropped connection back; its watches resume.
    pub fn restore_connection(&self, id: ConnectionId) {
        let mut state = self.state();
        match state.connections.get_mut(&id) {
            Some(slot) if !slot.connected => slot.connected = true,
            _ => return,
        }

        info!("Connection {} restored", id);
        state.send_connected(id, true);
        state.resync(id);
    }

    /// Drop the connection and forget everything it registered.
    pub fn close_connection(&self, id: ConnectionId) {
        self.drop_connection(id);
        let mut state = self.state();
        if state.connections.remove(&id).is_some() {
            state.watchers.retain(|_, w| w.connection_id != id);
            debug!("Connection {} closed", id);
        }
    }

    // -- Operations --

    fn write(&self, conn: ConnectionId, updates: Updates) -> Result<(), StoreError> {
        for path in updates.paths() {
            tree::validate_write_path(path)?;
        }

        let mut state = self.state();
        state.ensure_connected(conn)?;
        state.check_denied(&updates)?;

        if state.faults.non_atomic {
            for (path, value) in updates {
                let mut single = Updates::new();
                single.set(path, value);
                state.check_failing(&single)?;
                self.commit(&mut state, single)?;
            }
            Ok(())
        } else {
            state.check_failing(&updates)?;
            self.commit(&mut state, updates)
        }
    }

    fn register_deferred(&self, conn: ConnectionId, updates: Updates) -> Result<(), StoreError> {
        for path in updates.paths() {
            tree::validate_write_path(path)?;
        }

        let mut state = self.state();
        state.ensure_connected(conn)?;
        state.check_denied(&updates)?;

        if let Some(slot) = state.connections.get_mut(&conn) {
            debug!("Connection {} registered {} deferred writes", conn, updates.len());
            slot.deferred.extend(updates);
        }
        Ok(())
    }

    fn cancel_deferred(&self, conn: ConnectionId) -> Result<(), StoreError> {
        let mut state = self.state();
        state.ensure_connected(conn)?;
        if let Some(slot) = state.connections.get_mut(&conn) {
            slot.deferred = Updates::new();
        }
        Ok(())
    }

    fn watch(&self, conn: ConnectionId, path: &str) -> Result<Watch, StoreError> {
        tree::validate_path(path)?;

        let mut state = self.state();
        let initial = if path == CONNECTED {
            let connected = state
                .connections
                .get(&conn)
                .ok_or(StoreError::Disconnected)?
                .connected;
            Some(Value::Bool(connected))
        } else {
            state.ensure_connected(conn)?;
            tree::get(&state.root, path)
        };

        let path = if path == CONNECTED {
            path.to_string()
        } else {
            tree::canonical(path)
        };

        let id = state.next_watch_id;
        state.next_watch_id += 1;

        let (sender, watch) = Watch::channel(id, path.clone());
        sender.send_value(initial.clone());
        state.watchers.insert(
            id,
            Watcher {
                connection_id: conn,
                path,
                last: initial,
                sender,
            },
        );
        Ok(watch)
    }

    fn unwatch(&self, conn: ConnectionId, id: WatchId) {
        let mut state = self.state();
        if state
            .watchers
            .get(&id)
            .is_some_and(|w| w.connection_id == conn)
        {
            state.watchers.remove(&id);
        }
    }

    fn read(&self, conn: ConnectionId, path: &str) -> Result<Option<Value>, StoreError> {
        tree::validate_path(path)?;

        let state = self.state();
        if path == CONNECTED {
            return Ok(state
                .connections
                .get(&conn)
                .map(|slot| Value::Bool(slot.connected)));
        }
        state.ensure_connected(conn)?;
        Ok(tree::get(&state.root, path))
    }

    /// Apply `updates` to the tree (and the database, first) and notify
    /// watchers. Server values resolve here.
    fn commit(&self, state: &mut State, updates: Updates) -> Result<(), StoreError> {
        if updates.is_empty() {
            return Ok(());
        }

        let now = Utc::now().timestamp_millis();
        let changes: Vec<(String, Option<Value>)> = updates
            .into_iter()
            .map(|(path, value)| {
                (
                    tree::canonical(&path),
                    tree::normalize(tree::resolve_server_values(value, now)),
                )
            })
            .collect();

        if let Some(db) = &self.inner.db {
            db.apply(&changes)
                .map_err(|e| StoreError::Persistence(format!("{:#}", e)))?;
        }

        for (path, value) in &changes {
            tree::set(&mut state.root, path, value.clone().unwrap_or(Value::Null));
        }

        let changed: Vec<&str> = changes.iter().map(|(path, _)| path.as_str()).collect();
        state.notify(&changed);
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    fn ensure_connected(&self, conn: ConnectionId) -> Result<(), StoreError> {
        match self.connections.get(&conn) {
            Some(slot) if slot.connected => Ok(()),
            _ => Err(StoreError::Disconnected),
        }
    }

    fn check_denied(&self, updates: &Updates) -> Result<(), StoreError> {
        for path in updates.paths() {
            if self.faults.denied.iter().any(|prefix| paths::is_prefix(prefix, path)) {
                return Err(StoreError::PermissionDenied {
                    path: path.to_string(),
                });
            }
        }
        Ok(())
    }

    fn check_failing(&mut self, updates: &Updates) -> Result<(), StoreError> {
        for rule in self.faults.failing.iter_mut() {
            if rule.remaining == 0 {
                continue;
            }
            if let Some(path) = updates.paths().find(|p| paths::is_prefix(&rule.prefix, p)) {
                rule.remaining -= 1;
                return Err(StoreError::Unavailable(format!("write to {} timed out", path)));
            }
        }
        Ok(())
    }

    fn notify(&mut self, changed: &[&str]) {
        let State {
            root,
            watchers,
            connections,
            ..
        } = self;

        watchers.retain(|id, w| {
            let live = connections
                .get(&w.connection_id)
                .is_some_and(|slot| slot.connected);
            if w.path == CONNECTED || !live || !changed.iter().any(|p| paths::overlaps(p, &w.path)) {
                return !w.sender.is_closed();
            }

            let current = tree::get(root, &w.path);
            if current == w.last {
                return true;
            }
            trace!("Watch {} fired at {}", id, w.path);
            w.last = current.clone();
            w.sender.send_value(current)
        });
    }

    fn send_connected(&mut self, conn: ConnectionId, connected: bool) {
        self.watchers.retain(|_, w| {
            if w.connection_id != conn || w.path != CONNECTED {
                return true;
            }
            w.last = Some(Value::Bool(connected));
            w.sender.send_value(Some(Value::Bool(connected)))
        });
    }

    /// Re-deliver values that changed while `conn` was away.
    fn resync(&mut self, conn: ConnectionId) {
        let State { root, watchers, .. } = self;
        watchers.retain(|_, w| {
            if w.connection_id != conn || w.path == CONNECTED {
                return true;
            }
            let current = tree::get(root, &w.path);
            if current == w.last {
                return true;
            }
            w.last = current.clone();
            w.sender.send_value(current)
        });
    }
}

/// One connection to a [`MemoryStore`]. Dropping it closes the connection,
/// which runs its deferred writes like an abrupt socket loss would.
pub struct MemoryClient {
    store: MemoryStore,
    id: ConnectionId,
}

impl MemoryClient {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Simulate losing the socket without a goodbye.
    pub fn disconnect(&self) {
        self.store.drop_connection(self.id);
    }

    pub fn reconnect(&self) {
        self.store.restore_connection(self.id);
    }

    pub fn is_connected(&self) -> bool {
        self.store
            .state()
            .connections
            .get(&self.id)
            .is_some_and(|slot| slot.connected)
    }
}

impl Drop for MemoryClient {
    fn drop(&mut self) {
        self.store.close_connection(self.id);
    }
}

#[async_trait]
impl StoreClient for MemoryClient {
    async fn write(&self, updates: Updates) -> Result<(), StoreError> {
        self.store.write(self.id, updates)
    }

    async fn register_deferred_write(&self, updates: Updates) -> Result<(), StoreError> {
        self.store.register_deferred(self.id, updates)
    }

    async fn cancel_deferred_writes(&self) -> Result<(), StoreError> {
        self.store.cancel_deferred(self.id)
    }

    async fn watch(&self, path: &str) -> Result<Watch, StoreError> {
        self.store.watch(self.id, path)
    }

    async fn unwatch(&self, id: WatchId) -> Result<(), StoreError> {
        self.store.unwatch(self.id, id);
        Ok(())
    }

    async fn read_once(&self, path: &str) -> Result<Option<Value>, StoreError> {
        self.store.read(self.id, path)
    }

    fn atomic_multi_path(&self) -> bool {
        !self.store.state().faults.non_atomic
    }
}
