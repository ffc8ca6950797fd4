//! One signed-in user on one store connection.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use parlor_store::{StoreClient, Watch};
use parlor_types::protocol::WatchId;
use parlor_types::{ChannelId, Role, UserProfile, paths};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::fetch::decode;
use crate::listeners::{Attach, ListenerKey, ListenerKind, ListenerRegistry};
use crate::{
    ChannelDirectory, ConnectionMonitor, MembershipMirror, PresenceController, PresencePhase,
    SyncConfig, SyncError, UnreadTracker, UserDirectory,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Online markers written for this many channels.
    Online { channels: usize },
    /// Connection lost; listeners were released.
    Offline,
    /// Going online failed; retried on the next reconnect.
    Error { message: String },
}

pub struct Session {
    store: Arc<dyn StoreClient>,
    profile: UserProfile,
    monitor: ConnectionMonitor,
    presence: Arc<PresenceController>,
    listeners: Arc<ListenerRegistry>,
    users: UserDirectory,
    channels: ChannelDirectory,
    unread: UnreadTracker,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    driver: Option<JoinHandle<()>>,
    /// Watch on the user's channel list, opened by the driver.
    channel_watch: Arc<Mutex<Option<WatchId>>>,
}

impl Session {
    /// Watch the connection and go online on every `connected = true`, and
    /// again whenever the user's channel list changes while online.
    pub async fn start(
        store: Arc<dyn StoreClient>,
        profile: UserProfile,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        let mirror = MembershipMirror::new(store.clone(), config);
        let users = UserDirectory::new(store.clone(), mirror.clone());
        let channels = ChannelDirectory::new(store.clone(), mirror);
        let unread = UnreadTracker::new(store.clone());
        let presence = Arc::new(PresenceController::new(store.clone(), profile.clone()));
        let listeners = Arc::new(ListenerRegistry::new(store.clone()));

        let monitor = ConnectionMonitor::start(store.clone()).await?;
        let (event_tx, events) = mpsc::unbounded_channel();
        let channel_watch = Arc::new(Mutex::new(None));

        let driver = tokio::spawn(
            Driver {
                store: store.clone(),
                events: event_tx,
                presence: presence.clone(),
                listeners: listeners.clone(),
                users: users.clone(),
                watch_slot: channel_watch.clone(),
                channel_list: None,
                online_with: None,
            }
            .run(monitor.subscribe()),
        );

        info!("Session started for {} ({})", profile.display_name, profile.uid);
        Ok(Self {
            store,
            profile,
            monitor,
            presence,
            listeners,
            users,
            channels,
            unread,
            events,
            driver: Some(driver),
            channel_watch,
        })
    }

    pub fn profile(&self) -> &UserProfile {
        &self.profile
    }

    pub fn presence(&self) -> &PresenceController {
        &self.presence
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    pub fn users(&self) -> &UserDirectory {
        &self.users
    }

    pub fn channels(&self) -> &ChannelDirectory {
        &self.channels
    }

    pub fn unread(&self) -> &UnreadTracker {
        &self.unread
    }

    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Attach every listener kind for `channel_id`. Kinds already attached
    /// are skipped, so only new watches are returned.
    pub async fn open_channel(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Vec<(ListenerKind, parlor_store::Watch)>, SyncError> {
        if self.driver.is_none() {
            return Err(SyncError::SessionClosed);
        }

        let mut watches = Vec::new();
        for kind in ListenerKind::ALL {
            let key = ListenerKey::new(channel_id.clone(), self.profile.uid.clone(), kind);
            if let Attach::Attached(watch) = self.listeners.attach(key).await? {
                watches.push((kind, watch));
            }
        }
        Ok(watches)
    }

    pub async fn close_channel(&self, channel_id: &ChannelId) -> usize {
        self.listeners.detach_all(channel_id, &self.profile.uid).await
    }

    /// Mark the user offline, release every listener and the connection
    /// watch. A second call does nothing.
    pub async fn logout(&mut self) -> Result<(), SyncError> {
        let Some(driver) = self.driver.take() else {
            return Ok(());
        };
        driver.abort();

        let result = self.presence.logout().await;
        let released = self.listeners.detach_user(&self.profile.uid).await;
        let watch = self
            .channel_watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = watch {
            self.store.unwatch(id).await?;
        }
        self.monitor.stop().await?;

        info!("Session for {} closed, {} listeners released", self.profile.uid, released);
        result
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

struct Driver {
    store: Arc<dyn StoreClient>,
    events: mpsc::UnboundedSender<SessionEvent>,
    presence: Arc<PresenceController>,
    listeners: Arc<ListenerRegistry>,
    users: UserDirectory,
    watch_slot: Arc<Mutex<Option<WatchId>>>,
    channel_list: Option<Watch>,
    /// Channel list the current online markers were written for.
    online_with: Option<Vec<(ChannelId, Role)>>,
}

impl Driver {
    async fn run(mut self, mut transitions: mpsc::UnboundedReceiver<bool>) {
        loop {
            let event = tokio::select! {
                transition = transitions.recv() => match transition {
                    Some(true) => self.on_connected().await,
                    Some(false) => self.on_disconnected().await,
                    None => break,
                },
                value = next_value(&mut self.channel_list) => match value {
                    Some(value) => match self.on_channel_list(value).await {
                        Some(event) => event,
                        None => continue,
                    },
                    None => {
                        self.channel_list = None;
                        continue;
                    }
                },
            };

            if self.events.send(event).is_err() {
                break;
            }
        }
    }

    async fn on_connected(&mut self) -> SessionEvent {
        let uid = self.presence.profile().uid.clone();
        if self.channel_list.is_none() {
            match self.store.watch(&paths::user_channels(&uid)).await {
                Ok(watch) => {
                    *self.watch_slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(watch.id);
                    self.channel_list = Some(watch);
                }
                Err(e) => warn!("Could not watch channel list of {}: {}", uid, e),
            }
        }

        let result = match self.users.channel_list(&uid).await {
            Ok(channels) => self.go_online(channels).await,
            Err(e) => Err(e),
        };
        self.settle(result)
    }

    async fn on_disconnected(&mut self) -> SessionEvent {
        let uid = &self.presence.profile().uid;
        self.presence.on_connection_changed(false);
        self.listeners.detach_user(uid).await;
        self.online_with = None;
        SessionEvent::Offline
    }

    /// Re-run `go_online` when the channel list moved under an online user.
    async fn on_channel_list(&mut self, value: Option<Value>) -> Option<SessionEvent> {
        if self.presence.phase() != PresencePhase::Online {
            return None;
        }

        let path = paths::user_channels(&self.presence.profile().uid);
        let channels: BTreeMap<ChannelId, Role> = match value {
            Some(value) => match decode(&path, value) {
                Ok(channels) => channels,
                Err(e) => return Some(self.settle(Err(e))),
            },
            None => BTreeMap::new(),
        };
        let channels: Vec<(ChannelId, Role)> = channels.into_iter().collect();
        if self.online_with.as_ref() == Some(&channels) {
            return None;
        }

        debug!("Channel list of {} changed, refreshing presence", self.presence.profile().uid);
        let result = self.go_online(channels).await;
        Some(self.settle(result))
    }

    async fn go_online(&mut self, channels: Vec<(ChannelId, Role)>) -> Result<usize, SyncError> {
        self.presence.go_online(&channels).await?;
        self.online_with = Some(channels);
        Ok(self.presence.channels().len())
    }

    fn settle(&self, result: Result<usize, SyncError>) -> SessionEvent {
        match result {
            Ok(channels) => SessionEvent::Online { channels },
            Err(e) => {
                warn!("{} could not go online: {}", self.presence.profile().uid, e);
                SessionEvent::Error {
                    message: e.to_string(),
                }
            }
        }
    }
}

async fn next_value(watch: &mut Option<Watch>) -> Option<Option<Value>> {
    match watch {
        Some(watch) => watch.values.recv().await,
        None => std::future::pending().await,
    }
}
