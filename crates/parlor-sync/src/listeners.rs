//! Live listeners per (channel, user, kind).
//!
//! A key moves `Attaching -> Attached -> Detached`. Attaching an attached
//! (or attaching) key is a no-op, detaching releases the store watch exactly
//! once, and a detached key may be attached again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use parlor_store::{StoreClient, Watch};
use parlor_types::protocol::WatchId;
use parlor_types::{ChannelId, Uid, paths};
use tracing::{debug, warn};

use crate::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ListenerKind {
    UserRoles,
    RoomCategories,
    Rooms,
    UnreadRooms,
    OnlineUsers,
}

impl ListenerKind {
    pub const ALL: [ListenerKind; 5] = [
        ListenerKind::UserRoles,
        ListenerKind::RoomCategories,
        ListenerKind::Rooms,
        ListenerKind::UnreadRooms,
        ListenerKind::OnlineUsers,
    ];

    /// Store path watched for this kind.
    pub fn path(self, channel_id: &ChannelId, uid: &Uid) -> String {
        match self {
            Self::UserRoles => paths::user_roles(channel_id),
            Self::RoomCategories => paths::room_categories(channel_id),
            Self::Rooms => paths::rooms(channel_id),
            Self::UnreadRooms => paths::unread_rooms(uid, channel_id),
            Self::OnlineUsers => paths::online_users(channel_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerKey {
    pub channel_id: ChannelId,
    pub uid: Uid,
    pub kind: ListenerKind,
}

impl ListenerKey {
    pub fn new(channel_id: ChannelId, uid: Uid, kind: ListenerKind) -> Self {
        Self {
            channel_id,
            uid,
            kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Attaching,
    Attached,
    Detached,
}

#[derive(Debug)]
pub enum Attach {
    /// A new store watch; the caller consumes its values.
    Attached(Watch),
    AlreadyAttached,
    /// Detached while the watch was being set up; it has been released.
    Superseded,
}

pub struct ListenerRegistry {
    store: Arc<dyn StoreClient>,
    inner: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<ListenerKey, Entry>,
    next_generation: u64,
    attached_total: u64,
    released_total: u64,
}

struct Entry {
    state: ListenerState,
    generation: u64,
    watch_id: Option<WatchId>,
}

impl ListenerRegistry {
    pub fn new(store: Arc<dyn StoreClient>) -> Self {
        Self {
            store,
            inner: Mutex::new(RegistryState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn attach(&self, key: ListenerKey) -> Result<Attach, SyncError> {
        let generation = {
            let mut inner = self.lock();
            if let Some(entry) = inner.entries.get(&key) {
                if entry.state != ListenerState::Detached {
                    return Ok(Attach::AlreadyAttached);
                }
            }
            inner.next_generation += 1;
            let generation = inner.next_generation;
            inner.entries.insert(
                key.clone(),
                Entry {
                    state: ListenerState::Attaching,
                    generation,
                    watch_id: None,
                },
            );
            generation
        };

        let path = key.kind.path(&key.channel_id, &key.uid);
        let watch = match self.store.watch(&path).await {
            Ok(watch) => watch,
            Err(e) => {
                let mut inner = self.lock();
                if inner
                    .entries
                    .get(&key)
                    .is_some_and(|entry| entry.generation == generation)
                {
                    inner.entries.remove(&key);
                }
                return Err(e.into());
            }
        };

        let claimed = {
            let mut inner = self.lock();
            match inner.entries.get_mut(&key) {
                Some(entry)
                    if entry.generation == generation
                        && entry.state == ListenerState::Attaching =>
                {
                    entry.state = ListenerState::Attached;
                    entry.watch_id = Some(watch.id);
                    inner.attached_total += 1;
                    true
                }
                _ => false,
            }
        };

        if claimed {
            debug!("Attached {:?} for {} in {}", key.kind, key.uid, key.channel_id);
            return Ok(Attach::Attached(watch));
        }

        self.release(watch.id).await;
        Ok(Attach::Superseded)
    }

    /// Returns true when a live store watch was released.
    pub async fn detach(&self, key: &ListenerKey) -> bool {
        let watch_id = {
            let mut inner = self.lock();
            let Some(entry) = inner.entries.get_mut(key) else {
                return false;
            };
            if entry.state == ListenerState::Detached {
                return false;
            }
            entry.state = ListenerState::Detached;
            let watch_id = entry.watch_id.take();
            if watch_id.is_some() {
                inner.released_total += 1;
            }
            watch_id
        };

        match watch_id {
            Some(id) => {
                self.release(id).await;
                debug!("Detached {:?} for {} in {}", key.kind, key.uid, key.channel_id);
                true
            }
            None => false,
        }
    }

    /// Detach every kind for (channel, user). Idempotent.
    pub async fn detach_all(&self, channel_id: &ChannelId, uid: &Uid) -> usize {
        let mut released = 0;
        for kind in ListenerKind::ALL {
            let key = ListenerKey::new(channel_id.clone(), uid.clone(), kind);
            if self.detach(&key).await {
                released += 1;
            }
        }
        released
    }

    /// Detach every listener of `uid` across channels.
    pub async fn detach_user(&self, uid: &Uid) -> usize {
        let keys: Vec<ListenerKey> = self
            .lock()
            .entries
            .iter()
            .filter(|(key, entry)| &key.uid == uid && entry.state != ListenerState::Detached)
            .map(|(key, _)| key.clone())
            .collect();

        let mut released = 0;
        for key in keys {
            if self.detach(&key).await {
                released += 1;
            }
        }
        released
    }

    pub fn state(&self, key: &ListenerKey) -> Option<ListenerState> {
        self.lock().entries.get(key).map(|entry| entry.state)
    }

    /// Listeners currently attached or attaching.
    pub fn active_count(&self) -> usize {
        self.lock()
            .entries
            .values()
            .filter(|entry| entry.state != ListenerState::Detached)
            .count()
    }

    /// (watches ever attached, watches ever released)
    pub fn totals(&self) -> (u64, u64) {
        let inner = self.lock();
        (inner.attached_total, inner.released_total)
    }

    async fn release(&self, id: WatchId) {
        if let Err(e) = self.store.unwatch(id).await {
            warn!("Failed to release watch {}: {}", id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parlor_store::MemoryStore;

    fn key(kind: ListenerKind) -> ListenerKey {
        ListenerKey::new(
            ChannelId::from_static("general"),
            Uid::from_static("ada"),
            kind,
        )
    }

    #[tokio::test]
    async fn double_attach_then_detach_all_leaves_nothing() {
        let store = MemoryStore::new();
        let registry = ListenerRegistry::new(Arc::new(store.connect()));

        let first = registry.attach(key(ListenerKind::Rooms)).await.unwrap();
        assert!(matches!(first, Attach::Attached(_)));
        let second = registry.attach(key(ListenerKind::Rooms)).await.unwrap();
        assert!(matches!(second, Attach::AlreadyAttached));
        assert_eq!(store.watch_count(), 1);

        let released = registry
            .detach_all(&ChannelId::from_static("general"), &Uid::from_static("ada"))
            .await;
        assert_eq!(released, 1);
        assert_eq!(registry.active_count(), 0);
        assert_eq!(store.watch_count(), 0);
        assert_eq!(registry.totals(), (1, 1));

        // second detach is a no-op
        assert_eq!(
            registry
                .detach_all(&ChannelId::from_static("general"), &Uid::from_static("ada"))
                .await,
            0
        );
        assert_eq!(
            registry.state(&key(ListenerKind::Rooms)),
            Some(ListenerState::Detached)
        );
    }

    #[tokio::test]
    async fn detached_keys_can_attach_again() {
        let store = MemoryStore::new();
        let registry = ListenerRegistry::new(Arc::new(store.connect()));

        registry.attach(key(ListenerKind::OnlineUsers)).await.unwrap();
        registry.detach(&key(ListenerKind::OnlineUsers)).await;
        let again = registry.attach(key(ListenerKind::OnlineUsers)).await.unwrap();

        assert!(matches!(again, Attach::Attached(_)));
        assert_eq!(registry.active_count(), 1);
        assert_eq!(registry.totals(), (2, 1));
    }

    #[tokio::test]
    async fn failed_attach_can_be_retried() {
        let store = MemoryStore::new();
        let client = store.connect();
        client.disconnect();
        let registry = ListenerRegistry::new(Arc::new(client));

        assert!(registry.attach(key(ListenerKind::UserRoles)).await.is_err());
        assert_eq!(registry.state(&key(ListenerKind::UserRoles)), None);
    }

    #[tokio::test]
    async fn detach_user_spans_channels() {
        let store = MemoryStore::new();
        let registry = ListenerRegistry::new(Arc::new(store.connect()));
        let ada = Uid::from_static("ada");

        for channel in ["general", "random"] {
            for kind in ListenerKind::ALL {
                registry
                    .attach(ListenerKey::new(ChannelId::from_static(channel), ada.clone(), kind))
                    .await
                    .unwrap();
            }
        }
        assert_eq!(store.watch_count(), 10);

        assert_eq!(registry.detach_user(&ada).await, 10);
        assert_eq!(store.watch_count(), 0);
    }
}
