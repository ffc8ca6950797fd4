//! Per-user unread rooms and mention flags.
//!
//! A room is unread while `users/{uid}/unread_rooms/{channel}/{room}` exists.
//! Every operation here is a plain set or delete of leaves, so repeating it
//! changes nothing.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parlor_store::StoreClient;
use parlor_types::{ChannelId, MessageId, RoomId, Uid, Updates, paths};
use serde::de::IgnoredAny;
use tracing::debug;

use crate::SyncError;
use crate::fetch::{exists, read_as, read_keys};

#[derive(Clone)]
pub struct UnreadTracker {
    store: Arc<dyn StoreClient>,
}

impl UnreadTracker {
    pub fn new(store: Arc<dyn StoreClient>) -> Self {
        Self { store }
    }

    /// Mark `room_id` unread for every current member of the channel.
    pub async fn on_room_created(
        &self,
        channel_id: &ChannelId,
        room_id: &RoomId,
    ) -> Result<(), SyncError> {
        let members: Vec<Uid> = read_keys(&*self.store, &paths::members(channel_id)).await?;
        if members.is_empty() {
            return Ok(());
        }

        let mut updates = Updates::new();
        for uid in &members {
            updates.set(paths::unread_room(uid, channel_id, room_id), true);
        }
        self.store.write(updates).await?;

        debug!("Room {} in {} unread for {} members", room_id, channel_id, members.len());
        Ok(())
    }

    /// Unread flags for every room currently in the channel.
    pub async fn seed_updates(
        &self,
        uid: &Uid,
        channel_id: &ChannelId,
    ) -> Result<Updates, SyncError> {
        let rooms: Vec<RoomId> = read_keys(&*self.store, &paths::rooms(channel_id)).await?;
        Ok(rooms
            .iter()
            .map(|room| (paths::unread_room(uid, channel_id, room), true.into()))
            .collect())
    }

    /// Seed unread rooms for a user joining the channel. Does nothing if the
    /// user already holds a membership entry there.
    pub async fn on_subscribe(&self, uid: &Uid, channel_id: &ChannelId) -> Result<(), SyncError> {
        if exists(&*self.store, &paths::user_channel(uid, channel_id)).await? {
            return Ok(());
        }

        let seed = self.seed_updates(uid, channel_id).await?;
        if seed.is_empty() {
            return Ok(());
        }
        self.store.write(seed).await?;
        Ok(())
    }

    pub async fn mark_read(
        &self,
        uid: &Uid,
        channel_id: &ChannelId,
        room_id: &RoomId,
    ) -> Result<(), SyncError> {
        let mut updates = Updates::new();
        updates.remove(paths::unread_room(uid, channel_id, room_id));
        self.store.write(updates).await?;
        Ok(())
    }

    /// Flag `message_id` as mentioning `uid`. Never cleared here.
    pub async fn on_mention(
        &self,
        uid: &Uid,
        channel_id: &ChannelId,
        room_id: &RoomId,
        message_id: &MessageId,
    ) -> Result<(), SyncError> {
        let mut updates = Updates::new();
        updates.set(paths::mention(uid, channel_id, room_id, message_id), true);
        self.store.write(updates).await?;
        Ok(())
    }

    pub async fn unread_rooms(
        &self,
        uid: &Uid,
        channel_id: &ChannelId,
    ) -> Result<BTreeSet<RoomId>, SyncError> {
        let rooms: Vec<RoomId> = read_keys(&*self.store, &paths::unread_rooms(uid, channel_id)).await?;
        Ok(rooms.into_iter().collect())
    }

    pub async fn mentions(
        &self,
        uid: &Uid,
        channel_id: &ChannelId,
    ) -> Result<BTreeMap<RoomId, BTreeSet<MessageId>>, SyncError> {
        let raw: Option<BTreeMap<RoomId, BTreeMap<MessageId, IgnoredAny>>> =
            read_as(&*self.store, &paths::mentions(uid, channel_id)).await?;

        Ok(raw
            .unwrap_or_default()
            .into_iter()
            .map(|(room, messages)| (room, messages.into_keys().collect()))
            .collect())
    }
}
