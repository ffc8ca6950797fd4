use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::ids::{Category, ChannelId, MessageId, Role, RoomId, Uid};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Online,
    #[default]
    Offline,
}

/// Profile handed over by the identity provider once a user is signed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub uid: Uid,
    pub display_name: String,
    pub email: String,
    pub photo_url: String,
    pub color: String,
}

/// `users/{uid}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(rename = "photoURL", default)]
    pub photo_url: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub is_online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_logged_in: Option<i64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub channels: BTreeMap<ChannelId, Role>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub mentions: BTreeMap<ChannelId, BTreeMap<RoomId, BTreeMap<MessageId, bool>>>,
    #[serde(rename = "unread_rooms", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub unread_rooms: BTreeMap<ChannelId, BTreeMap<RoomId, bool>>,
}

impl UserRecord {
    /// Fresh record for a newly registered user, not yet online.
    pub fn from_profile(profile: &UserProfile) -> Self {
        Self {
            display_name: profile.display_name.clone(),
            email: profile.email.clone(),
            photo_url: profile.photo_url.clone(),
            color: profile.color.clone(),
            ..Self::default()
        }
    }

    /// The user-side mirror entry for one channel.
    pub fn channel_entry(&self, channel_id: &ChannelId) -> Option<UserChannelEntry> {
        let role = self.channels.get(channel_id)?.clone();

        let unread_rooms = self
            .unread_rooms
            .get(channel_id)
            .map(|rooms| rooms.keys().cloned().collect())
            .unwrap_or_default();

        let mentions = self
            .mentions
            .get(channel_id)
            .map(|rooms| {
                rooms
                    .iter()
                    .map(|(room, messages)| (room.clone(), messages.keys().cloned().collect()))
                    .collect()
            })
            .unwrap_or_default();

        Some(UserChannelEntry {
            channel_id: channel_id.clone(),
            role,
            unread_rooms,
            mentions,
        })
    }
}

/// User-side view of one membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserChannelEntry {
    pub channel_id: ChannelId,
    pub role: Role,
    pub unread_rooms: BTreeSet<RoomId>,
    pub mentions: BTreeMap<RoomId, BTreeSet<MessageId>>,
}

/// `Channels/{channel}/users/{uid}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMembership {
    pub display_name: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub color: String,
    pub role: Role,
    #[serde(default)]
    pub status: Status,
}

/// `Channels/{channel}/online_users/{uid}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUser {
    pub display_name: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub color: String,
    pub role: Role,
}

/// `Channels/{channel}/rooms/{room}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub category: Option<Category>,
}

/// `Channels/{channel}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRecord {
    pub name: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub is_private: bool,
    #[serde(rename = "room_categories", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub room_categories: BTreeMap<Category, bool>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rooms: BTreeMap<RoomId, RoomRecord>,
    #[serde(rename = "user_roles", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub user_roles: BTreeMap<Role, bool>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub users: BTreeMap<Uid, ChannelMembership>,
    #[serde(rename = "online_users", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub online_users: BTreeMap<Uid, OnlineUser>,
}

impl ChannelRecord {
    pub fn room_list(&self) -> Vec<Room> {
        self.rooms
            .iter()
            .map(|(id, room)| Room {
                id: id.clone(),
                name: room.name.clone(),
                category: room.category.clone(),
            })
            .collect()
    }
}
