//! Store layout.
//!
//! ```text
//! users/{uid}/{displayName, email, photoURL, color, isOnline, lastLoggedIn}
//! users/{uid}/channels/{channel}                    -> role
//! users/{uid}/unread_rooms/{channel}/{room}         -> true
//! users/{uid}/mentions/{channel}/{room}/{message}   -> true
//! Channels/{channel}/{name, icon, isPrivate}
//! Channels/{channel}/room_categories/{category}     -> true
//! Channels/{channel}/rooms/{room}                   -> {name, category}
//! Channels/{channel}/user_roles/{role}              -> true
//! Channels/{channel}/users/{uid}                    -> {displayName, avatar, color, role, status}
//! Channels/{channel}/online_users/{uid}             -> {displayName, avatar, color, role}
//! ```

use crate::ids::{Category, ChannelId, MessageId, Role, RoomId, Uid};

/// Per-connection liveness flag maintained by the store itself.
pub const CONNECTED: &str = ".info/connected";

pub const USERS: &str = "users";
pub const CHANNELS: &str = "Channels";

/// Split a path into its non-empty segments.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// True if `ancestor` equals `path` or is one of its parents.
pub fn is_prefix(ancestor: &str, path: &str) -> bool {
    let mut a = segments(ancestor);
    let mut p = segments(path);
    loop {
        match (a.next(), p.next()) {
            (None, _) => return true,
            (Some(_), None) => return false,
            (Some(x), Some(y)) if x != y => return false,
            _ => {}
        }
    }
}

/// True if a change at one path can affect the value observed at the other.
pub fn overlaps(a: &str, b: &str) -> bool {
    is_prefix(a, b) || is_prefix(b, a)
}

// -- users/ --

pub fn user(uid: &Uid) -> String {
    format!("{}/{}", USERS, uid)
}

pub fn user_field(uid: &Uid, field: &str) -> String {
    format!("{}/{}/{}", USERS, uid, field)
}

pub fn user_is_online(uid: &Uid) -> String {
    user_field(uid, "isOnline")
}

pub fn user_last_logged_in(uid: &Uid) -> String {
    user_field(uid, "lastLoggedIn")
}

pub fn user_channels(uid: &Uid) -> String {
    user_field(uid, "channels")
}

pub fn user_channel(uid: &Uid, channel: &ChannelId) -> String {
    format!("{}/channels/{}", user(uid), channel)
}

pub fn unread_rooms(uid: &Uid, channel: &ChannelId) -> String {
    format!("{}/unread_rooms/{}", user(uid), channel)
}

pub fn unread_room(uid: &Uid, channel: &ChannelId, room: &RoomId) -> String {
    format!("{}/{}", unread_rooms(uid, channel), room)
}

pub fn mentions(uid: &Uid, channel: &ChannelId) -> String {
    format!("{}/mentions/{}", user(uid), channel)
}

pub fn mention(uid: &Uid, channel: &ChannelId, room: &RoomId, message: &MessageId) -> String {
    format!("{}/{}/{}", mentions(uid, channel), room, message)
}

// -- Channels/ --

pub fn channel(channel: &ChannelId) -> String {
    format!("{}/{}", CHANNELS, channel)
}

pub fn channel_field(channel_id: &ChannelId, field: &str) -> String {
    format!("{}/{}", channel(channel_id), field)
}

pub fn channel_name(channel_id: &ChannelId) -> String {
    channel_field(channel_id, "name")
}

pub fn rooms(channel_id: &ChannelId) -> String {
    channel_field(channel_id, "rooms")
}

pub fn room(channel_id: &ChannelId, room: &RoomId) -> String {
    format!("{}/{}", rooms(channel_id), room)
}

pub fn room_categories(channel_id: &ChannelId) -> String {
    channel_field(channel_id, "room_categories")
}

pub fn room_category(channel_id: &ChannelId, category: &Category) -> String {
    format!("{}/{}", room_categories(channel_id), category)
}

pub fn user_roles(channel_id: &ChannelId) -> String {
    channel_field(channel_id, "user_roles")
}

pub fn user_role(channel_id: &ChannelId, role: &Role) -> String {
    format!("{}/{}", user_roles(channel_id), role)
}

pub fn members(channel_id: &ChannelId) -> String {
    channel_field(channel_id, "users")
}

pub fn member(channel_id: &ChannelId, uid: &Uid) -> String {
    format!("{}/{}", members(channel_id), uid)
}

pub fn member_field(channel_id: &ChannelId, uid: &Uid, field: &str) -> String {
    format!("{}/{}", member(channel_id, uid), field)
}

pub fn online_users(channel_id: &ChannelId) -> String {
    channel_field(channel_id, "online_users")
}

pub fn online_user(channel_id: &ChannelId, uid: &Uid) -> String {
    format!("{}/{}", online_users(channel_id), uid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_is_segment_wise() {
        assert!(is_prefix("users/a", "users/a/channels"));
        assert!(is_prefix("users/a", "users/a"));
        assert!(is_prefix("", "users/a"));
        assert!(!is_prefix("users/a", "users/ab"));
        assert!(!is_prefix("users/a/channels", "users/a"));
        assert!(overlaps("users/a/channels", "users/a"));
        assert!(!overlaps("users/a", "Channels/a"));
    }

    #[test]
    fn layout() {
        let uid = Uid::new("u1").unwrap();
        let channel_id = ChannelId::new("general").unwrap();
        let room_id = RoomId::new("welcome").unwrap();
        assert_eq!(user_channel(&uid, &channel_id), "users/u1/channels/general");
        assert_eq!(
            unread_room(&uid, &channel_id, &room_id),
            "users/u1/unread_rooms/general/welcome"
        );
        assert_eq!(member(&channel_id, &uid), "Channels/general/users/u1");
        assert_eq!(online_user(&channel_id, &uid), "Channels/general/online_users/u1");
    }
}
