pub mod ids;
pub mod models;
pub mod paths;
pub mod protocol;
pub mod updates;

pub use ids::{Category, ChannelId, InvalidKey, MessageId, Role, RoomId, Uid};
pub use models::{
    ChannelMembership, ChannelRecord, OnlineUser, Room, RoomRecord, Status, UserChannelEntry,
    UserProfile, UserRecord,
};
pub use updates::{Updates, server_timestamp};
