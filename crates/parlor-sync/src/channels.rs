//! Channels, rooms, categories and roles.

use std::collections::BTreeMap;
use std::sync::Arc;

use parlor_store::StoreClient;
use parlor_types::{
    Category, ChannelId, ChannelMembership, ChannelRecord, OnlineUser, Role, Room, RoomId,
    RoomRecord, Uid, Updates, UserProfile, paths,
};
use tracing::info;

use crate::fetch::{exists, read_as, read_keys};
use crate::{MembershipMirror, SyncError, UnreadTracker};

#[derive(Clone)]
pub struct ChannelDirectory {
    store: Arc<dyn StoreClient>,
    mirror: MembershipMirror,
    unread: UnreadTracker,
}

impl ChannelDirectory {
    pub fn new(store: Arc<dyn StoreClient>, mirror: MembershipMirror) -> Self {
        Self {
            unread: UnreadTracker::new(store.clone()),
            store,
            mirror,
        }
    }

    // -- Writes --

    /// Create a channel owned by `owner`, who is subscribed with the owner
    /// role.
    pub async fn create_channel(
        &self,
        owner: &UserProfile,
        name: &str,
        is_private: bool,
    ) -> Result<ChannelId, SyncError> {
        let channel_id = ChannelId::generate();
        let config = self.mirror.config();

        let mut updates = Updates::new();
        updates
            .set(paths::channel_name(&channel_id), name)
            .set(paths::channel_field(&channel_id, "icon"), "")
            .set(paths::channel_field(&channel_id, "isPrivate"), is_private)
            .set(paths::user_role(&channel_id, &config.owner_role), true)
            .set(paths::user_role(&channel_id, &config.default_role), true);
        self.store.write(updates).await?;

        let owner_role = config.owner_role.clone();
        self.mirror
            .subscribe_with_role(owner, &channel_id, &owner_role)
            .await?;

        info!("Channel {} ({}) created by {}", name, channel_id, owner.uid);
        Ok(channel_id)
    }

    /// Join an existing channel with the default role.
    pub async fn subscribe_to_channel(
        &self,
        user: &UserProfile,
        channel_id: &ChannelId,
    ) -> Result<(), SyncError> {
        self.ensure_exists(channel_id).await?;
        self.mirror.subscribe_user_to_channel(user, channel_id).await
    }

    /// `url` points at an icon already uploaded elsewhere.
    pub async fn set_channel_icon(&self, channel_id: &ChannelId, url: &str) -> Result<(), SyncError> {
        self.ensure_exists(channel_id).await?;
        let mut updates = Updates::new();
        updates.set(paths::channel_field(channel_id, "icon"), url);
        self.store.write(updates).await?;
        Ok(())
    }

    /// Add a room and mark it unread for every member.
    pub async fn create_room(
        &self,
        channel_id: &ChannelId,
        name: &str,
        category: Option<Category>,
    ) -> Result<RoomId, SyncError> {
        self.ensure_exists(channel_id).await?;

        let room_id = RoomId::generate();
        let room_path = paths::room(channel_id, &room_id);
        let mut updates = Updates::new();
        updates
            .set_record(
                room_path.clone(),
                &RoomRecord {
                    name: name.to_string(),
                    category,
                },
            )
            .map_err(|e| SyncError::decoding(room_path, e))?;
        self.store.write(updates).await?;

        self.unread.on_room_created(channel_id, &room_id).await?;
        info!("Room {} ({}) created in {}", name, room_id, channel_id);
        Ok(room_id)
    }

    pub async fn create_room_category(
        &self,
        channel_id: &ChannelId,
        category: &Category,
    ) -> Result<(), SyncError> {
        self.ensure_exists(channel_id).await?;
        let mut updates = Updates::new();
        updates.set(paths::room_category(channel_id, category), true);
        self.store.write(updates).await?;
        Ok(())
    }

    pub async fn set_room_category(
        &self,
        channel_id: &ChannelId,
        room_id: &RoomId,
        category: &Category,
    ) -> Result<(), SyncError> {
        if !exists(&*self.store, &paths::room(channel_id, room_id)).await? {
            return Err(SyncError::UnknownRoom {
                channel_id: channel_id.clone(),
                room_id: room_id.clone(),
            });
        }
        let mut updates = Updates::new();
        updates
            .set(
                format!("{}/category", paths::room(channel_id, room_id)),
                category.as_str(),
            )
            .set(paths::room_category(channel_id, category), true);
        self.store.write(updates).await?;
        Ok(())
    }

    pub async fn create_user_role(&self, channel_id: &ChannelId, role: &Role) -> Result<(), SyncError> {
        self.ensure_exists(channel_id).await?;
        let mut updates = Updates::new();
        updates.set(paths::user_role(channel_id, role), true);
        self.store.write(updates).await?;
        Ok(())
    }

    // -- Reads --

    pub async fn channel(&self, channel_id: &ChannelId) -> Result<Option<ChannelRecord>, SyncError> {
        read_as(&*self.store, &paths::channel(channel_id)).await
    }

    pub async fn channel_name(&self, channel_id: &ChannelId) -> Result<Option<String>, SyncError> {
        read_as(&*self.store, &paths::channel_name(channel_id)).await
    }

    pub async fn rooms(&self, channel_id: &ChannelId) -> Result<Vec<Room>, SyncError> {
        let rooms: BTreeMap<RoomId, RoomRecord> = read_as(&*self.store, &paths::rooms(channel_id))
            .await?
            .unwrap_or_default();
        Ok(rooms
            .into_iter()
            .map(|(id, room)| Room {
                id,
                name: room.name,
                category: room.category,
            })
            .collect())
    }

    pub async fn room_categories(&self, channel_id: &ChannelId) -> Result<Vec<Category>, SyncError> {
        read_keys(&*self.store, &paths::room_categories(channel_id)).await
    }

    pub async fn user_roles(&self, channel_id: &ChannelId) -> Result<Vec<Role>, SyncError> {
        read_keys(&*self.store, &paths::user_roles(channel_id)).await
    }

    pub async fn online_users(
        &self,
        channel_id: &ChannelId,
    ) -> Result<BTreeMap<Uid, OnlineUser>, SyncError> {
        Ok(read_as(&*self.store, &paths::online_users(channel_id))
            .await?
            .unwrap_or_default())
    }

    pub async fn members(
        &self,
        channel_id: &ChannelId,
    ) -> Result<BTreeMap<Uid, ChannelMembership>, SyncError> {
        self.mirror.members(channel_id).await
    }

    /// Members whose display name starts with `prefix`, ignoring case,
    /// ordered by display name and capped at `limit`. Feeds mention
    /// autocompletion.
    pub async fn members_matching(
        &self,
        channel_id: &ChannelId,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<(Uid, ChannelMembership)>, SyncError> {
        let prefix = prefix.to_lowercase();
        let mut matches: Vec<(Uid, ChannelMembership)> = self
            .members(channel_id)
            .await?
            .into_iter()
            .filter(|(_, member)| member.display_name.to_lowercase().starts_with(&prefix))
            .collect();
        matches.sort_by(|(a_uid, a), (b_uid, b)| {
            a.display_name.cmp(&b.display_name).then_with(|| a_uid.cmp(b_uid))
        });
        matches.truncate(limit);
        Ok(matches)
    }

    async fn ensure_exists(&self, channel_id: &ChannelId) -> Result<(), SyncError> {
        if exists(&*self.store, &paths::channel_name(channel_id)).await? {
            Ok(())
        } else {
            Err(SyncError::UnknownChannel(channel_id.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SyncConfig;
    use parlor_store::MemoryStore;

    fn user(uid: &'static str) -> UserProfile {
        UserProfile {
            uid: Uid::from_static(uid),
            display_name: uid.to_uppercase(),
            email: format!("{}@example.com", uid),
            photo_url: String::new(),
            color: "#000000".into(),
        }
    }

    fn directory(store: &MemoryStore) -> ChannelDirectory {
        let client: Arc<dyn StoreClient> = Arc::new(store.connect());
        let mirror = MembershipMirror::new(client.clone(), SyncConfig::default());
        ChannelDirectory::new(client, mirror)
    }

    #[tokio::test]
    async fn creator_owns_the_new_channel() {
        let store = MemoryStore::new();
        let channels = directory(&store);
        let ada = user("ada");

        let id = channels.create_channel(&ada, "Lobby", false).await.unwrap();

        assert_eq!(channels.channel_name(&id).await.unwrap().as_deref(), Some("Lobby"));
        let members = channels.members(&id).await.unwrap();
        assert_eq!(members[&ada.uid].role.as_str(), "owner");
        let roles = channels.user_roles(&id).await.unwrap();
        assert_eq!(roles, vec![Role::from_static("member"), Role::from_static("owner")]);

        let record = channels.channel(&id).await.unwrap().unwrap();
        assert!(!record.is_private);
        assert_eq!(record.icon, "");
    }

    #[tokio::test]
    async fn rooms_fan_out_unread_flags() {
        let store = MemoryStore::new();
        let channels = directory(&store);
        let ada = user("ada");
        let grace = user("grace");

        let id = channels.create_channel(&ada, "Lobby", false).await.unwrap();
        channels.subscribe_to_channel(&grace, &id).await.unwrap();
        let room = channels.create_room(&id, "welcome", None).await.unwrap();

        let unread = UnreadTracker::new(Arc::new(store.connect()));
        for uid in [&ada.uid, &grace.uid] {
            assert!(unread.unread_rooms(uid, &id).await.unwrap().contains(&room));
        }
        assert_eq!(channels.rooms(&id).await.unwrap()[0].name, "welcome");
    }

    #[tokio::test]
    async fn categories_and_roles() {
        let store = MemoryStore::new();
        let channels = directory(&store);
        let id = channels.create_channel(&user("ada"), "Lobby", true).await.unwrap();
        let room = channels.create_room(&id, "welcome", None).await.unwrap();
        let info = Category::from_static("info");

        channels.create_room_category(&id, &info).await.unwrap();
        channels.set_room_category(&id, &room, &info).await.unwrap();
        channels.create_user_role(&id, &Role::from_static("moderator")).await.unwrap();
        channels.set_channel_icon(&id, "https://img/lobby.png").await.unwrap();

        assert_eq!(channels.room_categories(&id).await.unwrap(), vec![info.clone()]);
        assert_eq!(channels.rooms(&id).await.unwrap()[0].category, Some(info));
        assert_eq!(channels.user_roles(&id).await.unwrap().len(), 3);
        assert_eq!(channels.channel(&id).await.unwrap().unwrap().icon, "https://img/lobby.png");
    }

    #[tokio::test]
    async fn mention_candidates_match_by_prefix() {
        let store = MemoryStore::new();
        let channels = directory(&store);
        let id = channels.create_channel(&user("ada"), "Lobby", false).await.unwrap();
        for uid in ["adele", "adam", "grace", "adrian", "addy", "adolf"] {
            channels.subscribe_to_channel(&user(uid), &id).await.unwrap();
        }

        let found = channels.members_matching(&id, "ad", 5).await.unwrap();
        let names: Vec<&str> = found.iter().map(|(_, m)| m.display_name.as_str()).collect();
        assert_eq!(names, vec!["ADA", "ADAM", "ADDY", "ADELE", "ADOLF"]);

        let graces = channels.members_matching(&id, "GR", 5).await.unwrap();
        assert_eq!(graces.len(), 1);
        assert_eq!(graces[0].0.as_str(), "grace");
        assert!(channels.members_matching(&id, "zed", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_channels_are_refused() {
        let store = MemoryStore::new();
        let channels = directory(&store);
        let missing = ChannelId::from_static("missing");

        assert!(matches!(
            channels.create_room(&missing, "x", None).await,
            Err(SyncError::UnknownChannel(_))
        ));
        assert!(matches!(
            channels.subscribe_to_channel(&user("ada"), &missing).await,
            Err(SyncError::UnknownChannel(_))
        ));
        assert_eq!(store.peek(""), None);
    }
}
