//! User records and the per-user side of memberships.

use std::collections::BTreeMap;
use std::sync::Arc;

use parlor_store::StoreClient;
use parlor_types::{ChannelId, Role, Uid, Updates, UserProfile, UserRecord, paths};
use tracing::{info, warn};

use crate::fetch::read_as;
use crate::{MembershipHealth, MembershipMirror, SyncError};

/// Fields of a profile change; `None` leaves the field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileChanges {
    pub display_name: Option<String>,
    pub avatar: Option<String>,
    pub color: Option<String>,
}

#[derive(Clone)]
pub struct UserDirectory {
    store: Arc<dyn StoreClient>,
    mirror: MembershipMirror,
}

impl UserDirectory {
    pub fn new(store: Arc<dyn StoreClient>, mirror: MembershipMirror) -> Self {
        Self { store, mirror }
    }

    /// Write the record of a freshly registered user and optionally join
    /// them to `initial_channel`.
    pub async fn create_profile(
        &self,
        profile: &UserProfile,
        initial_channel: Option<&ChannelId>,
    ) -> Result<(), SyncError> {
        let uid = &profile.uid;
        let record = UserRecord::from_profile(profile);

        let mut updates = Updates::new();
        updates
            .set(paths::user_field(uid, "displayName"), record.display_name)
            .set(paths::user_field(uid, "email"), record.email)
            .set(paths::user_field(uid, "photoURL"), record.photo_url)
            .set(paths::user_field(uid, "color"), record.color)
            .set(paths::user_is_online(uid), record.is_online);
        self.store.write(updates).await?;
        info!("Profile for {} created", uid);

        if let Some(channel_id) = initial_channel {
            self.mirror.subscribe_user_to_channel(profile, channel_id).await?;
        }
        Ok(())
    }

    pub async fn user(&self, uid: &Uid) -> Result<Option<UserRecord>, SyncError> {
        read_as(&*self.store, &paths::user(uid)).await
    }

    /// Every channel the user belongs to, with the role held there.
    pub async fn channel_list(&self, uid: &Uid) -> Result<Vec<(ChannelId, Role)>, SyncError> {
        let channels: BTreeMap<ChannelId, Role> =
            read_as(&*self.store, &paths::user_channels(uid))
                .await?
                .unwrap_or_default();
        Ok(channels.into_iter().collect())
    }

    pub async fn is_user_online(&self, uid: &Uid) -> Result<bool, SyncError> {
        Ok(read_as(&*self.store, &paths::user_is_online(uid))
            .await?
            .unwrap_or(false))
    }

    pub async fn role_of(&self, channel_id: &ChannelId, uid: &Uid) -> Result<Option<Role>, SyncError> {
        read_as(&*self.store, &paths::user_channel(uid, channel_id)).await
    }

    /// Apply `changes` to the user record and to every membership row (and
    /// online-users row while online) in one write. Half-written memberships
    /// are left for `subscribe_user_to_channel` to repair.
    pub async fn update_profile(&self, uid: &Uid, changes: &ProfileChanges) -> Result<(), SyncError> {
        let mut channels = Vec::new();
        for (channel_id, role) in self.channel_list(uid).await? {
            match self.mirror.check_membership(uid, &channel_id).await? {
                MembershipHealth::Consistent => channels.push((channel_id, role)),
                health => warn!("Skipping {} for {}: {:?}", channel_id, uid, health),
            }
        }
        let online = self.is_user_online(uid).await?;

        let fields = [
            ("displayName", "displayName", &changes.display_name),
            ("photoURL", "avatar", &changes.avatar),
            ("color", "color", &changes.color),
        ];

        let mut updates = Updates::new();
        for (user_field, member_field, value) in fields {
            let Some(value) = value else { continue };
            updates.set(paths::user_field(uid, user_field), value.as_str());
            for (channel_id, _) in &channels {
                updates.set(paths::member_field(channel_id, uid, member_field), value.as_str());
                if online {
                    updates.set(
                        format!("{}/{}", paths::online_user(channel_id, uid), member_field),
                        value.as_str(),
                    );
                }
            }
        }

        if updates.is_empty() {
            return Ok(());
        }
        self.store.write(updates).await?;
        info!("Profile of {} updated across {} channels", uid, channels.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SyncConfig;
    use parlor_store::MemoryStore;
    use serde_json::json;

    fn ada() -> UserProfile {
        UserProfile {
            uid: Uid::from_static("ada"),
            display_name: "Ada".into(),
            email: "ada@example.com".into(),
            photo_url: String::new(),
            color: "#aa00ff".into(),
        }
    }

    fn directory(store: &MemoryStore) -> UserDirectory {
        let client: Arc<dyn StoreClient> = Arc::new(store.connect());
        let mirror = MembershipMirror::new(client.clone(), SyncConfig::default());
        UserDirectory::new(client, mirror)
    }

    #[tokio::test]
    async fn profile_with_initial_channel() {
        let store = MemoryStore::new();
        let users = directory(&store);
        let general = ChannelId::from_static("general");

        users.create_profile(&ada(), Some(&general)).await.unwrap();

        let record = users.user(&ada().uid).await.unwrap().unwrap();
        assert_eq!(record.display_name, "Ada");
        assert!(!record.is_online);
        assert_eq!(
            users.channel_list(&ada().uid).await.unwrap(),
            vec![(general.clone(), Role::from_static("member"))]
        );
        assert_eq!(
            users.role_of(&general, &ada().uid).await.unwrap(),
            Some(Role::from_static("member"))
        );
        assert!(!users.is_user_online(&ada().uid).await.unwrap());
    }

    #[tokio::test]
    async fn profile_changes_fan_out() {
        let store = MemoryStore::new();
        let users = directory(&store);
        let general = ChannelId::from_static("general");
        users.create_profile(&ada(), Some(&general)).await.unwrap();

        let changes = ProfileChanges {
            display_name: Some("Countess".into()),
            avatar: Some("https://img/ada.png".into()),
            ..Default::default()
        };
        users.update_profile(&ada().uid, &changes).await.unwrap();

        assert_eq!(store.peek("users/ada/displayName"), Some(json!("Countess")));
        assert_eq!(store.peek("users/ada/photoURL"), Some(json!("https://img/ada.png")));
        assert_eq!(
            store.peek("Channels/general/users/ada/displayName"),
            Some(json!("Countess"))
        );
        assert_eq!(
            store.peek("Channels/general/users/ada/avatar"),
            Some(json!("https://img/ada.png"))
        );
        // offline users have no online row to touch
        assert_eq!(store.peek("Channels/general/online_users"), None);
        assert_eq!(store.peek("users/ada/color"), Some(json!("#aa00ff")));
    }

    #[tokio::test]
    async fn profile_changes_skip_half_written_memberships() {
        let store = MemoryStore::new();
        let users = directory(&store);
        let general = ChannelId::from_static("general");
        users.create_profile(&ada(), Some(&general)).await.unwrap();

        let mut half = Updates::new();
        half.set("users/ada/channels/lost", "member");
        store.connect().write(half).await.unwrap();

        let changes = ProfileChanges {
            color: Some("#00ff00".into()),
            ..Default::default()
        };
        users.update_profile(&ada().uid, &changes).await.unwrap();

        assert_eq!(store.peek("Channels/general/users/ada/color"), Some(json!("#00ff00")));
        assert_eq!(store.peek("Channels/lost"), None);
    }
}
