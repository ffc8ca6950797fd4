//! The two membership mirrors.
//!
//! `users/{uid}/channels/{channel}` and `Channels/{channel}/users/{uid}` must
//! exist together. Every mutation touching both goes out as one multi-path
//! write; on stores that cannot apply such a write atomically the two halves
//! are retried as a unit.

use std::collections::BTreeMap;
use std::sync::Arc;

use parlor_store::{StoreClient, StoreError};
use parlor_types::{ChannelId, ChannelMembership, Role, Status, Uid, Updates, UserProfile, paths};
use tracing::{debug, info, warn};

use crate::fetch::{exists, read_as};
use crate::{SyncConfig, SyncError, UnreadTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorSide {
    User,
    Channel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipHealth {
    Consistent,
    Absent,
    /// Only one mirror exists; `missing` names the other.
    Degraded { missing: MirrorSide },
}

#[derive(Clone)]
pub struct MembershipMirror {
    store: Arc<dyn StoreClient>,
    unread: UnreadTracker,
    config: SyncConfig,
}

impl MembershipMirror {
    pub fn new(store: Arc<dyn StoreClient>, config: SyncConfig) -> Self {
        Self {
            unread: UnreadTracker::new(store.clone()),
            store,
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Subscribe with the default role.
    pub async fn subscribe_user_to_channel(
        &self,
        user: &UserProfile,
        channel_id: &ChannelId,
    ) -> Result<(), SyncError> {
        let role = self.config.default_role.clone();
        self.subscribe_with_role(user, channel_id, &role).await
    }

    /// Write both mirrors for (user, channel). A first subscription also
    /// seeds the unread set with every current room, in the same write.
    ///
    /// An existing membership keeps its stored role and status: a complete
    /// pair is left alone, a half-written one is repaired from whichever side
    /// survived.
    pub async fn subscribe_with_role(
        &self,
        user: &UserProfile,
        channel_id: &ChannelId,
        role: &Role,
    ) -> Result<(), SyncError> {
        let uid = &user.uid;
        let member_path = paths::member(channel_id, uid);

        let user_role: Option<Role> =
            read_as(&*self.store, &paths::user_channel(uid, channel_id)).await?;
        let member_exists = exists(&*self.store, &member_path).await?;
        if user_role.is_some() && member_exists {
            debug!("{} already subscribed to {}", uid, channel_id);
            return Ok(());
        }

        let (member_role, status) = if member_exists {
            let member_role: Option<Role> =
                read_as(&*self.store, &paths::member_field(channel_id, uid, "role")).await?;
            let status: Option<Status> =
                read_as(&*self.store, &paths::member_field(channel_id, uid, "status")).await?;
            (member_role, status.unwrap_or_default())
        } else {
            (None, Status::Offline)
        };
        let role = user_role.clone().or(member_role).unwrap_or_else(|| role.clone());

        let mut updates = match user_role {
            Some(_) => Updates::new(),
            None => self.unread.seed_updates(uid, channel_id).await?,
        };

        let membership = ChannelMembership {
            display_name: user.display_name.clone(),
            avatar: user.photo_url.clone(),
            color: user.color.clone(),
            role: role.clone(),
            status,
        };
        updates
            .set(paths::user_channel(uid, channel_id), role.as_str())
            .set_record(member_path.clone(), &membership)
            .map_err(|e| SyncError::decoding(member_path, e))?;

        self.write_pair(uid, channel_id, updates).await?;
        info!("{} subscribed to {} as {}", uid, channel_id, role);
        Ok(())
    }

    /// Change a member's role on both mirrors and, while the user is online,
    /// in the channel's online-users projection.
    pub async fn update_role(
        &self,
        channel_id: &ChannelId,
        uid: &Uid,
        role: &Role,
    ) -> Result<(), SyncError> {
        if self.check_membership(uid, channel_id).await? == MembershipHealth::Absent {
            return Err(SyncError::NotAMember {
                uid: uid.clone(),
                channel_id: channel_id.clone(),
            });
        }

        let online: bool = read_as(&*self.store, &paths::user_is_online(uid))
            .await?
            .unwrap_or(false);

        let mut updates = Updates::new();
        updates
            .set(paths::user_channel(uid, channel_id), role.as_str())
            .set(paths::member_field(channel_id, uid, "role"), role.as_str());
        if online {
            updates.set(
                format!("{}/role", paths::online_user(channel_id, uid)),
                role.as_str(),
            );
        }

        self.write_pair(uid, channel_id, updates).await?;
        info!("{} is now {} in {}", uid, role, channel_id);
        Ok(())
    }

    pub async fn check_membership(
        &self,
        uid: &Uid,
        channel_id: &ChannelId,
    ) -> Result<MembershipHealth, SyncError> {
        let user_side = exists(&*self.store, &paths::user_channel(uid, channel_id)).await?;
        let channel_side = exists(&*self.store, &paths::member(channel_id, uid)).await?;

        Ok(match (user_side, channel_side) {
            (true, true) => MembershipHealth::Consistent,
            (false, false) => MembershipHealth::Absent,
            (true, false) => MembershipHealth::Degraded {
                missing: MirrorSide::Channel,
            },
            (false, true) => MembershipHealth::Degraded {
                missing: MirrorSide::User,
            },
        })
    }

    /// Channel-side rows of every member.
    pub async fn members(
        &self,
        channel_id: &ChannelId,
    ) -> Result<BTreeMap<Uid, ChannelMembership>, SyncError> {
        Ok(read_as(&*self.store, &paths::members(channel_id))
            .await?
            .unwrap_or_default())
    }

    /// Commit `updates`, which touch both mirrors of (uid, channel), as one
    /// unit.
    pub(crate) async fn write_pair(
        &self,
        uid: &Uid,
        channel_id: &ChannelId,
        updates: Updates,
    ) -> Result<(), SyncError> {
        if self.store.atomic_multi_path() {
            return self.store.write(updates).await.map_err(SyncError::from);
        }

        let user_root = paths::user(uid);
        let (user_half, channel_half): (Updates, Updates) = {
            let (user, channel): (Vec<_>, Vec<_>) = updates
                .into_iter()
                .partition(|(path, _)| paths::is_prefix(&user_root, path));
            (user.into_iter().collect(), channel.into_iter().collect())
        };

        let attempts = self.config.mirror_retries + 1;
        let mut partial = false;
        let mut last = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(self.config.mirror_retry_backoff * (attempt - 1)).await;
            }

            if let Err(e) = self.store.write(user_half.clone()).await {
                if !partial {
                    // nothing of the pair is in the store yet
                    return Err(e.into());
                }
                warn!("Retrying membership {}/{} (attempt {}): {}", uid, channel_id, attempt, e);
                last = Some(e);
                continue;
            }

            match self.store.write(channel_half.clone()).await {
                Ok(()) => {
                    if attempt > 1 {
                        debug!("Membership {}/{} repaired on attempt {}", uid, channel_id, attempt);
                    }
                    return Ok(());
                }
                Err(e @ StoreError::PermissionDenied { .. }) => {
                    return Err(SyncError::ConsistencyViolation {
                        uid: uid.clone(),
                        channel_id: channel_id.clone(),
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    partial = true;
                    warn!("Retrying membership {}/{} (attempt {}): {}", uid, channel_id, attempt, e);
                    last = Some(e);
                }
            }
        }

        Err(SyncError::ConsistencyViolation {
            uid: uid.clone(),
            channel_id: channel_id.clone(),
            attempts,
            last: last.unwrap_or(StoreError::Disconnected),
        })
    }
}
