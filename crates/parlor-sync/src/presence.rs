//! Online/offline markers for one signed-in user.
//!
//! `go_online` first registers the store-side deferred writes that mark the
//! user offline everywhere, and only once the store has acknowledged them
//! writes the online markers. A client that vanishes after that point is
//! still marked offline by the store.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use parlor_store::StoreClient;
use parlor_types::{
    ChannelId, OnlineUser, Role, Status, Updates, UserProfile, paths, server_timestamp,
};
use serde_json::Value;
use tracing::{debug, info};

use crate::SyncError;
use crate::fetch::exists;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresencePhase {
    Offline,
    /// Deferred offline writes are being registered.
    Registering,
    Online,
    /// The connection dropped; the deferred writes take over.
    Suspended,
    LoggedOut,
}

pub struct PresenceController {
    store: Arc<dyn StoreClient>,
    profile: UserProfile,
    state: Mutex<PresenceState>,
}

struct PresenceState {
    phase: PresencePhase,
    /// Bumped on every transition that invalidates an in-flight `go_online`.
    epoch: u64,
    channels: Vec<(ChannelId, Role)>,
}

impl PresenceController {
    pub fn new(store: Arc<dyn StoreClient>, profile: UserProfile) -> Self {
        Self {
            store,
            profile,
            state: Mutex::new(PresenceState {
                phase: PresencePhase::Offline,
                epoch: 0,
                channels: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PresenceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn phase(&self) -> PresencePhase {
        self.lock().phase
    }

    pub fn profile(&self) -> &UserProfile {
        &self.profile
    }

    /// Channels covered by the last `go_online`.
    pub fn channels(&self) -> Vec<(ChannelId, Role)> {
        self.lock().channels.clone()
    }

    /// Mark the user online in every channel of `channels` where both
    /// membership mirrors exist. Other entries are skipped so no orphan
    /// member rows get written.
    ///
    /// Failures are returned as-is; the caller retries on the next
    /// connection transition.
    pub async fn go_online(&self, channels: &[(ChannelId, Role)]) -> Result<(), SyncError> {
        let channels = &self.joined(channels).await?[..];
        let epoch = {
            let mut state = self.lock();
            if state.phase == PresencePhase::LoggedOut {
                return Err(SyncError::SessionClosed);
            }
            state.epoch += 1;
            state.phase = PresencePhase::Registering;
            state.channels = channels.to_vec();
            state.epoch
        };

        let uid = &self.profile.uid;
        if let Err(e) = self
            .store
            .register_deferred_write(self.offline_updates(channels))
            .await
        {
            self.settle(epoch, PresencePhase::Offline);
            return Err(e.into());
        }

        if !self.is_current(epoch) {
            debug!("Skipping online write for {}: connection changed", uid);
            return Ok(());
        }

        let online = self.online_updates(channels)?;
        if let Err(e) = self.store.write(online).await {
            self.settle(epoch, PresencePhase::Offline);
            return Err(e.into());
        }

        if self.settle(epoch, PresencePhase::Online) {
            info!("{} online in {} channels", uid, channels.len());
        }
        Ok(())
    }

    /// Feed a connection transition. On `false` no further writes are
    /// issued for the current cycle.
    pub fn on_connection_changed(&self, connected: bool) {
        if connected {
            return;
        }
        let mut state = self.lock();
        if state.phase == PresencePhase::LoggedOut {
            return;
        }
        state.epoch += 1;
        state.phase = PresencePhase::Suspended;
        info!("{} suspended, deferred writes take over", self.profile.uid);
    }

    /// Mark the user offline now and drop the deferred writes.
    pub async fn logout(&self) -> Result<(), SyncError> {
        let channels = {
            let mut state = self.lock();
            state.epoch += 1;
            state.phase = PresencePhase::LoggedOut;
            state.channels.clone()
        };

        self.store.write(self.offline_updates(&channels)).await?;
        self.store.cancel_deferred_writes().await?;
        info!("{} logged out", self.profile.uid);
        Ok(())
    }

    async fn joined(
        &self,
        channels: &[(ChannelId, Role)],
    ) -> Result<Vec<(ChannelId, Role)>, SyncError> {
        let uid = &self.profile.uid;
        let mut joined = Vec::with_capacity(channels.len());
        for (channel_id, role) in channels {
            if exists(&*self.store, &paths::user_channel(uid, channel_id)).await?
                && exists(&*self.store, &paths::member(channel_id, uid)).await?
            {
                joined.push((channel_id.clone(), role.clone()));
            } else {
                debug!("{} is not a member of {}, skipping", uid, channel_id);
            }
        }
        Ok(joined)
    }

    fn is_current(&self, epoch: u64) -> bool {
        let state = self.lock();
        state.epoch == epoch && state.phase == PresencePhase::Registering
    }

    /// Move to `phase` unless a newer transition happened meanwhile.
    fn settle(&self, epoch: u64, phase: PresencePhase) -> bool {
        let mut state = self.lock();
        if state.epoch != epoch {
            return false;
        }
        state.phase = phase;
        true
    }

    fn offline_updates(&self, channels: &[(ChannelId, Role)]) -> Updates {
        let uid = &self.profile.uid;
        let mut updates = Updates::new();
        updates
            .set(paths::user_is_online(uid), false)
            .set(paths::user_last_logged_in(uid), server_timestamp());

        for (channel_id, _) in channels {
            updates
                .set(
                    paths::member_field(channel_id, uid, "status"),
                    status_value(Status::Offline),
                )
                .remove(paths::online_user(channel_id, uid));
        }
        updates
    }

    fn online_updates(&self, channels: &[(ChannelId, Role)]) -> Result<Updates, SyncError> {
        let uid = &self.profile.uid;
        let mut updates = Updates::new();
        updates.set(paths::user_is_online(uid), true);

        for (channel_id, role) in channels {
            let online_path = paths::online_user(channel_id, uid);
            let online = OnlineUser {
                display_name: self.profile.display_name.clone(),
                avatar: self.profile.photo_url.clone(),
                color: self.profile.color.clone(),
                role: role.clone(),
            };
            updates
                .set(
                    paths::member_field(channel_id, uid, "status"),
                    status_value(Status::Online),
                )
                .set_record(online_path.clone(), &online)
                .map_err(|e| SyncError::decoding(online_path, e))?;
        }
        Ok(updates)
    }
}

fn status_value(status: Status) -> Value {
    match status {
        Status::Online => Value::from("online"),
        Status::Offline => Value::from("offline"),
    }
}
