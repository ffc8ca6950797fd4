use std::time::Duration;

use parlor_types::Role;

use crate::SyncError;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Extra attempts for a half-written membership pair on stores without
    /// atomic multi-path writes.
    pub mirror_retries: u32,
    pub mirror_retry_backoff: Duration,
    /// Role given to users subscribing on their own.
    pub default_role: Role,
    /// Role given to the creator of a channel.
    pub owner_role: Role,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, SyncError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key/value source; missing or unparsable numbers fall
    /// back to the defaults, invalid role names are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SyncError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let mirror_retries = lookup("PARLOR_MIRROR_RETRIES")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.mirror_retries);
        let mirror_retry_backoff = lookup("PARLOR_MIRROR_RETRY_BACKOFF_MS")
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.mirror_retry_backoff);
        let default_role = match lookup("PARLOR_DEFAULT_ROLE") {
            Some(role) => Role::new(role)?,
            None => defaults.default_role,
        };
        let owner_role = match lookup("PARLOR_OWNER_ROLE") {
            Some(role) => Role::new(role)?,
            None => defaults.owner_role,
        };

        Ok(Self {
            mirror_retries,
            mirror_retry_backoff,
            default_role,
            owner_role,
        })
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mirror_retries: 3,
            mirror_retry_backoff: Duration::from_millis(50),
            default_role: Role::from_static("member"),
            owner_role: Role::from_static("owner"),
        }
    }
}
