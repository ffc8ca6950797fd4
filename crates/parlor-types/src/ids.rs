use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Longest key the store accepts for a single path segment.
pub const MAX_KEY_LEN: usize = 768;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid key {key:?}: {reason}")]
pub struct InvalidKey {
    pub key: String,
    pub reason: &'static str,
}

/// Check that `key` can be used as one segment of a store path.
pub fn validate_key(key: &str) -> Result<(), InvalidKey> {
    let reason = if key.is_empty() {
        "empty"
    } else if key.len() > MAX_KEY_LEN {
        "too long"
    } else if key
        .chars()
        .any(|c| matches!(c, '.' | '#' | '$' | '[' | ']' | '/') || c.is_control())
    {
        "contains a reserved character"
    } else {
        return Ok(());
    };

    Err(InvalidKey {
        key: key.to_string(),
        reason,
    })
}

macro_rules! key_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(key: impl Into<String>) -> Result<Self, InvalidKey> {
                let key = key.into();
                validate_key(&key)?;
                Ok(Self(key))
            }

            /// For literals known to be valid keys.
            pub fn from_static(key: &'static str) -> Self {
                debug_assert!(validate_key(key).is_ok(), "invalid key literal {:?}", key);
                Self(key.to_string())
            }

            /// Fresh push-style key, unique per call.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().simple().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = InvalidKey;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> String {
                value.0
            }
        }

        impl FromStr for $name {
            type Err = InvalidKey;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

key_type!(
    /// User id issued by the identity provider.
    Uid
);
key_type!(ChannelId);
key_type!(RoomId);
key_type!(MessageId);
key_type!(
    /// Channel-scoped role name, also a key under `user_roles`.
    Role
);
key_type!(
    /// Room category name, also a key under `room_categories`.
    Category
);
