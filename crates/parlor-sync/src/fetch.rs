//! Typed reads at the store boundary.

use std::collections::BTreeMap;

use parlor_store::StoreClient;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde_json::Value;

use crate::SyncError;

pub(crate) fn decode<T: DeserializeOwned>(path: &str, value: Value) -> Result<T, SyncError> {
    serde_json::from_value(value).map_err(|e| SyncError::decoding(path, e))
}

/// Read `path` once and decode it. Absent data is `None`.
pub(crate) async fn read_as<T: DeserializeOwned>(
    store: &dyn StoreClient,
    path: &str,
) -> Result<Option<T>, SyncError> {
    match store.read_once(path).await? {
        Some(value) => decode(path, value).map(Some),
        None => Ok(None),
    }
}

/// Keys of the object at `path`, ignoring the values.
pub(crate) async fn read_keys<K>(store: &dyn StoreClient, path: &str) -> Result<Vec<K>, SyncError>
where
    K: DeserializeOwned + Ord,
{
    let map: Option<BTreeMap<K, IgnoredAny>> = read_as(store, path).await?;
    Ok(map.map(|m| m.into_keys().collect()).unwrap_or_default())
}

pub(crate) async fn exists(store: &dyn StoreClient, path: &str) -> Result<bool, SyncError> {
    Ok(store.read_once(path).await?.is_some())
}
