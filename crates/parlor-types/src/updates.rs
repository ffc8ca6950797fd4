use std::collections::BTreeMap;
use std::collections::btree_map;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Key of the placeholder object the store replaces with its own clock.
pub const SERVER_VALUE_KEY: &str = ".sv";

/// Placeholder resolved by the store to its current time (unix millis)
/// at the moment the write is applied.
pub fn server_timestamp() -> Value {
    json!({ SERVER_VALUE_KEY: "timestamp" })
}

pub fn is_server_timestamp(value: &Value) -> bool {
    match value {
        Value::Object(map) => {
            map.len() == 1 && map.get(SERVER_VALUE_KEY).and_then(Value::as_str) == Some("timestamp")
        }
        _ => false,
    }
}

/// A multi-path write: every entry is applied together or not at all.
/// A `null` value deletes the path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Updates(BTreeMap<String, Value>);

impl Updates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, path: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.0.insert(path.into(), value.into());
        self
    }

    /// Serialize a record into the update.
    pub fn set_record<T: Serialize>(
        &mut self,
        path: impl Into<String>,
        record: &T,
    ) -> Result<&mut Self, serde_json::Error> {
        let value = serde_json::to_value(record)?;
        self.0.insert(path.into(), value);
        Ok(self)
    }

    pub fn remove(&mut self, path: impl Into<String>) -> &mut Self {
        self.0.insert(path.into(), Value::Null);
        self
    }

    /// Merge `other` into `self`; later entries win on identical paths.
    pub fn extend(&mut self, other: Updates) -> &mut Self {
        self.0.extend(other.0);
        self
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        self.0.get(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Value> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> BTreeMap<String, Value> {
        self.0
    }
}

impl IntoIterator for Updates {
    type Item = (String, Value);
    type IntoIter = btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<(String, Value)> for Updates {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_timestamp_is_recognised() {
        assert!(is_server_timestamp(&server_timestamp()));
        assert!(!is_server_timestamp(&json!({ ".sv": "increment" })));
        assert!(!is_server_timestamp(&json!(12)));
    }

    #[test]
    fn later_entries_win() {
        let mut a = Updates::new();
        a.set("users/u1/isOnline", true);
        let mut b = Updates::new();
        b.set("users/u1/isOnline", false).remove("users/u1/channels/x");
        a.extend(b);
        assert_eq!(a.len(), 2);
        assert_eq!(a.get("users/u1/isOnline"), Some(&json!(false)));
        assert_eq!(a.get("users/u1/channels/x"), Some(&Value::Null));
    }
}
