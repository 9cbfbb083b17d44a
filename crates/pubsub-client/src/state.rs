//! Per-channel presence state for this client's UUID.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

/// Thread-safe map channel → JSON state object.
///
/// Entries survive unsubscribe so that re-subscribing restores them; the
/// subscribe loop only sends the entries of currently subscribed channels.
#[derive(Debug, Clone, Default)]
pub struct StateStore {
    inner: Arc<RwLock<HashMap<String, Value>>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, channel: &str, state: Value) {
        self.inner.write().insert(channel.to_string(), state);
    }

    pub fn set_many(&self, channels: &[String], state: &Value) {
        let mut map = self.inner.write();
        for channel in channels {
            map.insert(channel.clone(), state.clone());
        }
    }

    pub fn get(&self, channel: &str) -> Option<Value> {
        self.inner.read().get(channel).cloned()
    }

    pub fn remove(&self, channel: &str) -> Option<Value> {
        self.inner.write().remove(channel)
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }

    /// State object for the given channels, skipping channels without state.
    /// Returns `None` when no channel has state.
    pub fn snapshot_for<'a>(&self, channels: impl IntoIterator<Item = &'a String>) -> Option<Value> {
        let map = self.inner.read();
        let obj: serde_json::Map<String, Value> = channels
            .into_iter()
            .filter_map(|c| map.get(c).map(|s| (c.clone(), s.clone())))
            .collect();
        if obj.is_empty() {
            None
        } else {
            Some(Value::Object(obj))
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn snapshot_filters_to_requested_channels() {
        let store = StateStore::new();
        store.set("a", json!({"mood": "happy"}));
        store.set("b", json!({"mood": "sad"}));

        let channels = vec!["a".to_string(), "c".to_string()];
        let snap = store.snapshot_for(&channels).unwrap();
        assert_eq!(snap, json!({"a": {"mood": "happy"}}));

        let none = vec!["c".to_string()];
        assert!(store.snapshot_for(&none).is_none());
    }

    #[test]
    fn clones_share_storage() {
        let store = StateStore::new();
        let other = store.clone();
        other.set_many(&["x".to_string(), "y".to_string()], &json!({"k": 1}));
        assert_eq!(store.get("y"), Some(json!({"k": 1})));
        store.remove("x");
        assert!(other.get("x").is_none());
        other.clear();
        assert!(store.get("y").is_none());
    }
}
