//! A mutex-guarded string-keyed map.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug)]
pub struct SyncMap<V> {
    inner: Mutex<HashMap<String, V>>,
}

impl<V> Default for SyncMap<V> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }
}

impl<V> SyncMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, V>> {
        // A panic while holding the lock cannot leave the map half-updated:
        // every operation below is a single HashMap call.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn put(&self, key: impl Into<String>, value: V) {
        self.lock().insert(key.into(), value);
    }

    pub fn delete(&self, key: &str) -> Option<V> {
        self.lock().remove(key)
    }

    /// Removes `key` only if `pred` holds for its current value.
    pub fn delete_if(&self, key: &str, pred: impl FnOnce(&V) -> bool) -> Option<V> {
        let mut map = self.lock();
        if map.get(key).is_some_and(pred) {
            map.remove(key)
        } else {
            None
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl<V: Clone> SyncMap<V> {
    pub fn get(&self, key: &str) -> Option<V> {
        self.lock().get(key).cloned()
    }

    /// Returns the value for `key`, inserting `init()` first if absent.
    pub fn get_or_insert_with(&self, key: &str, init: impl FnOnce() -> V) -> V {
        self.lock()
            .entry(key.to_string())
            .or_insert_with(init)
            .clone()
    }

    pub fn values(&self) -> Vec<V> {
        self.lock().values().cloned().collect()
    }

    /// Copies the current contents out so callers never hold the lock.
    pub fn snapshot(&self) -> HashMap<String, V> {
        self.lock().clone()
    }
}

impl<V> From<HashMap<String, V>> for SyncMap<V> {
    fn from(map: HashMap<String, V>) -> Self {
        Self {
            inner: Mutex::new(map),
        }
    }
}

impl<V: Clone + Serialize> Serialize for SyncMap<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.snapshot().serialize(serializer)
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for SyncMap<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        HashMap::<String, V>::deserialize(deserializer).map(Self::from)
    }
}
