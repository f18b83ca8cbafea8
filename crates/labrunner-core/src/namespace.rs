//! Shared key-value namespaces.
//!
//! Both the global namespace and every per-identifier local namespace are a
//! [`Namespace`]: a cheaply cloneable handle to one map behind one mutex.
//! Clones share the same storage.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value as JsonValue;

use crate::script::Value;

/// JSON form of the plain-data part of a namespace.
pub type Snapshot = BTreeMap<String, JsonValue>;

#[derive(Clone, Default)]
pub struct Namespace {
    inner: Arc<Mutex<HashMap<String, Value>>>,
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a namespace from a JSON snapshot.
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let map = snapshot
            .iter()
            .map(|(name, value)| (name.clone(), Value::from_json(value)))
            .collect();
        Self {
            inner: Arc::new(Mutex::new(map)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.lock().get(name).cloned()
    }

    pub fn set(&self, name: impl Into<String>, value: Value) {
        self.lock().insert(name.into(), value);
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        self.lock().remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Names currently bound, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// JSON view of every binding that has one. Functions, builtins and
    /// namespace handles are skipped.
    pub fn snapshot(&self) -> Snapshot {
        let entries: Vec<(String, Value)> = self
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries
            .into_iter()
            .filter_map(|(name, value)| value.to_json().map(|json| (name, json)))
            .collect()
    }

    /// Whether both handles refer to the same storage.
    pub fn ptr_eq(&self, other: &Namespace) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Namespace")
            .field("names", &self.keys())
            .finish()
    }
}
