//! Session records and lock metadata

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Ordered key/value collection stored in a session.
///
/// Keys keep their insertion order; replacing a value keeps the original slot.
#[derive(Debug, Clone, Default)]
pub struct SessionItems {
    entries: Vec<(String, Value)>,
    /// Key to slot in `entries`
    index: HashMap<String, usize>,
}

impl PartialEq for SessionItems {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl SessionItems {
    /// Create an empty collection
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.position(key).is_some()
    }

    /// Get the raw JSON value stored under `key`
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.position(key).map(|i| &self.entries[i].1)
    }

    /// Get the value stored under `key` deserialized as `T`
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> serde_json::Result<Option<T>> {
        self.get(key)
            .map(|value| T::deserialize(value))
            .transpose()
    }

    /// Insert a value, returning the previous one if the key already existed
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        let key = key.into();
        match self.position(&key) {
            Some(i) => Some(std::mem::replace(&mut self.entries[i].1, value)),
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
                None
            }
        }
    }

    /// Serialize `value` to JSON and insert it
    pub fn insert_as<T: Serialize + ?Sized>(
        &mut self,
        key: impl Into<String>,
        value: &T,
    ) -> serde_json::Result<Option<Value>> {
        let value = serde_json::to_value(value)?;
        Ok(self.insert(key, value))
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let slot = self.index.remove(key)?;
        let (_, value) = self.entries.remove(slot);
        for (k, _) in &self.entries[slot..] {
            if let Some(i) = self.index.get_mut(k.as_str()) {
                *i -= 1;
            }
        }
        Some(value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.index.get(key).copied()
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for SessionItems {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        let mut items = SessionItems::new();
        for (key, value) in iter {
            items.insert(key, value);
        }
        items
    }
}

/// Application-scoped objects carried alongside a session as an opaque blob.
///
/// `None` means the collection was never touched, which lets the codec skip it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticObjects(Option<Vec<u8>>);

impl StaticObjects {
    /// A collection that was never accessed
    pub fn untouched() -> Self {
        Self(None)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(Some(bytes))
    }

    pub fn is_untouched(&self) -> bool {
        self.0.is_none()
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        self.0.as_deref()
    }

    pub fn set(&mut self, bytes: Vec<u8>) {
        self.0 = Some(bytes);
    }
}

/// Session payload persisted by the backing store
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    /// Session timeout in minutes
    pub timeout_minutes: i32,
    pub items: SessionItems,
    pub static_objects: StaticObjects,
}

impl SessionRecord {
    /// Fresh record with no items and untouched static objects
    pub fn new(timeout_minutes: i32) -> Self {
        Self {
            timeout_minutes,
            items: SessionItems::new(),
            static_objects: StaticObjects::untouched(),
        }
    }
}

/// Lock generation handed out by an exclusive read.
///
/// A write, release or remove only takes effect when it presents the cookie
/// currently stored with the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockCookie(pub i32);

impl LockCookie {
    pub fn value(self) -> i32 {
        self.0
    }
}

impl From<i32> for LockCookie {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl fmt::Display for LockCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the caller must do after a read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    None,
    /// The stored record is a placeholder; populate it and write it back
    InitializeItem,
}

/// Result of a shared or exclusive read
#[derive(Debug, Clone, PartialEq)]
pub struct SessionLookup {
    /// Decoded record; always `None` when `locked` is true or the id is absent
    pub record: Option<SessionRecord>,
    /// Another caller holds the exclusive lock
    pub locked: bool,
    /// Time since the current lock was taken
    pub lock_age: Duration,
    pub lock_cookie: LockCookie,
    pub requires_initialization: bool,
}

impl SessionLookup {
    /// Lookup for an id with no stored row
    pub fn absent() -> Self {
        Self {
            record: None,
            locked: false,
            lock_age: Duration::ZERO,
            lock_cookie: LockCookie::default(),
            requires_initialization: false,
        }
    }

    pub fn action(&self) -> SessionAction {
        if self.requires_initialization {
            SessionAction::InitializeItem
        } else {
            SessionAction::None
        }
    }
}
