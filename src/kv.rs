//! Namespaced key-value storage used for caching and idempotence tracking
//!
//! The federation keeps remote documents, fetched public keys, inbox
//! idempotence markers and the per-origin signature-spec memory in a
//! [KvStore]. Applications plug in their own backend; [MemoryKvStore] is
//! the bundled single-process implementation.

use crate::error::Error;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// A non-empty sequence of strings treated as a namespaced path.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct KvKey(Vec<String>);

impl KvKey {
    /// Creates a key from its parts. Fails on an empty sequence.
    pub fn new<I, S>(parts: I) -> Result<KvKey, Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let parts: Vec<String> = parts.into_iter().map(Into::into).collect();
        if parts.is_empty() {
            return Err(Error::Kv("key must not be empty".to_string()));
        }
        Ok(KvKey(parts))
    }

    /// Returns a new key with `part` appended.
    pub fn with<S: Into<String>>(&self, part: S) -> KvKey {
        let mut parts = self.0.clone();
        parts.push(part.into());
        KvKey(parts)
    }

    /// The key's parts.
    pub fn parts(&self) -> &[String] {
        &self.0
    }
}

/// Storage contract the federation runs against.
///
/// Implementations must treat expired entries as absent and must preserve
/// an entry's creation instant across overwrites. `cas` is optional;
/// backends without native compare-and-swap report [Error::Kv].
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Reads a value. Absent and expired keys both return `None`.
    async fn get(&self, key: &KvKey) -> Result<Option<Value>, Error>;

    /// Writes a value, optionally expiring after `ttl`.
    async fn set(&self, key: &KvKey, value: Value, ttl: Option<Duration>) -> Result<(), Error>;

    /// Removes a key. Removing an absent key is not an error.
    async fn delete(&self, key: &KvKey) -> Result<(), Error>;

    /// Atomically replaces `expected` with `new`.
    ///
    /// `None` stands for absence on both sides: `expected = None` succeeds
    /// only if the key is missing (or expired), `new = None` deletes.
    /// Comparison is deep structural equality on the JSON value.
    async fn cas(
        &self,
        key: &KvKey,
        expected: Option<&Value>,
        new: Option<Value>,
        ttl: Option<Duration>,
    ) -> Result<bool, Error> {
        let _ = (key, expected, new, ttl);
        Err(Error::Kv("compare-and-swap is not supported by this backend".to_string()))
    }
}

#[derive(Clone, Debug)]
struct StoredEntry {
    value: Value,
    created: DateTime<Utc>,
    expires: Option<DateTime<Utc>>,
}

impl StoredEntry {
    fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.map(|e| e <= now).unwrap_or(false)
    }
}

/// In-memory [KvStore] for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<KvKey, StoredEntry>>,
}

impl MemoryKvStore {
    /// Creates an empty store.
    pub fn new() -> MemoryKvStore {
        MemoryKvStore::default()
    }

    #[cfg(test)]
    pub(crate) async fn created_at(&self, key: &KvKey) -> Option<DateTime<Utc>> {
        self.entries.lock().await.get(key).map(|e| e.created)
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &KvKey) -> Result<Option<Value>, Error> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|e| !e.expired(Utc::now()))
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &KvKey, value: Value, ttl: Option<Duration>) -> Result<(), Error> {
        let mut entries = self.entries.lock().await;
        let now = Utc::now();
        // An overwrite keeps the original creation instant; an expired
        // entry counts as a fresh insert.
        let created = entries
            .get(key)
            .filter(|e| !e.expired(now))
            .map(|e| e.created)
            .unwrap_or(now);
        entries.insert(
            key.clone(),
            StoredEntry {
                value,
                created,
                expires: ttl.map(|t| now + t),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &KvKey) -> Result<(), Error> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn cas(
        &self,
        key: &KvKey,
        expected: Option<&Value>,
        new: Option<Value>,
        ttl: Option<Duration>,
    ) -> Result<bool, Error> {
        let mut entries = self.entries.lock().await;
        let now = Utc::now();
        let current = entries.get(key).filter(|e| !e.expired(now));
        if current.map(|e| &e.value) != expected {
            return Ok(false);
        }
        match new {
            Some(value) => {
                let created = current.map(|e| e.created).unwrap_or(now);
                entries.insert(
                    key.clone(),
                    StoredEntry {
                        value,
                        created,
                        expires: ttl.map(|t| now + t),
                    },
                );
            }
            None => {
                entries.remove(key);
            }
        }
        Ok(true)
    }
}
