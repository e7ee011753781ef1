//! Temporal state cache with whole-cache aging.
//!
//! Status records are stored under namespaced keys (`peer:<id>`,
//! `network:<id>`, ...) next to two kinds of sentinel keys: `utc-time`, the
//! instant of the last successful refresh, and named wait tickets that expire
//! on their own. Thread-safe via `DashMap`; expired tickets are evicted lazily
//! on access.
//!
//! Aging is all-or-nothing: [`TemporalCache::with_cache_aging`] clears every
//! entry once the last successful refresh is older than the configured maximum
//! age, and a failed refresh never moves that instant forward.

use crate::clock::{deadline_after, Clock};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fpnd_types::error::FpndResult;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Sentinel key holding the last successful refresh instant.
pub const UTC_TIME: &str = "utc-time";

/// Namespace of a cached status record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    Node,
    Peer,
    Network,
    Moon,
    MoonState,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Peer => "peer",
            Self::Network => "network",
            Self::Moon => "moon",
            Self::MoonState => "moon-state",
        }
    }

    /// Namespaced cache key for `id`.
    pub fn key(&self, id: &str) -> String {
        format!("{}:{}", self.as_str(), id)
    }
}

/// A cached value with an optional expiry.
struct CacheEntry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

/// String-keyed state cache shared by the reconciler and its helpers.
pub struct TemporalCache {
    entries: DashMap<String, CacheEntry>,
    max_age: Duration,
    clock: Arc<dyn Clock>,
}

impl TemporalCache {
    /// Create an empty cache that ages out after `max_age`.
    pub fn new(max_age: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            max_age,
            clock,
        }
    }

    /// Get a value by key. Returns `None` if missing or expired.
    pub fn get(&self, key: &str) -> Option<Value> {
        let entry = self.entries.get(key)?;
        if let Some(expires_at) = entry.expires_at {
            if self.clock.now() >= expires_at {
                drop(entry); // release read lock before removing
                self.entries.remove(key);
                return None;
            }
        }
        Some(entry.value.clone())
    }

    /// Get a value and decode it into `T`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> FpndResult<Option<T>> {
        match self.get(key) {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.entries.insert(
            key.into(),
            CacheEntry {
                value,
                expires_at: None,
            },
        );
    }

    /// Store a value that disappears after `ttl`. A `ttl` too large to
    /// represent never expires.
    pub fn set_with_ttl(&self, key: impl Into<String>, value: Value, ttl: Duration) {
        self.entries.insert(
            key.into(),
            CacheEntry {
                value,
                expires_at: deadline_after(self.clock.now(), ttl),
            },
        );
    }

    /// Serialize `record` and store it under `<kind>:<id>`.
    pub fn load<T: Serialize>(&self, kind: KeyType, id: &str, record: &T) -> FpndResult<()> {
        self.set(kind.key(id), serde_json::to_value(record)?);
        Ok(())
    }

    /// Remove a key. Returns true if it was present.
    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every entry, sentinels included.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of entries (including possibly expired tickets).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Keys in one namespace, sorted.
    pub fn keys_of(&self, kind: KeyType) -> Vec<String> {
        let prefix = format!("{}:", kind.as_str());
        self.keys()
            .into_iter()
            .filter(|k| k.starts_with(&prefix))
            .collect()
    }

    /// Drop every expired entry now instead of waiting for access.
    pub fn evict_expired(&self) {
        let now = self.clock.now();
        self.entries
            .retain(|_, e| e.expires_at.map(|t| now < t).unwrap_or(true));
    }

    /// Instant of the last successful refresh, if any.
    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.get(UTC_TIME)
            .and_then(|v| serde_json::from_value::<DateTime<Utc>>(v).ok())
    }

    fn set_last_refresh(&self, at: DateTime<Utc>) {
        self.set(UTC_TIME, Value::String(at.to_rfc3339()));
    }

    /// Raise a wait ticket for `ttl`.
    pub fn set_ticket(&self, name: &str, ttl: Duration) {
        debug!(ticket = %name, ttl_secs = ttl.as_secs(), "Setting wait ticket");
        self.set_with_ttl(name, Value::Bool(true), ttl);
    }

    /// Whether the named wait ticket is still active.
    pub fn ticket_active(&self, name: &str) -> bool {
        self.get(name).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    /// Log cache size and keys at debug level.
    pub fn log_stats(&self, msg: &str) {
        debug!(items = self.len(), keys = ?self.keys(), "{msg}");
    }

    /// Run `refresh` under the aging policy.
    ///
    /// 1. If the last refresh is older than the maximum age, clear the cache.
    /// 2. Run `refresh`. `Ok(None)` means no fresh data was available.
    /// 3. On data, stamp `utc-time` with the entry instant. On no data, restore
    ///    the previous stamp so repeated failures keep aging from the last
    ///    success. A first-ever run with no data stamps the entry instant.
    ///
    /// An `Err` from `refresh` is returned unchanged and no stamp is written.
    pub async fn with_cache_aging<T, E, F, Fut>(&self, refresh: F) -> Result<Option<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        let now = self.clock.now();
        self.log_stats("Entering cache wrapper");

        let previous = self.last_refresh();
        if let Some(last) = previous {
            let age = (now - last).num_seconds();
            let max_age = i64::try_from(self.max_age.as_secs()).unwrap_or(i64::MAX);
            debug!(age_secs = age, max_age_secs = max_age, "Cache age");
            if age > max_age {
                debug!("Cache data is too old, stale data will be removed");
                self.clear();
            }
        }

        let result = refresh().await?;

        match (&result, previous) {
            (None, Some(last)) => {
                self.set_last_refresh(last);
                debug!(stamp = %last.to_rfc3339(), "No data, keeping old cache time");
            }
            _ => {
                self.set_last_refresh(now);
                debug!(stamp = %now.to_rfc3339(), "New cache time");
            }
        }
        Ok(result)
    }
}
