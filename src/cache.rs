use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::models::QueryResult;

/// Process-wide key-value store for query results.
///
/// Failures are reported as [`Error::CacheUnavailable`] and are not retried
/// or swallowed by callers.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Arc<QueryResult>>>;

    fn set(&self, key: &str, value: Arc<QueryResult>, ttl: Duration) -> Result<()>;

    fn exists(&self, key: &str) -> Result<bool>;

    /// Returns whether an entry was removed.
    fn delete(&self, key: &str) -> Result<bool>;
}

impl<C: CacheStore + ?Sized> CacheStore for Arc<C> {
    fn get(&self, key: &str) -> Result<Option<Arc<QueryResult>>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: Arc<QueryResult>, ttl: Duration) -> Result<()> {
        (**self).set(key, value, ttl)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        (**self).exists(key)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        (**self).delete(key)
    }
}

struct CacheEntry {
    value: Arc<QueryResult>,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-memory [`CacheStore`] with per-entry expiry.
///
/// Expired entries are dropped lazily when their key is next touched.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, CacheEntry>>> {
        self.entries
            .lock()
            .map_err(|e| Error::CacheUnavailable(e.to_string()))
    }

    /// Number of entries that have not yet expired.
    pub fn len(&self) -> Result<usize> {
        let now = Instant::now();
        let entries = self.lock()?;
        Ok(entries.values().filter(|e| e.is_live(now)).count())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Remove every expired entry, returning how many were dropped.
    pub fn purge_expired(&self) -> Result<usize> {
        let now = Instant::now();
        let mut entries = self.lock()?;
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        Ok(before - entries.len())
    }
}

impl CacheStore for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<Arc<QueryResult>>> {
        let now = Instant::now();
        let mut entries = self.lock()?;
        let lookup = entries
            .get(key)
            .map(|entry| entry.is_live(now).then(|| entry.value.clone()));
        match lookup {
            Some(Some(value)) => Ok(Some(value)),
            Some(None) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: Arc<QueryResult>, ttl: Duration) -> Result<()> {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        let mut entries = self.lock()?;
        entries.insert(key.to_string(), entry);
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let mut entries = self.lock()?;
        Ok(entries.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ColumnDef;
    use serde_json::json;

    fn result() -> Arc<QueryResult> {
        Arc::new(QueryResult::new(
            vec![ColumnDef::new("n", "INT4")],
            vec![vec![json!(1)]],
        ))
    }

    #[test]
    fn stores_and_returns_entries() {
        let cache = MemoryCache::new();
        assert!(cache.get("k").unwrap().is_none());

        cache.set("k", result(), Duration::from_secs(60)).unwrap();
        assert!(cache.exists("k").unwrap());
        assert_eq!(cache.get("k").unwrap().unwrap().total_rows(), 1);
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[test]
    fn expired_entries_are_misses() {
        let cache = MemoryCache::new();
        cache.set("k", result(), Duration::from_millis(0)).unwrap();
        assert!(!cache.exists("k").unwrap());
        assert!(cache.is_empty().unwrap());
    }

    #[test]
    fn purge_drops_only_expired_entries() {
        let cache = MemoryCache::new();
        cache.set("old", result(), Duration::from_millis(0)).unwrap();
        cache.set("new", result(), Duration::from_secs(60)).unwrap();
        assert_eq!(cache.purge_expired().unwrap(), 1);
        assert!(cache.exists("new").unwrap());
    }

    #[test]
    fn delete_reports_removal() {
        let cache = MemoryCache::new();
        cache.set("k", result(), Duration::from_secs(60)).unwrap();
        assert!(cache.delete("k").unwrap());
        assert!(!cache.delete("k").unwrap());
        assert!(!cache.exists("k").unwrap());
    }

    #[test]
    fn shared_handle_sees_same_entries() {
        let cache = Arc::new(MemoryCache::new());
        let other = cache.clone();
        cache.set("k", result(), Duration::from_secs(60)).unwrap();
        assert!(other.exists("k").unwrap());
    }
}
