use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};

use crate::cache::CacheStore;
use crate::db::ReadConnection;
use crate::error::{RecordError, Result};
use crate::export;
use crate::models::{Dataclip, DataclipSettings, QueryResult};

/// Runs a dataclip's SQL through a read-through cache.
///
/// Concurrent misses on the same key are not coalesced: each caller runs the
/// query and the last one to finish wins the cache slot.
pub struct CachedQueryRunner<R, C> {
    reader: R,
    cache: C,
    ttl: Duration,
    csv_delimiter: u8,
}

impl<R: ReadConnection, C: CacheStore> CachedQueryRunner<R, C> {
    pub fn new(reader: R, cache: C) -> Self {
        let defaults = DataclipSettings::default();
        Self {
            reader,
            cache,
            ttl: defaults.cached_query_expiration(),
            csv_delimiter: b',',
        }
    }

    pub fn from_settings(reader: R, cache: C, settings: &DataclipSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            reader,
            cache,
            ttl: settings.cached_query_expiration(),
            csv_delimiter: settings.csv_delimiter()?,
        })
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn reader(&self) -> &R {
        &self.reader
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Result for `clip`, executing its SQL only when neither the instance nor
    /// the cache already holds one.
    ///
    /// Execution failures are recorded on `clip` and yield `Ok(None)`; only
    /// cache store failures are returned as errors.
    pub async fn query_result<'a>(&self, clip: &'a mut Dataclip) -> Result<Option<&'a QueryResult>> {
        if clip.result.is_none() {
            clip.result = self.fetch(clip).await?;
        }
        Ok(clip.result.as_deref())
    }

    async fn fetch(&self, clip: &mut Dataclip) -> Result<Option<Arc<QueryResult>>> {
        let key = clip.cache_key();

        if let Some(hit) = self.cache.get(&key)? {
            debug!("Cache hit for {}", key);
            return Ok(Some(hit));
        }

        debug!("Cache miss for {}, running query", key);
        let outcome = self.reader.select_all(&clip.raw_query).await;
        match outcome {
            Ok(result) => {
                let result = Arc::new(result);
                self.cache.set(&key, result.clone(), self.ttl)?;
                Ok(Some(result))
            }
            Err(e) => {
                warn!("Dataclip {} failed to run: {}", clip.slug, e);
                clip.errors.push(RecordError::QueryExecution(e.to_string()));
                Ok(None)
            }
        }
    }

    /// Whether a cache entry exists for `clip`.
    ///
    /// Checked once per instance; later calls return the first answer even
    /// if the entry has since expired or been filled.
    pub fn is_cached(&self, clip: &mut Dataclip) -> Result<bool> {
        if let Some(cached) = clip.cached {
            return Ok(cached);
        }
        let cached = self.cache.exists(&clip.cache_key())?;
        clip.cached = Some(cached);
        Ok(cached)
    }

    /// Drop the cache entry for `clip` as it currently stands.
    pub fn invalidate(&self, clip: &Dataclip) -> Result<bool> {
        self.invalidate_key(&clip.cache_key())
    }

    pub(crate) fn invalidate_key(&self, key: &str) -> Result<bool> {
        let removed = self.cache.delete(key)?;
        if removed {
            debug!("Invalidated {}", key);
        }
        Ok(removed)
    }

    /// CSV rendering of the result, or `None` when the query failed.
    pub async fn csv_string(&self, clip: &mut Dataclip) -> Result<Option<String>> {
        let delimiter = self.csv_delimiter;
        match self.query_result(clip).await? {
            Some(result) => Ok(Some(export::to_csv(result, delimiter)?)),
            None => Ok(None),
        }
    }
}
