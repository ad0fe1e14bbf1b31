use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use log::info;
use rusqlite::Connection as SqliteConnection;

use crate::cache::CacheStore;
use crate::db::postgres::PgReadConnection;
use crate::db::{sqlite, ReadConnection};
use crate::error::{Error, Result};
use crate::models::{Dataclip, NewDataclip, QueryResult, UpdateDataclip};
use crate::runner::CachedQueryRunner;

/// Dataclip store plus the runner that executes and caches their SQL.
///
/// Every write goes through here so the matching cache entry is dropped.
pub struct AppState<R, C> {
    /// Local SQLite database holding dataclips and settings
    metadata_db: Mutex<SqliteConnection>,

    runner: CachedQueryRunner<R, C>,
}

impl<C: CacheStore> AppState<PgReadConnection, C> {
    /// Open the metadata database in `data_dir` and connect the read pool
    /// described by its stored settings.
    pub async fn connect(data_dir: &Path, cache: C) -> Result<Self> {
        let metadata_db = sqlite::init_database(data_dir)?;
        let settings = sqlite::load_settings(&metadata_db)?;
        let reader = PgReadConnection::connect(&settings.read_connection).await?;
        info!(
            "Connected read pool to {}:{}/{}",
            settings.read_connection.host,
            settings.read_connection.port,
            settings.read_connection.database
        );

        let runner = CachedQueryRunner::from_settings(reader, cache, &settings)?;
        Ok(Self::new(metadata_db, runner))
    }
}

impl<R: ReadConnection, C: CacheStore> AppState<R, C> {
    pub fn new(metadata_db: SqliteConnection, runner: CachedQueryRunner<R, C>) -> Self {
        Self {
            metadata_db: Mutex::new(metadata_db),
            runner,
        }
    }

    /// Open the metadata database in `data_dir` and apply its stored settings
    pub fn open(data_dir: &Path, reader: R, cache: C) -> Result<Self> {
        let metadata_db = sqlite::init_database(data_dir)?;
        let settings = sqlite::load_settings(&metadata_db)?;
        let runner = CachedQueryRunner::from_settings(reader, cache, &settings)?;
        Ok(Self::new(metadata_db, runner))
    }

    pub fn runner(&self) -> &CachedQueryRunner<R, C> {
        &self.runner
    }

    fn db(&self) -> Result<MutexGuard<'_, SqliteConnection>> {
        self.metadata_db
            .lock()
            .map_err(|e| Error::Poisoned(e.to_string()))
    }

    pub fn create_dataclip(&self, mut new: NewDataclip) -> Result<Dataclip> {
        let errors = new.validate();
        if !errors.is_empty() {
            return Err(Error::Invalid(errors));
        }

        let clip = {
            let db = self.db()?;
            sqlite::create_dataclip(&db, &mut new)?
        };
        self.runner.invalidate(&clip)?;

        info!("Created dataclip {}", clip.slug);
        Ok(clip)
    }

    /// Persist edits to `clip`.
    ///
    /// Validation failures are recorded on `clip` and abort the write.
    /// Returns false when the record has been deleted in the meantime.
    pub fn save_dataclip(&self, clip: &mut Dataclip) -> Result<bool> {
        clip.errors.clear();
        let errors = clip.validate();
        if !errors.is_empty() {
            clip.errors.extend(errors.iter().cloned());
            return Err(Error::Invalid(errors));
        }

        let stale_key = clip.cache_key();
        let updated = {
            let db = self.db()?;
            sqlite::update_dataclip(&db, clip)?
        };
        if !updated {
            return Ok(false);
        }

        self.runner.invalidate_key(&stale_key)?;
        self.runner.invalidate(clip)?;
        clip.reset_memo();

        info!("Saved dataclip {}", clip.slug);
        Ok(true)
    }

    pub fn update_dataclip(&self, update: &UpdateDataclip) -> Result<Option<Dataclip>> {
        let Some(mut clip) = self.find_dataclip(&update.slug)? else {
            return Ok(None);
        };

        update.apply(&mut clip);
        if self.save_dataclip(&mut clip)? {
            Ok(Some(clip))
        } else {
            Ok(None)
        }
    }

    pub fn find_dataclip(&self, slug: &str) -> Result<Option<Dataclip>> {
        let db = self.db()?;
        Ok(sqlite::find_dataclip_by_slug(&db, slug)?)
    }

    pub fn find_dataclip_by_token(&self, token: &str) -> Result<Option<Dataclip>> {
        let db = self.db()?;
        Ok(sqlite::find_dataclip_by_token(&db, token)?)
    }

    pub fn load_dataclips(&self) -> Result<Vec<Dataclip>> {
        let db = self.db()?;
        Ok(sqlite::load_dataclips(&db)?)
    }

    pub fn search_dataclips(&self, term: &str) -> Result<Vec<Dataclip>> {
        let db = self.db()?;
        Ok(sqlite::search_dataclips(&db, term)?)
    }

    pub fn delete_dataclip(&self, slug: &str) -> Result<bool> {
        let db = self.db()?;
        match sqlite::find_dataclip_by_slug(&db, slug)? {
            Some(clip) => {
                let deleted = sqlite::delete_dataclip(&db, clip.id)?;
                if deleted {
                    info!("Deleted dataclip {}", slug);
                }
                Ok(deleted)
            }
            None => Ok(false),
        }
    }

    pub async fn query_result<'a>(&self, clip: &'a mut Dataclip) -> Result<Option<&'a QueryResult>> {
        self.runner.query_result(clip).await
    }

    pub async fn csv_string(&self, clip: &mut Dataclip) -> Result<Option<String>> {
        self.runner.csv_string(clip).await
    }

    pub fn is_cached(&self, clip: &mut Dataclip) -> Result<bool> {
        self.runner.is_cached(clip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::db::sqlite::SqliteReadConnection;
    use crate::error::RecordError;
    use crate::models::DataclipSettings;
    use crate::runner::tests::CountingReader;
    use std::sync::Arc;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn metadata_db() -> SqliteConnection {
        let conn = SqliteConnection::open_in_memory().unwrap();
        sqlite::init_schema(&conn).unwrap();
        conn
    }

    fn counting_state() -> AppState<Arc<CountingReader>, MemoryCache> {
        init_logger();
        let runner = CachedQueryRunner::new(Arc::new(CountingReader::default()), MemoryCache::new());
        AppState::new(metadata_db(), runner)
    }

    fn sqlite_state() -> AppState<SqliteReadConnection, MemoryCache> {
        init_logger();
        let data = SqliteConnection::open_in_memory().unwrap();
        data.execute_batch(
            "CREATE TABLE people (id INTEGER, name TEXT);
             INSERT INTO people VALUES (1, 'a'), (2, 'b');",
        )
        .unwrap();
        let runner = CachedQueryRunner::new(SqliteReadConnection::new(data), MemoryCache::new());
        AppState::new(metadata_db(), runner)
    }

    #[tokio::test]
    async fn exports_stored_query_as_csv() {
        let state = sqlite_state();
        let clip = state
            .create_dataclip(NewDataclip::new(
                "People\nEveryone we know",
                "SELECT id, name FROM people ORDER BY id",
            ))
            .unwrap();

        let mut clip = state.find_dataclip(&clip.slug).unwrap().unwrap();
        let csv = state.csv_string(&mut clip).await.unwrap().unwrap();
        assert_eq!(csv, "\"id\",\"name\"\n\"1\",\"a\"\n\"2\",\"b\"\n");
        assert_eq!(clip.total_rows(), Some(2));
        assert_eq!(clip.title(), "People");
    }

    #[tokio::test]
    async fn stored_sql_cannot_change_the_read_database() {
        let state = sqlite_state();
        let mut clip = state
            .create_dataclip(NewDataclip::new("Oops", "DELETE FROM people"))
            .unwrap();
        assert!(state.query_result(&mut clip).await.unwrap().is_some());

        let mut check = state
            .create_dataclip(NewDataclip::new("Count", "SELECT count(*) FROM people"))
            .unwrap();
        let result = state.query_result(&mut check).await.unwrap().unwrap();
        assert_eq!(result.rows[0][0], serde_json::json!(2));
    }

    #[tokio::test]
    async fn invalid_sql_is_recorded_on_the_dataclip() {
        let state = sqlite_state();
        let mut clip = state
            .create_dataclip(NewDataclip::new("Broken", "INVALID SQL"))
            .unwrap();

        assert!(state.query_result(&mut clip).await.unwrap().is_none());
        assert_eq!(clip.errors().len(), 1);
        assert!(matches!(clip.errors()[0], RecordError::QueryExecution(_)));
        assert!(state.csv_string(&mut clip).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn saving_invalidates_cached_result() {
        let state = counting_state();
        let created = state
            .create_dataclip(NewDataclip::new("Numbers", "SELECT id, name FROM t"))
            .unwrap();

        let mut clip = state.find_dataclip(&created.slug).unwrap().unwrap();
        state.query_result(&mut clip).await.unwrap();
        let mut again = state.find_dataclip(&created.slug).unwrap().unwrap();
        state.query_result(&mut again).await.unwrap();
        assert_eq!(state.runner().reader().calls(), 1);
        assert!(state.is_cached(&mut again).unwrap());

        clip.description = "Numbers, renamed".to_string();
        assert!(state.save_dataclip(&mut clip).unwrap());
        assert!(clip.result().is_none());

        let mut fresh = state.find_dataclip(&created.slug).unwrap().unwrap();
        state.query_result(&mut fresh).await.unwrap();
        assert_eq!(state.runner().reader().calls(), 2);
    }

    #[tokio::test]
    async fn update_by_slug_applies_changes() {
        let state = counting_state();
        let created = state
            .create_dataclip(NewDataclip::new("Numbers", "SELECT 1"))
            .unwrap();

        let updated = state
            .update_dataclip(&UpdateDataclip {
                slug: created.slug.clone(),
                description: None,
                raw_query: Some("SELECT 2".to_string()),
            })
            .unwrap()
            .unwrap();
        assert_eq!(updated.raw_query, "SELECT 2");
        assert_eq!(updated.token, created.token);
        assert_eq!(updated.slug, created.slug);

        let missing = state
            .update_dataclip(&UpdateDataclip {
                slug: "nope".to_string(),
                ..UpdateDataclip::default()
            })
            .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn blank_fields_abort_create_and_save() {
        let state = counting_state();
        let err = state.create_dataclip(NewDataclip::new("", "SELECT 1")).unwrap_err();
        assert!(matches!(err, Error::Invalid(ref e) if e == &vec![RecordError::Blank("description")]));
        assert!(state.load_dataclips().unwrap().is_empty());

        let mut clip = state.create_dataclip(NewDataclip::new("ok", "SELECT 1")).unwrap();
        clip.raw_query = "   ".to_string();
        assert!(state.save_dataclip(&mut clip).is_err());
        assert_eq!(clip.errors(), &[RecordError::Blank("raw_query")]);

        let stored = state.find_dataclip(&clip.slug).unwrap().unwrap();
        assert_eq!(stored.raw_query, "SELECT 1");
    }

    #[test]
    fn identities_are_unique_and_stable() {
        let state = counting_state();
        let a = state.create_dataclip(NewDataclip::new("same", "SELECT 1")).unwrap();
        let b = state.create_dataclip(NewDataclip::new("same", "SELECT 1")).unwrap();
        assert_ne!(a.token, b.token);
        assert_ne!(a.slug, b.slug);
        assert_ne!(a.token, a.slug);

        let reread = state.find_dataclip_by_token(&a.token).unwrap().unwrap();
        assert_eq!(reread.slug, a.slug);
        assert_eq!(reread.to_param(), a.slug);
    }

    #[test]
    fn empty_supplied_identity_is_generated() {
        let state = counting_state();
        let blank = || NewDataclip {
            token: Some(String::new()),
            slug: Some(String::new()),
            ..NewDataclip::new("desc", "SELECT 1")
        };

        let a = state.create_dataclip(blank()).unwrap();
        let b = state.create_dataclip(blank()).unwrap();
        assert!(!a.token.is_empty());
        assert!(!a.slug.is_empty());
        assert_ne!(a.slug, b.slug);
        assert_ne!(a.token, b.token);
    }

    #[test]
    fn lists_searches_and_deletes() {
        let state = counting_state();
        let first = state
            .create_dataclip(NewDataclip::new("Daily signups", "SELECT 1"))
            .unwrap();
        let second = state
            .create_dataclip(NewDataclip::new("Weekly revenue", "SELECT 2"))
            .unwrap();

        let slugs: Vec<String> = state
            .load_dataclips()
            .unwrap()
            .into_iter()
            .map(|c| c.slug)
            .collect();
        assert_eq!(slugs, vec![second.slug.clone(), first.slug.clone()]);

        let hits = state.search_dataclips("signups").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].slug, first.slug);

        assert!(state.delete_dataclip(&first.slug).unwrap());
        assert!(!state.delete_dataclip(&first.slug).unwrap());
        assert!(state.find_dataclip(&first.slug).unwrap().is_none());
    }

    #[test]
    fn open_applies_stored_settings() {
        let dir = tempfile::tempdir().unwrap();
        {
            let conn = sqlite::init_database(dir.path()).unwrap();
            let mut settings = DataclipSettings::default();
            settings.cache.expiration_secs = 42;
            sqlite::save_settings(&conn, &settings).unwrap();
        }

        let state = AppState::open(dir.path(), CountingReader::default(), MemoryCache::new()).unwrap();
        assert_eq!(state.runner().ttl(), std::time::Duration::from_secs(42));
    }
}
