use rusqlite::types::ValueRef;
use rusqlite::{Connection, OptionalExtension, Result as SqliteResult, Row, Transaction};
use std::path::Path;
use std::sync::Mutex;

use crate::db::ReadConnection;
use crate::error::QueryError;
use crate::models::{ColumnDef, Dataclip, DataclipSettings, NewDataclip, QueryResult};

const DATACLIP_COLUMNS: &str =
    "id, token, slug, description, raw_query, created_at, updated_at";

/// Open (or create) the metadata database in `data_dir` and ensure its tables exist
pub fn init_database(data_dir: &Path) -> SqliteResult<Connection> {
    std::fs::create_dir_all(data_dir).ok();
    let db_path = data_dir.join("dataclip.db");

    let conn = Connection::open(&db_path)?;
    init_schema(&conn)?;

    Ok(conn)
}

/// Create tables on an already open connection
pub fn init_schema(conn: &Connection) -> SqliteResult<()> {
    conn.execute_batch(
        r#"
        -- Description search matches case, like LIKE on the server side
        PRAGMA case_sensitive_like = ON;

        -- Saved queries
        CREATE TABLE IF NOT EXISTS dataclips (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            token TEXT NOT NULL UNIQUE,
            slug TEXT NOT NULL UNIQUE,
            description TEXT NOT NULL CHECK (length(trim(description)) > 0),
            raw_query TEXT NOT NULL CHECK (length(trim(raw_query)) > 0),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS dataclips_updated_at ON dataclips (updated_at DESC);

        -- Settings (single row)
        CREATE TABLE IF NOT EXISTS app_settings (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            settings_json TEXT NOT NULL,
            updated_at TEXT DEFAULT CURRENT_TIMESTAMP
        );
        "#,
    )
}

/// Timestamps are fixed-width so text ordering matches time ordering
fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

fn row_to_dataclip(row: &Row<'_>) -> SqliteResult<Dataclip> {
    Ok(Dataclip::from_parts(
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

// ==================== Dataclips ====================

/// Insert a new dataclip, assigning its token and slug first if unset
pub fn create_dataclip(conn: &Connection, new: &mut NewDataclip) -> SqliteResult<Dataclip> {
    new.assign_identity();
    let token = new.token.clone().unwrap_or_default();
    let slug = new.slug.clone().unwrap_or_default();
    let now = now_timestamp();

    conn.execute(
        r#"
        INSERT INTO dataclips (token, slug, description, raw_query, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
        (&token, &slug, &new.description, &new.raw_query, &now, &now),
    )?;

    Ok(Dataclip::from_parts(
        conn.last_insert_rowid(),
        token,
        slug,
        new.description.clone(),
        new.raw_query.clone(),
        now.clone(),
        now,
    ))
}

/// Load all dataclips, most recently updated first
pub fn load_dataclips(conn: &Connection) -> SqliteResult<Vec<Dataclip>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM dataclips ORDER BY updated_at DESC, id DESC",
        DATACLIP_COLUMNS
    ))?;

    let clips = stmt.query_map([], row_to_dataclip)?;
    clips.collect()
}

/// Dataclips whose description contains `term`, most recently updated first.
/// `%` and `_` in the term keep their LIKE meaning.
pub fn search_dataclips(conn: &Connection, term: &str) -> SqliteResult<Vec<Dataclip>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM dataclips WHERE description LIKE ?1 ORDER BY updated_at DESC, id DESC",
        DATACLIP_COLUMNS
    ))?;

    let pattern = format!("%{}%", term);
    let clips = stmt.query_map([&pattern], row_to_dataclip)?;
    clips.collect()
}

pub fn get_dataclip(conn: &Connection, id: i64) -> SqliteResult<Option<Dataclip>> {
    conn.query_row(
        &format!("SELECT {} FROM dataclips WHERE id = ?1", DATACLIP_COLUMNS),
        [id],
        row_to_dataclip,
    )
    .optional()
}

pub fn find_dataclip_by_slug(conn: &Connection, slug: &str) -> SqliteResult<Option<Dataclip>> {
    conn.query_row(
        &format!("SELECT {} FROM dataclips WHERE slug = ?1", DATACLIP_COLUMNS),
        [slug],
        row_to_dataclip,
    )
    .optional()
}

pub fn find_dataclip_by_token(conn: &Connection, token: &str) -> SqliteResult<Option<Dataclip>> {
    conn.query_row(
        &format!("SELECT {} FROM dataclips WHERE token = ?1", DATACLIP_COLUMNS),
        [token],
        row_to_dataclip,
    )
    .optional()
}

/// Write description and SQL back and bump `updated_at`.
/// Returns false when the row no longer exists.
pub fn update_dataclip(conn: &Connection, clip: &mut Dataclip) -> SqliteResult<bool> {
    let now = now_timestamp();

    let rows_affected = conn.execute(
        r#"
        UPDATE dataclips
        SET description = ?1, raw_query = ?2, updated_at = ?3
        WHERE id = ?4
        "#,
        (&clip.description, &clip.raw_query, &now, clip.id),
    )?;

    if rows_affected > 0 {
        clip.updated_at = now;
    }
    Ok(rows_affected > 0)
}

pub fn delete_dataclip(conn: &Connection, id: i64) -> SqliteResult<bool> {
    let rows_affected = conn.execute("DELETE FROM dataclips WHERE id = ?1", [id])?;
    Ok(rows_affected > 0)
}

// ==================== Settings ====================

/// Load settings, falling back to defaults when none are stored or the row is unreadable
pub fn load_settings(conn: &Connection) -> SqliteResult<DataclipSettings> {
    let json: Option<String> = conn
        .query_row("SELECT settings_json FROM app_settings WHERE id = 1", [], |row| row.get(0))
        .optional()?;

    match json {
        Some(json) => match serde_json::from_str(&json) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                log::warn!("Stored settings are unreadable, using defaults: {}", e);
                Ok(DataclipSettings::default())
            }
        },
        None => Ok(DataclipSettings::default()),
    }
}

pub fn save_settings(conn: &Connection, settings: &DataclipSettings) -> SqliteResult<()> {
    let json = serde_json::to_string(settings)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

    conn.execute(
        r#"
        INSERT INTO app_settings (id, settings_json, updated_at)
        VALUES (1, ?1, CURRENT_TIMESTAMP)
        ON CONFLICT(id) DO UPDATE SET
            settings_json = excluded.settings_json,
            updated_at = CURRENT_TIMESTAMP
        "#,
        [&json],
    )?;
    Ok(())
}

// ==================== Read connection ====================

/// Runs stored SQL against a SQLite database, for embedded deployments.
///
/// The statement executes on the calling task; SQLite has no async driver.
pub struct SqliteReadConnection {
    conn: Mutex<Connection>,
}

impl SqliteReadConnection {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    pub fn open(path: &Path) -> SqliteResult<Self> {
        Ok(Self::new(Connection::open(path)?))
    }

    /// Run `sql` in a transaction that is rolled back no matter what
    pub fn select_all_blocking(&self, sql: &str) -> Result<QueryResult, QueryError> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| QueryError::Other(e.to_string()))?;

        let tx = conn.transaction()?;
        let result = select_in(&tx, sql);
        tx.rollback()?;

        Ok(result?)
    }
}

impl ReadConnection for SqliteReadConnection {
    fn select_all(
        &self,
        sql: &str,
    ) -> impl std::future::Future<Output = Result<QueryResult, QueryError>> + Send {
        futures::future::ready(self.select_all_blocking(sql))
    }
}

fn select_in(tx: &Transaction<'_>, sql: &str) -> SqliteResult<QueryResult> {
    let mut stmt = tx.prepare(sql)?;
    let names: Vec<String> = stmt.column_names().iter().map(|n| n.to_string()).collect();
    let mut data_types: Vec<Option<&'static str>> = vec![None; names.len()];

    let mut rows = Vec::new();
    let mut cursor = stmt.query([])?;
    while let Some(row) = cursor.next()? {
        let mut values = Vec::with_capacity(names.len());
        for (i, data_type) in data_types.iter_mut().enumerate() {
            let value = row.get_ref(i)?;
            if data_type.is_none() && !matches!(value, ValueRef::Null) {
                *data_type = Some(sqlite_type_name(value));
            }
            values.push(sqlite_value_to_json(value));
        }
        rows.push(values);
    }

    let columns = names
        .into_iter()
        .zip(data_types)
        .map(|(name, data_type)| ColumnDef::new(name, data_type.unwrap_or("NULL")))
        .collect();

    Ok(QueryResult::new(columns, rows))
}

fn sqlite_type_name(value: ValueRef<'_>) -> &'static str {
    match value {
        ValueRef::Null => "NULL",
        ValueRef::Integer(_) => "INTEGER",
        ValueRef::Real(_) => "REAL",
        ValueRef::Text(_) => "TEXT",
        ValueRef::Blob(_) => "BLOB",
    }
}

fn sqlite_value_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(n) => serde_json::Value::Number(n.into()),
        ValueRef::Real(n) => serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or_else(|| serde_json::Value::String(n.to_string())),
        ValueRef::Text(bytes) => serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => serde_json::Value::String(format!("\\x{}", hex::encode(bytes))),
    }
}
