//! Saved SQL queries ("dataclips") that run against a read-only connection,
//! keep their result in a time-limited cache and export it as CSV.

mod cache;
pub mod db;
mod error;
mod export;
pub mod models;
mod runner;
mod state;

pub use cache::{CacheStore, MemoryCache};
pub use db::postgres::PgReadConnection;
pub use db::sqlite::SqliteReadConnection;
pub use db::ReadConnection;
pub use error::{Error, QueryError, RecordError, Result};
pub use export::to_csv;
pub use models::{
    ColumnDef, Dataclip, DataclipSettings, NewDataclip, QueryResult, UpdateDataclip,
};
pub use runner::CachedQueryRunner;
pub use state::AppState;

/// Install `env_logger`, honoring `RUST_LOG` and defaulting to `info`.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}
