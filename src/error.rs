use thiserror::Error;

/// Errors recorded on a single dataclip rather than returned to the caller.
///
/// Validation failures and query execution failures both land here so the
/// caller can render them next to the record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("{0} can't be blank")]
    Blank(&'static str),

    #[error("{0}")]
    QueryExecution(String),
}

/// Failure raised by a read connection while running stored SQL.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Postgres(#[from] sqlx::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("validation failed: {}", join_messages(.0))]
    Invalid(Vec<RecordError>),

    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("metadata store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("failed to connect read connection: {0}")]
    Connect(#[from] sqlx::Error),

    #[error("failed to write csv: {0}")]
    Csv(#[from] csv::Error),

    #[error("invalid settings: {0}")]
    Settings(String),

    #[error("lock poisoned: {0}")]
    Poisoned(String),
}

pub type Result<T> = std::result::Result<T, Error>;

fn join_messages(errors: &[RecordError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
