use std::future::Future;

use crate::error::QueryError;
use crate::models::QueryResult;

pub mod postgres;
pub mod sqlite;

/// A connection used only to run stored SQL.
///
/// Implementations must run `sql` inside a transaction and always roll that
/// transaction back, whatever the statement does and whether it succeeds.
pub trait ReadConnection: Send + Sync {
    fn select_all(&self, sql: &str) -> impl Future<Output = Result<QueryResult, QueryError>> + Send;
}

impl<R: ReadConnection> ReadConnection for std::sync::Arc<R> {
    fn select_all(&self, sql: &str) -> impl Future<Output = Result<QueryResult, QueryError>> + Send {
        (**self).select_all(sql)
    }
}
