use log::warn;
use serde_json::Value;
use sqlx::postgres::types::{Oid, PgInterval};
use sqlx::postgres::{PgPoolOptions, PgRow, PgValueFormat};
use sqlx::{Column, Executor, PgPool, Row, TypeInfo, ValueRef};
use std::time::Duration;

use crate::db::ReadConnection;
use crate::error::QueryError;
use crate::models::{ColumnDef, QueryResult, ReadConnectionSettings};

/// Create the pool used for running stored SQL
pub async fn create_pool(settings: &ReadConnectionSettings) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(Duration::from_secs(settings.acquire_timeout_secs))
        .connect(&settings.connection_string())
        .await?;

    Ok(pool)
}

/// Read connection backed by a PostgreSQL pool that is never used for writes.
#[derive(Clone)]
pub struct PgReadConnection {
    pool: PgPool,
}

impl PgReadConnection {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(settings: &ReadConnectionSettings) -> Result<Self, sqlx::Error> {
        Ok(Self::new(create_pool(settings).await?))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl ReadConnection for PgReadConnection {
    async fn select_all(&self, sql: &str) -> Result<QueryResult, QueryError> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(sql).fetch_all(&mut *tx).await;
        // An empty result carries no column metadata, so ask the server for it
        let described = match rows {
            Ok(ref rows) if rows.is_empty() => (&mut *tx)
                .describe(sql)
                .await
                .ok()
                .map(|d| columns_of(d.columns())),
            _ => None,
        };

        // Whatever the statement did, it does not survive
        let rows = settle(rows, tx.rollback().await)?;
        let columns = match described {
            Some(columns) => columns,
            None => rows.first().map(|r| columns_of(r.columns())).unwrap_or_default(),
        };

        let values = rows
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .enumerate()
                    .map(|(i, col)| column_value(row, i, &col.data_type))
                    .collect()
            })
            .collect();

        Ok(QueryResult::new(columns, values))
    }
}

/// Combine the statement outcome with the rollback outcome. A statement error
/// wins over a rollback error, which is only logged in that case.
fn settle<T>(
    outcome: Result<T, sqlx::Error>,
    rolled_back: Result<(), sqlx::Error>,
) -> Result<T, sqlx::Error> {
    match (outcome, rolled_back) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(rollback)) => {
            warn!("Rollback of read transaction failed: {}", rollback);
            Err(e)
        }
    }
}

fn columns_of<C: Column>(columns: &[C]) -> Vec<ColumnDef> {
    columns
        .iter()
        .map(|col| ColumnDef::new(col.name(), col.type_info().name()))
        .collect()
}

fn number_or_string(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(n.to_string()))
}

/// Convert one cell to JSON, choosing the Rust type from the column's type name
fn column_value(row: &PgRow, index: usize, type_name: &str) -> Value {
    let upper_type = type_name.to_uppercase();

    let decoded: Result<Option<Value>, sqlx::Error> = match upper_type.as_str() {
        "INT2" | "SMALLINT" => row.try_get::<Option<i16>, _>(index).map(|v| v.map(Value::from)),
        "INT4" | "INTEGER" | "SERIAL" => {
            row.try_get::<Option<i32>, _>(index).map(|v| v.map(Value::from))
        }
        "OID" => row
            .try_get::<Option<Oid>, _>(index)
            .map(|v| v.map(|oid| Value::from(oid.0))),
        "INT8" | "BIGINT" | "BIGSERIAL" => {
            row.try_get::<Option<i64>, _>(index).map(|v| v.map(Value::from))
        }
        "FLOAT4" | "REAL" => row
            .try_get::<Option<f32>, _>(index)
            .map(|v| v.map(|n| number_or_string(n as f64))),
        "FLOAT8" | "DOUBLE PRECISION" => row
            .try_get::<Option<f64>, _>(index)
            .map(|v| v.map(number_or_string)),
        // Kept as text so no precision is lost
        "NUMERIC" | "DECIMAL" => row
            .try_get::<Option<rust_decimal::Decimal>, _>(index)
            .map(|v| v.map(|d| Value::String(d.to_string()))),
        "BOOL" | "BOOLEAN" => row.try_get::<Option<bool>, _>(index).map(|v| v.map(Value::Bool)),
        "JSON" | "JSONB" => row.try_get::<Option<Value>, _>(index),
        "UUID" => row
            .try_get::<Option<uuid::Uuid>, _>(index)
            .map(|v| v.map(|u| Value::String(u.to_string()))),
        "TIMESTAMP" => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(index)
            .map(|v| v.map(|dt| Value::String(dt.format("%Y-%m-%d %H:%M:%S%.f").to_string()))),
        "TIMESTAMPTZ" => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index)
            .map(|v| v.map(|dt| Value::String(dt.to_rfc3339()))),
        "DATE" => row
            .try_get::<Option<chrono::NaiveDate>, _>(index)
            .map(|v| v.map(|d| Value::String(d.to_string()))),
        "TIME" => row
            .try_get::<Option<chrono::NaiveTime>, _>(index)
            .map(|v| v.map(|t| Value::String(t.format("%H:%M:%S%.f").to_string()))),
        "INET" | "CIDR" => row
            .try_get::<Option<ipnetwork::IpNetwork>, _>(index)
            .map(|v| v.map(|ip| Value::String(ip.to_string()))),
        "MACADDR" => row
            .try_get::<Option<mac_address::MacAddress>, _>(index)
            .map(|v| v.map(|mac| Value::String(mac.to_string()))),
        "INTERVAL" => row
            .try_get::<Option<PgInterval>, _>(index)
            .map(|v| v.map(|i| Value::String(format_interval(&i)))),
        "BYTEA" => row
            .try_get::<Option<Vec<u8>>, _>(index)
            .map(|v| v.map(|bytes| Value::String(format!("\\x{}", hex::encode(bytes))))),
        t if t.starts_with('_') || t.ends_with("[]") => array_value(row, index),
        _ => row.try_get::<Option<String>, _>(index).map(|v| v.map(Value::String)),
    };

    match decoded {
        Ok(Some(value)) => value,
        Ok(None) => Value::Null,
        Err(_) => raw_text(row, index),
    }
}

fn array_value(row: &PgRow, index: usize) -> Result<Option<Value>, sqlx::Error> {
    fn array<T: Into<Value>>(items: Option<Vec<T>>) -> Option<Value> {
        items.map(|items| Value::Array(items.into_iter().map(Into::into).collect()))
    }

    row.try_get::<Option<Vec<i32>>, _>(index)
        .map(array)
        .or_else(|_| row.try_get::<Option<Vec<i64>>, _>(index).map(array))
        .or_else(|_| row.try_get::<Option<Vec<f64>>, _>(index).map(array))
        .or_else(|_| row.try_get::<Option<Vec<bool>>, _>(index).map(array))
        .or_else(|_| row.try_get::<Option<Vec<String>>, _>(index).map(array))
}

/// Render an interval the way `psql` does, e.g. `1 year 2 mons 3 days 04:05:06`
fn format_interval(interval: &PgInterval) -> String {
    fn plural(n: i32, unit: &str) -> String {
        format!("{} {}{}", n, unit, if n.abs() != 1 { "s" } else { "" })
    }

    let mut parts = Vec::new();
    let years = interval.months / 12;
    let months = interval.months % 12;
    if years != 0 {
        parts.push(plural(years, "year"));
    }
    if months != 0 {
        parts.push(plural(months, "mon"));
    }
    if interval.days != 0 {
        parts.push(plural(interval.days, "day"));
    }

    if interval.microseconds != 0 || parts.is_empty() {
        let sign = if interval.microseconds < 0 { "-" } else { "" };
        let micros_total = interval.microseconds.unsigned_abs();
        let secs_total = micros_total / 1_000_000;
        let micros = micros_total % 1_000_000;
        let clock = format!(
            "{}{:02}:{:02}:{:02}",
            sign,
            secs_total / 3600,
            (secs_total % 3600) / 60,
            secs_total % 60
        );
        if micros != 0 {
            parts.push(format!("{}.{:06}", clock, micros));
        } else {
            parts.push(clock);
        }
    }

    parts.join(" ")
}

/// Last resort for types without a decoder: the server's text form.
/// Binary-format values have no portable rendering and become null.
fn raw_text(row: &PgRow, index: usize) -> Value {
    match row.try_get_raw(index) {
        Ok(raw) if !raw.is_null() && raw.format() == PgValueFormat::Text => raw
            .as_str()
            .map(|s| Value::String(s.to_string()))
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_finite_floats_fall_back_to_text() {
        assert_eq!(number_or_string(1.5), serde_json::json!(1.5));
        assert_eq!(number_or_string(f64::NAN), Value::String("NaN".to_string()));
    }

    #[test]
    fn statement_error_outlives_failed_rollback() {
        let outcome: Result<(), sqlx::Error> =
            Err(sqlx::Error::Protocol("relation \"missing\" does not exist".to_string()));
        let rolled_back = Err(sqlx::Error::PoolClosed);

        let err = settle(outcome, rolled_back).unwrap_err();
        assert!(err.to_string().contains("relation \"missing\" does not exist"));

        let err = settle(Ok(1), Err(sqlx::Error::PoolClosed)).unwrap_err();
        assert!(matches!(err, sqlx::Error::PoolClosed));
        assert_eq!(settle(Ok(1), Ok(())).unwrap(), 1);
    }

    fn interval(months: i32, days: i32, microseconds: i64) -> PgInterval {
        PgInterval {
            months,
            days,
            microseconds,
        }
    }

    #[test]
    fn intervals_render_as_text() {
        assert_eq!(format_interval(&interval(0, 1, 0)), "1 day");
        assert_eq!(format_interval(&interval(0, 0, 3_600_000_000)), "01:00:00");
        assert_eq!(
            format_interval(&interval(14, 3, 90_500_000)),
            "1 year 2 mons 3 days 00:01:30.500000"
        );
        assert_eq!(format_interval(&interval(0, -2, -61_000_000)), "-2 days -00:01:01");
        assert_eq!(format_interval(&interval(0, 0, 0)), "00:00:00");
    }

    #[tokio::test]
    async fn unreachable_server_fails_to_connect() {
        let settings = ReadConnectionSettings {
            host: "127.0.0.1".to_string(),
            port: 1,
            acquire_timeout_secs: 1,
            ..ReadConnectionSettings::default()
        };
        assert!(PgReadConnection::connect(&settings).await.is_err());
    }
}
