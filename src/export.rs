use csv::{QuoteStyle, WriterBuilder};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::models::QueryResult;

/// Render a result as CSV: header row first, every field quoted.
pub fn to_csv(result: &QueryResult, delimiter: u8) -> Result<String> {
    let mut writer = WriterBuilder::new()
        .delimiter(delimiter)
        .quote_style(QuoteStyle::Always)
        .from_writer(Vec::new());

    writer.write_record(result.column_names())?;
    for row in &result.rows {
        writer.write_record(row.iter().map(csv_field))?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| Error::Csv(e.into_error().into()))?;

    String::from_utf8(bytes)
        .map_err(|e| Error::Csv(std::io::Error::new(std::io::ErrorKind::InvalidData, e).into()))
}

/// Text form of one cell. NULL becomes an empty field.
fn csv_field(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}
