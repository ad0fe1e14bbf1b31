use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDef {
    pub name: String,
    pub data_type: String,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// Tabular result of running a dataclip's SQL.
///
/// Each row is positionally aligned with `columns`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub columns: Vec<ColumnDef>,
    pub rows: Vec<Vec<serde_json::Value>>,
    total_rows: usize,
}

impl QueryResult {
    pub fn new(columns: Vec<ColumnDef>, rows: Vec<Vec<serde_json::Value>>) -> Self {
        let total_rows = rows.len();
        Self {
            columns,
            rows,
            total_rows,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    pub fn total_rows(&self) -> usize {
        self.total_rows
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn counts_rows_at_construction() {
        let result = QueryResult::new(
            vec![ColumnDef::new("id", "INT4"), ColumnDef::new("name", "TEXT")],
            vec![vec![json!(1), json!("a")], vec![json!(2), json!("b")]],
        );
        assert_eq!(result.total_rows(), 2);
        assert_eq!(result.column_names().collect::<Vec<_>>(), vec!["id", "name"]);
    }

    #[test]
    fn empty_result_has_no_rows() {
        assert_eq!(QueryResult::empty().total_rows(), 0);
    }
}
