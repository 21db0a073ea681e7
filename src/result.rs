use crate::core::{Fields, Value};
use serde::Serialize;

/// Result of [`BaseAccessor::execute_raw_query`](crate::accessor::BaseAccessor::execute_raw_query).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Fields>,
    /// Rows written by INSERT / UPDATE / DELETE; zero for reads.
    pub rows_affected: u64,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            rows_affected: 0,
        }
    }

    pub fn rows(columns: Vec<String>, rows: Vec<Fields>) -> Self {
        Self {
            columns,
            rows,
            rows_affected: 0,
        }
    }

    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            ..Self::empty()
        }
    }

    /// Single-value result such as `SELECT COUNT(*)`.
    pub fn scalar(column: &str, value: Value) -> Self {
        let mut row = Fields::new();
        row.insert(column.to_string(), value);
        Self::rows(vec![column.to_string()], vec![row])
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn first(&self) -> Option<&Fields> {
        self.rows.first()
    }
}
