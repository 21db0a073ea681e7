// ============================================================================
// Bound raw-SQL statements
// ============================================================================
//
// The subset of SQL accepted by `BaseAccessor::execute_raw_query`, with every
// `$n` placeholder already replaced by its binding.
//
// ============================================================================

use crate::core::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    All,
    Columns(Vec<String>),
    Count,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
    Not(Box<Condition>),
    Compare {
        column: String,
        op: CompareOp,
        value: Value,
    },
    In {
        column: String,
        values: Vec<Value>,
        negated: bool,
    },
    Like {
        column: String,
        pattern: String,
        negated: bool,
        case_insensitive: bool,
    },
    IsNull {
        column: String,
        negated: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub column: String,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BoundStatement {
    Select {
        table: String,
        projection: Projection,
        filter: Option<Condition>,
        order: Vec<SortKey>,
        limit: Option<usize>,
        offset: usize,
    },
    Insert {
        table: String,
        columns: Option<Vec<String>>,
        rows: Vec<Vec<Value>>,
    },
    Update {
        table: String,
        assignments: Vec<(String, Value)>,
        filter: Option<Condition>,
    },
    Delete {
        table: String,
        filter: Option<Condition>,
    },
}

impl BoundStatement {
    pub fn table(&self) -> &str {
        match self {
            BoundStatement::Select { table, .. }
            | BoundStatement::Insert { table, .. }
            | BoundStatement::Update { table, .. }
            | BoundStatement::Delete { table, .. } => table,
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, BoundStatement::Select { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BoundStatement::Select { .. } => "select",
            BoundStatement::Insert { .. } => "insert",
            BoundStatement::Update { .. } => "update",
            BoundStatement::Delete { .. } => "delete",
        }
    }
}

/// A parameterized statement that passed the raw-SQL guard.
#[derive(Debug, Clone, PartialEq)]
pub struct RawQuery {
    pub sql: String,
    pub bindings: Vec<Value>,
    pub statement: BoundStatement,
}
