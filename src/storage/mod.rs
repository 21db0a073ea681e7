// ============================================================================
// Storage driver seam
// ============================================================================
//
// The transaction manager and accessors only talk to these traits. A session
// is one physical connection: it owns at most one open transaction and the
// savepoints nested inside it. Statements executed outside a transaction run
// in autocommit mode.
//
// ============================================================================

pub mod eval;
pub mod memory;
pub mod table;

use crate::core::{EntityModel, Fields, Result, Value};
use crate::parser::BoundStatement;
use crate::query::{OrderBy, Predicate};
use async_trait::async_trait;
use std::sync::Arc;

pub use memory::{MemoryEngine, MemorySession};
pub use table::Table;

#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Makes a collection known to the engine. Registering the same model twice is a no-op.
    async fn register_model(&self, model: Arc<EntityModel>) -> Result<()>;

    async fn open_session(&self) -> Result<Box<dyn StorageSession>>;
}

#[async_trait]
pub trait StorageSession: Send {
    async fn begin(&mut self) -> Result<()>;
    async fn commit(&mut self) -> Result<()>;
    async fn rollback(&mut self) -> Result<()>;

    async fn savepoint(&mut self, name: &str) -> Result<()>;
    async fn release_savepoint(&mut self, name: &str) -> Result<()>;
    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()>;

    async fn execute(&mut self, statement: Statement) -> Result<StatementResult>;

    fn in_transaction(&self) -> bool;

    /// Cheap liveness probe used by the pool before handing out an idle session.
    async fn ping(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub table: String,
    pub predicates: Vec<Predicate>,
    pub order: Vec<OrderBy>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl SelectStatement {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            predicates: Vec::new(),
            order: Vec::new(),
            limit: None,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// Inserts one row and returns it with engine-assigned values filled in.
    Insert { table: String, values: Fields },
    Select(SelectStatement),
    Count {
        table: String,
        predicates: Vec<Predicate>,
    },
    /// Updates one row by primary key and returns it; no rows when the key is absent.
    Update {
        table: String,
        id: Value,
        values: Fields,
    },
    Delete { table: String, id: Value },
    Raw(BoundStatement),
}

impl Statement {
    pub fn table(&self) -> &str {
        match self {
            Statement::Insert { table, .. }
            | Statement::Count { table, .. }
            | Statement::Update { table, .. }
            | Statement::Delete { table, .. } => table,
            Statement::Select(select) => &select.table,
            Statement::Raw(bound) => bound.table(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Statement::Insert { .. } => "insert",
            Statement::Select(_) => "select",
            Statement::Count { .. } => "count",
            Statement::Update { .. } => "update",
            Statement::Delete { .. } => "delete",
            Statement::Raw(bound) => bound.kind(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatementResult {
    Rows(Vec<Fields>),
    Count(u64),
    Affected(u64),
}

impl StatementResult {
    pub fn into_rows(self) -> Vec<Fields> {
        match self {
            StatementResult::Rows(rows) => rows,
            _ => Vec::new(),
        }
    }

    pub fn count(&self) -> u64 {
        match self {
            StatementResult::Rows(rows) => rows.len() as u64,
            StatementResult::Count(n) | StatementResult::Affected(n) => *n,
        }
    }
}
