pub mod adapter;
pub mod ast;

pub use adapter::RawSqlGuard;
pub use ast::{BoundStatement, CompareOp, Condition, Projection, RawQuery, SortKey};
