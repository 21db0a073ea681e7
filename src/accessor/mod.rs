// ============================================================================
// Accessors
// ============================================================================
//
// Uniform CRUD over one entity model. Every call resolves its transaction as
//
//   1. WriteOptions::transaction, when given
//   2. the ambient transaction of the calling task
//   3. autocommit on a pooled connection
//
// ============================================================================

pub mod base;
pub mod feedback;
pub mod sanitize;
pub mod user;

use crate::core::{Fields, Record};
use crate::query::Direction;
use crate::transaction::TransactionContext;
use serde::Serialize;

pub use base::BaseAccessor;
pub use feedback::{FeedbackAccessor, feedback_model};
pub use sanitize::{REDACTED, Redactor};
pub use user::{UserAccessor, user_model};

/// Equality filter: every entry must match.
pub type Filter = Fields;

#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub transaction: Option<TransactionContext>,
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_transaction(ctx: &TransactionContext) -> Self {
        Self {
            transaction: Some(ctx.clone()),
        }
    }
}

/// Page request for [`BaseAccessor::find_with_pagination`]. `page` is 1-indexed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub page: usize,
    pub size: usize,
    pub sort: Option<String>,
    pub order: Direction,
}

impl PageRequest {
    pub fn new(page: usize, size: usize) -> Self {
        Self {
            page,
            size,
            sort: None,
            order: Direction::Asc,
        }
    }

    pub fn sort_by(mut self, field: impl Into<String>, order: Direction) -> Self {
        self.sort = Some(field.into());
        self.order = order;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T = Record> {
    pub data: Vec<T>,
    pub total_count: u64,
    pub has_next_page: bool,
    pub page: usize,
    pub size: usize,
}
