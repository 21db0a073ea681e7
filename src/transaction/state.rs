// ============================================================================
// Transaction State Management
// ============================================================================
//
// Every transaction context moves through a fixed lifecycle:
//
//   Pending ──begin──> Active ──commit──> Committed
//                        │
//                        └──rollback──> RolledBack
//
// Terminal states are final. A pending context that fails to begin goes
// straight to RolledBack.
//
// ============================================================================

use crate::core::{DbError, Result};
use std::sync::atomic::{AtomicU64, Ordering};

/// Global transaction ID counter
static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Generate a new unique transaction ID
    pub fn new() -> Self {
        TransactionId(NEXT_TXN_ID.fetch_add(1, Ordering::SeqCst))
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Context created, driver transaction not opened yet
    Pending,

    /// Transaction is open and can execute statements
    Active,

    /// Transaction has been successfully committed
    Committed,

    /// Transaction has been rolled back
    RolledBack,
}

impl TransactionState {
    /// Check if transaction can execute operations
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionState::Active)
    }

    /// Check if transaction is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::RolledBack
        )
    }

    /// Validates a lifecycle step and returns the new state.
    ///
    /// # Errors
    /// Returns `DbError::TransactionState` for any transition not drawn above.
    pub fn transition(self, to: TransactionState) -> Result<TransactionState> {
        use TransactionState::*;

        match (self, to) {
            (Pending, Active) | (Pending, RolledBack) | (Active, Committed) | (Active, RolledBack) => {
                Ok(to)
            }
            (from, to) => Err(DbError::TransactionState(format!(
                "Illegal transaction transition {} -> {}",
                from, to
            ))),
        }
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::Pending => write!(f, "PENDING"),
            TransactionState::Active => write!(f, "ACTIVE"),
            TransactionState::Committed => write!(f, "COMMITTED"),
            TransactionState::RolledBack => write!(f, "ROLLED_BACK"),
        }
    }
}
