// ============================================================================
// Transaction Management Module
// ============================================================================
//
// Ambient transactions over pooled connections:
//
// - state:   lifecycle state machine (Pending -> Active -> Committed/RolledBack)
// - context: one unit of work, carried in a task-local slot
// - retry:   backoff policy for replaying conflicted transactions
// - manager: with_transaction / with_retry / with_batch_transaction
//
// ============================================================================

pub mod context;
pub mod manager;
pub mod retry;
pub mod state;

pub use context::TransactionContext;
pub use manager::{BatchOperation, TransactionManager, batch_op};
pub use retry::RetryOptions;
pub use state::{TransactionId, TransactionState};
