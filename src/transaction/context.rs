// ============================================================================
// Transaction Context
// ============================================================================
//
// One logical unit of work: the pooled connection holding the driver
// transaction, the savepoint stack used by nested scopes, and diagnostic
// metadata. Cloning is cheap; every clone refers to the same transaction.
//
// The context is made ambient for the duration of the work future through a
// tokio task-local slot. Accessor calls made inside that future pick it up
// without explicit parameters. Tasks spawned from inside do not inherit it.
// The slot keeps the innermost context per pool, so scopes of independent
// data layers can nest without one capturing the other's statements.
//
// Nested scopes on one context run one at a time per nesting level: each
// handle carries the gate of its level, and a nested scope holds its parent's
// gate until its savepoint is released or rolled back.
//
// ============================================================================

use super::state::{TransactionId, TransactionState};
use crate::connection::{ConnectionPool, PoolGuard};
use crate::core::{DbError, Result, TimeoutKind};
use crate::storage::{Statement, StatementResult};
use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{trace, warn};

tokio::task_local! {
    static AMBIENT_TRANSACTIONS: Vec<TransactionContext>;
}

#[derive(Clone)]
pub struct TransactionContext {
    inner: Arc<ContextInner>,
    gate: Arc<Mutex<()>>,
}

struct ContextInner {
    id: TransactionId,
    pool_id: u64,
    name: Option<String>,
    attempt: u32,
    created_at: DateTime<Utc>,
    started: Instant,
    deadline: Option<Instant>,
    state: StdMutex<TransactionState>,
    session: Mutex<SessionSlot>,
}

struct SessionSlot {
    guard: Option<PoolGuard>,
    savepoints: Vec<String>,
    next_savepoint: u32,
}

impl TransactionContext {
    pub(crate) fn new(
        name: Option<String>,
        attempt: u32,
        lifetime: Option<Duration>,
        guard: PoolGuard,
    ) -> Self {
        let started = Instant::now();
        Self {
            inner: Arc::new(ContextInner {
                id: TransactionId::new(),
                pool_id: guard.pool_id(),
                name,
                attempt,
                created_at: Utc::now(),
                started,
                deadline: lifetime.map(|limit| started + limit),
                state: StdMutex::new(TransactionState::Pending),
                session: Mutex::new(SessionSlot {
                    guard: Some(guard),
                    savepoints: Vec::new(),
                    next_savepoint: 0,
                }),
            }),
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// The innermost ambient context of the current task, if any.
    pub fn current() -> Option<TransactionContext> {
        AMBIENT_TRANSACTIONS
            .try_with(|stack| stack.last().cloned())
            .ok()
            .flatten()
    }

    /// The innermost ambient context opened on `pool`.
    pub fn current_on(pool: &ConnectionPool) -> Option<TransactionContext> {
        AMBIENT_TRANSACTIONS
            .try_with(|stack| stack.iter().rev().find(|ctx| ctx.belongs_to(pool)).cloned())
            .ok()
            .flatten()
    }

    /// Runs `fut` with this context installed as the ambient transaction
    /// for its pool.
    pub(crate) async fn scope<F: Future>(self, fut: F) -> F::Output {
        let mut stack = AMBIENT_TRANSACTIONS
            .try_with(|stack| stack.clone())
            .unwrap_or_default();
        stack.retain(|ctx| ctx.inner.pool_id != self.inner.pool_id);
        stack.push(self);
        AMBIENT_TRANSACTIONS.scope(stack, fut).await
    }

    pub fn id(&self) -> TransactionId {
        self.inner.id
    }

    /// Whether this transaction runs on a connection from `pool`.
    pub fn belongs_to(&self, pool: &ConnectionPool) -> bool {
        self.inner.pool_id == pool.id()
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// 1-based attempt number within `with_retry`; always 1 otherwise.
    pub fn attempt(&self) -> u32 {
        self.inner.attempt
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn elapsed(&self) -> Duration {
        self.inner.started.elapsed()
    }

    pub fn state(&self) -> TransactionState {
        *self.lock_state()
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// Number of savepoints currently open on this transaction.
    pub async fn savepoint_depth(&self) -> usize {
        self.inner.session.lock().await.savepoints.len()
    }

    /// Executes one statement inside this transaction.
    pub async fn execute(&self, statement: Statement) -> Result<StatementResult> {
        self.ensure_active()?;
        self.ensure_within_deadline()?;

        let mut slot = self.inner.session.lock().await;
        let guard = slot.guard.as_mut().ok_or_else(|| {
            DbError::TransactionState(format!("{} has no connection", self))
        })?;
        guard.execute(statement).await
    }

    // ========================================================================
    // Lifecycle (driven by TransactionManager)
    // ========================================================================

    pub(crate) async fn begin(&self) -> Result<()> {
        let mut slot = self.inner.session.lock().await;
        let result = match slot.guard.as_mut() {
            Some(guard) => guard.begin().await,
            None => Err(DbError::TransactionState(format!(
                "{} has no connection",
                self
            ))),
        };

        match result {
            Ok(()) => {
                self.set_state(TransactionState::Active)?;
                trace!(transaction = %self, "BEGIN");
                Ok(())
            }
            Err(err) => {
                self.set_state(TransactionState::RolledBack)?;
                if let Some(guard) = slot.guard.take()
                    && let Err(close_err) = guard.close().await
                {
                    warn!(transaction = %self, error = %close_err, "Failed to release connection");
                }
                Err(err)
            }
        }
    }

    pub(crate) async fn commit(&self) -> Result<()> {
        self.ensure_active()?;
        let mut slot = self.inner.session.lock().await;
        let Some(mut guard) = slot.guard.take() else {
            return Err(DbError::TransactionState(format!(
                "{} has no connection",
                self
            )));
        };
        slot.savepoints.clear();

        let result = guard.commit().await;
        let next = if result.is_ok() {
            TransactionState::Committed
        } else {
            TransactionState::RolledBack
        };
        self.set_state(next)?;

        if let Err(close_err) = guard.close().await {
            warn!(transaction = %self, error = %close_err, "Failed to release connection");
        }
        result
    }

    pub(crate) async fn rollback(&self) -> Result<()> {
        if self.state().is_terminal() {
            return Ok(());
        }
        let mut slot = self.inner.session.lock().await;
        slot.savepoints.clear();
        self.set_state(TransactionState::RolledBack)?;

        let Some(mut guard) = slot.guard.take() else {
            return Ok(());
        };
        let result = if guard.is_in_transaction() {
            guard.rollback().await
        } else {
            Ok(())
        };
        if let Err(close_err) = guard.close().await {
            warn!(transaction = %self, error = %close_err, "Failed to release connection");
        }
        result
    }

    /// Waits until earlier sibling scopes on this level have finished.
    ///
    /// Returns the turn, to be held for the whole nested scope, and the
    /// handle the nested work runs with.
    pub(crate) async fn enter_nested(&self) -> (OwnedMutexGuard<()>, TransactionContext) {
        let turn = Arc::clone(&self.gate).lock_owned().await;
        let child = TransactionContext {
            inner: Arc::clone(&self.inner),
            gate: Arc::new(Mutex::new(())),
        };
        (turn, child)
    }

    /// Opens a savepoint named `sp_<n>` and returns its name.
    pub(crate) async fn push_savepoint(&self) -> Result<String> {
        self.ensure_active()?;
        let mut slot = self.inner.session.lock().await;
        slot.next_savepoint += 1;
        let name = format!("sp_{}", slot.next_savepoint);

        let guard = slot.guard.as_mut().ok_or_else(|| {
            DbError::TransactionState(format!("{} has no connection", self))
        })?;
        guard.connection()?.savepoint(&name).await?;
        slot.savepoints.push(name.clone());
        trace!(transaction = %self, savepoint = %name, "SAVEPOINT");
        Ok(name)
    }

    pub(crate) async fn release_savepoint(&self, name: &str) -> Result<()> {
        self.ensure_active()?;
        let mut slot = self.inner.session.lock().await;
        let guard = slot.guard.as_mut().ok_or_else(|| {
            DbError::TransactionState(format!("{} has no connection", self))
        })?;
        guard.connection()?.release_savepoint(name).await?;
        pop_through(&mut slot.savepoints, name);
        trace!(transaction = %self, savepoint = name, "RELEASE SAVEPOINT");
        Ok(())
    }

    /// Undoes everything since the savepoint and closes it.
    pub(crate) async fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        self.ensure_active()?;
        let mut slot = self.inner.session.lock().await;
        let guard = slot.guard.as_mut().ok_or_else(|| {
            DbError::TransactionState(format!("{} has no connection", self))
        })?;
        let connection = guard.connection()?;
        connection.rollback_to_savepoint(name).await?;
        connection.release_savepoint(name).await?;
        pop_through(&mut slot.savepoints, name);
        trace!(transaction = %self, savepoint = name, "ROLLBACK TO SAVEPOINT");
        Ok(())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn lock_state(&self) -> std::sync::MutexGuard<'_, TransactionState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, next: TransactionState) -> Result<()> {
        let mut state = self.lock_state();
        *state = state.transition(next)?;
        Ok(())
    }

    fn ensure_active(&self) -> Result<()> {
        let state = self.state();
        if !state.is_active() {
            return Err(DbError::TransactionState(format!(
                "{} is {}",
                self, state
            )));
        }
        Ok(())
    }

    fn ensure_within_deadline(&self) -> Result<()> {
        if let Some(deadline) = self.inner.deadline
            && Instant::now() >= deadline
        {
            return Err(DbError::Timeout {
                kind: TimeoutKind::Transaction,
                elapsed: self.elapsed(),
            });
        }
        Ok(())
    }
}

fn pop_through(savepoints: &mut Vec<String>, name: &str) {
    if let Some(pos) = savepoints.iter().rposition(|sp| sp == name) {
        savepoints.truncate(pos);
    }
}

impl fmt::Display for TransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner.name {
            Some(name) => write!(f, "{}({})", self.inner.id, name),
            None => write!(f, "{}", self.inner.id),
        }
    }
}

impl fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionContext")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("attempt", &self.inner.attempt)
            .field("state", &self.state())
            .finish()
    }
}
