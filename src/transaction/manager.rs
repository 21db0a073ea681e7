// ============================================================================
// Transaction Manager
// ============================================================================
//
// Owns the transaction lifecycle around caller-supplied work:
//
//   with_transaction        one top-level driver transaction, or a savepoint
//                           when an ambient context already exists
//   with_retry              replays the whole top-level transaction on
//                           conflict / transient connection errors
//   with_batch_transaction  ordered operations, all or nothing
//
// The work future is the only place the context is ambient. An error from
// the work is the sole rollback signal. A manager only joins ambient
// contexts opened on its own pool; inside another layer's transaction it
// starts its own.
//
// ============================================================================

use super::context::TransactionContext;
use super::retry::RetryOptions;
use crate::config::TransactionConfig;
use crate::connection::ConnectionPool;
use crate::core::{DbError, Result, TimeoutKind};
use crate::storage::{Statement, StatementResult};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One step of [`TransactionManager::with_batch_transaction`].
pub type BatchOperation<T> =
    Box<dyn FnOnce(TransactionContext) -> BoxFuture<'static, Result<T>> + Send>;

/// Boxes an async closure into a [`BatchOperation`].
pub fn batch_op<T, F, Fut>(operation: F) -> BatchOperation<T>
where
    F: FnOnce(TransactionContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    Box::new(move |ctx| Box::pin(operation(ctx)))
}

pub struct TransactionManager {
    pool: Arc<ConnectionPool>,
    config: TransactionConfig,
}

impl TransactionManager {
    pub fn new(pool: Arc<ConnectionPool>, config: TransactionConfig) -> Self {
        Self { pool, config }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// The ambient transaction of the calling task, if any.
    pub fn current() -> Option<TransactionContext> {
        TransactionContext::current()
    }

    /// The ambient transaction, if it was opened on this manager's pool.
    pub fn ambient(&self) -> Option<TransactionContext> {
        TransactionContext::current_on(&self.pool)
    }

    /// Retry options seeded from the configured defaults.
    pub fn retry_options(&self) -> RetryOptions {
        RetryOptions::new()
            .retries(self.config.default_retries)
            .backoff_ms(self.config.backoff_base_ms)
            .max_backoff_ms(self.config.max_backoff_ms)
    }

    pub async fn with_transaction<F, Fut, T>(&self, work: F) -> Result<T>
    where
        F: FnOnce(TransactionContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_scope(None, 1, work).await
    }

    pub async fn with_named_transaction<F, Fut, T>(&self, name: &str, work: F) -> Result<T>
    where
        F: FnOnce(TransactionContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_scope(Some(name.to_string()), 1, work).await
    }

    /// Runs `work` in a fresh top-level transaction, replaying it on
    /// retryable failures.
    ///
    /// Inside an existing transaction the work runs once as a savepoint
    /// scope; a conflict there aborts the whole outer transaction, so only
    /// the outermost `with_retry` replays.
    ///
    /// # Errors
    /// Non-retryable errors are returned as-is from the first attempt.
    /// Running out of attempts, or of the caller's deadline, yields
    /// `DbError::RetryExhausted` wrapping the last cause.
    pub async fn with_retry<F, Fut, T>(&self, mut work: F, options: RetryOptions) -> Result<T>
    where
        F: FnMut(TransactionContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(ctx) = self.ambient() {
            debug!(transaction = %ctx, "Nested with_retry joins the outer transaction");
            return run_nested(ctx, work).await;
        }

        let started = Instant::now();
        let max_attempts = options.max_attempts();
        let mut acquire_retries = 0u32;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let err = match self
                .run_top_level(options.name.clone(), attempt, &mut work)
                .await
            {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, name = ?options.name, "Transaction succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if err.is_acquire_timeout() {
                if !options.retry_acquire_timeout {
                    return Err(err);
                }
                if acquire_retries >= options.max_acquire_retries {
                    warn!(attempt, error = %err, "Acquire timeout retries exhausted");
                    return Err(exhausted(attempt, err));
                }
                acquire_retries += 1;
            } else if !err.is_retryable() {
                return Err(err);
            }

            if attempt >= max_attempts {
                warn!(attempt, error = %err, name = ?options.name, "Retries exhausted");
                return Err(exhausted(attempt, err));
            }

            let delay = options.delay(attempt);
            if let Some(deadline) = options.deadline
                && started.elapsed() + delay >= deadline
            {
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    deadline_ms = deadline.as_millis() as u64,
                    "Next backoff would pass the deadline"
                );
                return Err(exhausted(attempt, err));
            }

            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                code = err.code().unwrap_or("-"),
                error = %err,
                "Retrying transaction"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Runs the operations in order inside one transaction.
    ///
    /// The first failure stops the batch and rolls back every earlier
    /// operation.
    pub async fn with_batch_transaction<T>(
        &self,
        operations: Vec<BatchOperation<T>>,
    ) -> Result<Vec<T>> {
        let total = operations.len();
        self.with_named_transaction("batch", |ctx| async move {
            let mut results = Vec::with_capacity(total);
            for (index, operation) in operations.into_iter().enumerate() {
                match operation(ctx.clone()).await {
                    Ok(value) => results.push(value),
                    Err(err) => {
                        warn!(transaction = %ctx, batch_index = index, total, error = %err, "Batch operation failed");
                        return Err(err);
                    }
                }
            }
            Ok(results)
        })
        .await
    }

    /// Executes one statement in `explicit`, else in the ambient
    /// transaction, else in autocommit on a pooled connection.
    ///
    /// # Errors
    /// `Validation` when `explicit` was opened on a different pool.
    pub async fn execute(
        &self,
        statement: Statement,
        explicit: Option<&TransactionContext>,
    ) -> Result<StatementResult> {
        if let Some(ctx) = explicit {
            if !ctx.belongs_to(&self.pool) {
                return Err(DbError::Validation(format!(
                    "Transaction {} belongs to a different connection pool",
                    ctx
                )));
            }
            return ctx.execute(statement).await;
        }
        if let Some(ctx) = self.ambient() {
            return ctx.execute(statement).await;
        }

        let mut guard = self.pool.get_connection().await?;
        let result = guard.execute(statement).await;
        if let Err(err) = guard.close().await {
            warn!(error = %err, "Failed to return autocommit connection");
        }
        result
    }

    // ========================================================================
    // Scopes
    // ========================================================================

    async fn run_scope<F, Fut, T>(&self, name: Option<String>, attempt: u32, work: F) -> Result<T>
    where
        F: FnOnce(TransactionContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.ambient() {
            Some(ctx) => run_nested(ctx, work).await,
            None => self.run_top_level(name, attempt, work).await,
        }
    }

    async fn run_top_level<F, Fut, T>(
        &self,
        name: Option<String>,
        attempt: u32,
        work: F,
    ) -> Result<T>
    where
        F: FnOnce(TransactionContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lifetime = self.config.transaction_timeout_ms.map(Duration::from_millis);
        let guard = self.pool.get_connection().await?;
        let ctx = TransactionContext::new(name, attempt, lifetime, guard);
        ctx.begin().await?;

        let scoped = ctx.clone().scope(work(ctx.clone()));
        let outcome = match lifetime {
            Some(limit) => match tokio::time::timeout(limit, scoped).await {
                Ok(result) => result,
                Err(_) => Err(DbError::Timeout {
                    kind: TimeoutKind::Transaction,
                    elapsed: ctx.elapsed(),
                }),
            },
            None => scoped.await,
        };

        match outcome {
            Ok(value) => {
                ctx.commit().await?;
                debug!(
                    transaction = %ctx,
                    attempt,
                    elapsed_ms = ctx.elapsed().as_millis() as u64,
                    "COMMIT"
                );
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = ctx.rollback().await {
                    warn!(transaction = %ctx, error = %rollback_err, "Rollback failed");
                }
                debug!(transaction = %ctx, attempt, error = %err, "ROLLBACK");
                Err(err)
            }
        }
    }
}

async fn run_nested<F, Fut, T>(ctx: TransactionContext, work: F) -> Result<T>
where
    F: FnOnce(TransactionContext) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    // Siblings queue here in issue order
    let (_turn, ctx) = ctx.enter_nested().await;
    let savepoint = ctx.push_savepoint().await?;
    match ctx.clone().scope(work(ctx.clone())).await {
        Ok(value) => {
            ctx.release_savepoint(&savepoint).await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = ctx.rollback_to_savepoint(&savepoint).await {
                warn!(transaction = %ctx, savepoint = %savepoint, error = %rollback_err, "Savepoint rollback failed");
            }
            Err(err)
        }
    }
}

fn exhausted(attempts: u32, source: DbError) -> DbError {
    DbError::RetryExhausted {
        attempts: attempts as usize,
        source: Box::new(source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::PoolConfig;
    use crate::core::SERIALIZATION_FAILURE;
    use crate::storage::{MemoryEngine, StorageEngine};
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn manager() -> TransactionManager {
        let engine: Arc<dyn StorageEngine> = Arc::new(MemoryEngine::new());
        let pool = ConnectionPool::new(PoolConfig::new().max_connections(2), engine)
            .await
            .unwrap();
        TransactionManager::new(Arc::new(pool), TransactionConfig::default())
    }

    #[tokio::test]
    async fn test_ambient_context_visible_inside_work() {
        let manager = manager().await;
        assert!(TransactionManager::current().is_none());

        let id = manager
            .with_named_transaction("outer", |ctx| async move {
                let ambient = TransactionManager::current().unwrap();
                assert_eq!(ambient.id(), ctx.id());
                assert_eq!(ambient.name(), Some("outer"));
                Ok(ctx.id())
            })
            .await
            .unwrap();

        assert!(id.as_u64() > 0);
        assert!(TransactionManager::current().is_none());
    }

    #[tokio::test]
    async fn test_nested_scope_uses_savepoint() {
        let manager = manager().await;

        manager
            .with_transaction(|outer| {
                let manager = &manager;
                async move {
                    let outer_ref = outer.clone();
                    manager
                        .with_transaction(|inner| async move {
                            assert_eq!(inner.id(), outer_ref.id());
                            assert_eq!(inner.savepoint_depth().await, 1);
                            Ok(())
                        })
                        .await?;
                    assert_eq!(outer.savepoint_depth().await, 0);
                    Ok(())
                }
            })
            .await
            .unwrap();

        let stats = manager.pool().stats().await;
        assert_eq!(stats.active_connections, 0);
    }

    #[tokio::test]
    async fn test_retry_counts_attempts() {
        let manager = manager().await;
        let calls = AtomicU32::new(0);

        let err = manager
            .with_retry(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(DbError::conflict(SERIALIZATION_FAILURE, "busy")) }
                },
                RetryOptions::new().retries(3).backoff_ms(1),
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(err, DbError::RetryExhausted { attempts: 3, .. }));
    }
}
