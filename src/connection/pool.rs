use super::{Connection, config::PoolConfig};
use crate::core::{DbError, Result, TimeoutKind};
use crate::storage::{Statement, StatementResult, StorageEngine};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Connection pool
///
/// Hands out at most `max_connections` storage sessions. Callers that find
/// the pool exhausted wait up to `acquire_timeout` and then fail with
/// `DbError::Timeout { kind: Acquire }`.
pub struct ConnectionPool {
    /// Process-unique pool ID, carried by every guard it hands out
    id: u64,
    /// Pool configuration
    config: PoolConfig,
    engine: Arc<dyn StorageEngine>,
    /// Available connections
    available: Arc<Mutex<VecDeque<PooledConnection>>>,
    /// Total number of connections created
    total_connections: Arc<AtomicUsize>,
    /// Next connection ID
    next_id: AtomicU64,
}

/// A connection from the pool
struct PooledConnection {
    connection: Connection,
    created_at: Instant,
    last_used: Instant,
}

impl PooledConnection {
    fn new(connection: Connection) -> Self {
        let now = Instant::now();
        Self {
            connection,
            created_at: now,
            last_used: now,
        }
    }

    fn returned(connection: Connection, created_at: Instant) -> Self {
        Self {
            connection,
            created_at,
            last_used: Instant::now(),
        }
    }

    fn is_expired(&self, max_lifetime: Option<Duration>) -> bool {
        if let Some(lifetime) = max_lifetime {
            self.created_at.elapsed() > lifetime
        } else {
            false
        }
    }

    fn is_idle_too_long(&self, idle_timeout: Option<Duration>) -> bool {
        if let Some(timeout) = idle_timeout {
            self.last_used.elapsed() > timeout
        } else {
            false
        }
    }
}

impl ConnectionPool {
    pub async fn new(config: PoolConfig, engine: Arc<dyn StorageEngine>) -> Result<Self> {
        config.validate()?;

        let pool = Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            config,
            engine,
            available: Arc::new(Mutex::new(VecDeque::new())),
            total_connections: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicU64::new(1),
        };

        // Pre-create minimum connections
        pool.ensure_min_connections().await?;

        Ok(pool)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get a connection from the pool
    pub async fn get_connection(&self) -> Result<PoolGuard> {
        let start = Instant::now();

        loop {
            // Try to get an available connection
            if let Some(pooled) = self.try_get_available().await {
                return Ok(self.guard(pooled.connection, pooled.created_at));
            }

            // Try to create a new connection if under limit
            if let Some(conn) = self.try_create_connection().await? {
                return Ok(self.guard(conn, Instant::now()));
            }

            // Check timeout
            let elapsed = start.elapsed();
            if elapsed >= self.config.acquire_timeout {
                let stats = self.stats().await;
                warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    active = stats.active_connections,
                    max = stats.max_connections,
                    "Connection pool exhausted"
                );
                return Err(DbError::Timeout {
                    kind: TimeoutKind::Acquire,
                    elapsed,
                });
            }

            // Wait a bit before retrying
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn guard(&self, connection: Connection, created_at: Instant) -> PoolGuard {
        PoolGuard {
            pool_id: self.id,
            connection: Some(connection),
            created_at,
            pool: self.available.clone(),
            total_connections: self.total_connections.clone(),
        }
    }

    /// Try to get an available connection from the pool
    ///
    /// Expired, idle-too-long and unresponsive connections are discarded.
    async fn try_get_available(&self) -> Option<PooledConnection> {
        let mut available = self.available.lock().await;

        while let Some(mut pooled) = available.pop_front() {
            if pooled.is_expired(self.config.max_lifetime)
                || pooled.is_idle_too_long(self.config.idle_timeout)
            {
                self.total_connections.fetch_sub(1, Ordering::SeqCst);
                debug!(connection = pooled.connection.id(), "Discarding stale connection");
                continue;
            }
            if let Err(err) = pooled.connection.ping().await {
                self.total_connections.fetch_sub(1, Ordering::SeqCst);
                warn!(connection = pooled.connection.id(), error = %err, "Discarding dead connection");
                continue;
            }
            return Some(pooled);
        }

        None
    }

    /// Try to create a new connection if under limit
    async fn try_create_connection(&self) -> Result<Option<Connection>> {
        let max = self.config.max_connections;
        let reserved = self
            .total_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |total| {
                (total < max).then_some(total + 1)
            })
            .is_ok();
        if !reserved {
            return Ok(None);
        }

        match self.open_connection().await {
            Ok(connection) => Ok(Some(connection)),
            Err(err) => {
                self.total_connections.fetch_sub(1, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    async fn open_connection(&self) -> Result<Connection> {
        let session = self.engine.open_session().await?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        debug!(connection = id, "Opened connection");
        Ok(Connection::new(id, session, self.config.statement_timeout))
    }

    /// Ensure minimum number of connections
    async fn ensure_min_connections(&self) -> Result<()> {
        let mut available = self.available.lock().await;

        while self.total_connections.load(Ordering::SeqCst) < self.config.min_connections {
            let connection = self.open_connection().await?;
            available.push_back(PooledConnection::new(connection));
            self.total_connections.fetch_add(1, Ordering::SeqCst);
        }

        Ok(())
    }

    /// Get pool statistics
    pub async fn stats(&self) -> PoolStats {
        let available = self.available.lock().await;
        let total = self.total_connections.load(Ordering::SeqCst);

        PoolStats {
            total_connections: total,
            available_connections: available.len(),
            active_connections: total.saturating_sub(available.len()),
            max_connections: self.config.max_connections,
        }
    }
}

/// Connection pool statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total_connections: usize,
    pub available_connections: usize,
    pub active_connections: usize,
    pub max_connections: usize,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool Stats: {}/{} active, {} available, max {}",
            self.active_connections,
            self.total_connections,
            self.available_connections,
            self.max_connections
        )
    }
}

/// RAII guard for pooled connections
///
/// Returns the connection to the pool when dropped. A guard dropped while its
/// connection is still inside a transaction discards the connection instead,
/// since the rollback cannot run in `Drop`; call [`PoolGuard::close`] to roll
/// back and return it cleanly.
pub struct PoolGuard {
    pool_id: u64,
    connection: Option<Connection>,
    created_at: Instant,
    pool: Arc<Mutex<VecDeque<PooledConnection>>>,
    total_connections: Arc<AtomicUsize>,
}

impl std::fmt::Debug for PoolGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGuard")
            .field("pool_id", &self.pool_id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl PoolGuard {
    /// ID of the pool this connection was checked out from
    pub fn pool_id(&self) -> u64 {
        self.pool_id
    }

    /// Get a reference to the connection
    pub fn connection(&mut self) -> Result<&mut Connection> {
        self.connection
            .as_mut()
            .ok_or_else(|| DbError::TransactionState("Connection already returned to pool".into()))
    }

    /// Execute a statement (convenience method)
    pub async fn execute(&mut self, statement: Statement) -> Result<StatementResult> {
        self.connection()?.execute(statement).await
    }

    /// Begin a transaction (convenience method)
    pub async fn begin(&mut self) -> Result<()> {
        self.connection()?.begin().await
    }

    /// Commit a transaction (convenience method)
    pub async fn commit(&mut self) -> Result<()> {
        self.connection()?.commit().await
    }

    /// Rollback a transaction (convenience method)
    pub async fn rollback(&mut self) -> Result<()> {
        self.connection()?.rollback().await
    }

    pub fn is_in_transaction(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(Connection::is_in_transaction)
    }

    /// Explicitly close the guard and return the connection to the pool.
    ///
    /// Rolls back an open transaction first. If that rollback fails the
    /// connection is discarded and the error returned.
    pub async fn close(mut self) -> Result<()> {
        if let Some(mut connection) = self.connection.take() {
            if connection.is_in_transaction()
                && let Err(err) = connection.rollback().await
            {
                self.total_connections.fetch_sub(1, Ordering::SeqCst);
                return Err(err);
            }

            // Return to pool
            let mut pool = self.pool.lock().await;
            pool.push_back(PooledConnection::returned(connection, self.created_at));
        }
        Ok(())
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            if connection.is_in_transaction() {
                warn!(
                    connection = connection.id(),
                    "PoolGuard dropped with an open transaction, discarding connection"
                );
                self.total_connections.fetch_sub(1, Ordering::SeqCst);
                return;
            }

            // Try to return to pool if we can acquire the lock immediately
            if let Ok(mut pool) = self.pool.try_lock() {
                pool.push_back(PooledConnection::returned(connection, self.created_at));
            } else {
                debug!(
                    connection = connection.id(),
                    "Pool lock busy on drop, discarding connection"
                );
                self.total_connections.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}
