pub mod config;
pub mod pool;

use crate::core::{DbError, Result, TimeoutKind};
use crate::storage::{Statement, StatementResult, StorageSession};
use std::time::Duration;
use tracing::warn;

pub use config::PoolConfig;
pub use pool::{ConnectionPool, PoolGuard, PoolStats};

/// Database connection handle
///
/// Wraps one storage session and tracks whether a transaction is open on it.
/// Connections are handed out by [`ConnectionPool`] inside a [`PoolGuard`].
pub struct Connection {
    /// Unique connection ID
    id: u64,
    session: Box<dyn StorageSession>,
    /// Connection state
    state: ConnectionState,
    statement_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Idle,
    InTransaction,
    Closed,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        session: Box<dyn StorageSession>,
        statement_timeout: Option<Duration>,
    ) -> Self {
        Self {
            id,
            session,
            state: ConnectionState::Idle,
            statement_timeout,
        }
    }

    /// Get connection ID
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Execute one statement, in the open transaction if any, otherwise in autocommit.
    pub async fn execute(&mut self, statement: Statement) -> Result<StatementResult> {
        self.ensure_open()?;

        let Some(limit) = self.statement_timeout else {
            return self.session.execute(statement).await;
        };

        match tokio::time::timeout(limit, self.session.execute(statement)).await {
            Ok(result) => result,
            Err(_) => {
                // An abandoned autocommit statement may leave its implicit transaction open.
                if self.state == ConnectionState::Idle && self.session.in_transaction() {
                    if let Err(err) = self.session.rollback().await {
                        warn!(connection = self.id, error = %err, "Rollback after statement timeout failed");
                    }
                }
                Err(DbError::Timeout {
                    kind: TimeoutKind::Statement,
                    elapsed: limit,
                })
            }
        }
    }

    /// Begin a new transaction
    pub async fn begin(&mut self) -> Result<()> {
        self.ensure_open()?;

        if self.state == ConnectionState::InTransaction {
            return Err(DbError::TransactionState(
                "Transaction already active".into(),
            ));
        }

        self.session.begin().await?;
        self.state = ConnectionState::InTransaction;
        Ok(())
    }

    /// Commit the current transaction
    ///
    /// The transaction is over afterwards whether or not the commit succeeded.
    pub async fn commit(&mut self) -> Result<()> {
        self.ensure_in_transaction()?;
        let result = self.session.commit().await;
        self.sync_state();
        result
    }

    /// Rollback the current transaction
    pub async fn rollback(&mut self) -> Result<()> {
        self.ensure_in_transaction()?;
        let result = self.session.rollback().await;
        self.sync_state();
        result
    }

    pub async fn savepoint(&mut self, name: &str) -> Result<()> {
        self.ensure_in_transaction()?;
        self.session.savepoint(name).await
    }

    pub async fn release_savepoint(&mut self, name: &str) -> Result<()> {
        self.ensure_in_transaction()?;
        self.session.release_savepoint(name).await
    }

    pub async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        self.ensure_in_transaction()?;
        self.session.rollback_to_savepoint(name).await
    }

    pub async fn ping(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.session.ping().await
    }

    /// Check if connection is in a transaction
    pub fn is_in_transaction(&self) -> bool {
        self.state == ConnectionState::InTransaction
    }

    /// Check if connection is active
    pub fn is_active(&self) -> bool {
        self.state != ConnectionState::Closed
    }

    /// Close the connection, rolling back any open transaction
    pub async fn close(&mut self) -> Result<()> {
        if self.state == ConnectionState::InTransaction {
            self.rollback().await?;
        }

        self.state = ConnectionState::Closed;
        Ok(())
    }

    fn sync_state(&mut self) {
        self.state = if self.session.in_transaction() {
            ConnectionState::InTransaction
        } else {
            ConnectionState::Idle
        };
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Err(DbError::connection("08003", "Connection is closed"));
        }
        Ok(())
    }

    fn ensure_in_transaction(&self) -> Result<()> {
        self.ensure_open()?;
        if self.state != ConnectionState::InTransaction {
            return Err(DbError::TransactionState("No active transaction".into()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AttributeSpec, DataType, EntityModel};
    use crate::fields;
    use crate::storage::{MemoryEngine, StorageEngine};
    use std::sync::Arc;

    async fn create_test_connection() -> Connection {
        let engine = MemoryEngine::new();
        engine
            .register_model(Arc::new(
                EntityModel::new("notes", "id")
                    .attribute(AttributeSpec::new("id", DataType::Integer).auto_increment())
                    .attribute(AttributeSpec::new("body", DataType::Text)),
            ))
            .await
            .unwrap();
        Connection::new(1, engine.open_session().await.unwrap(), None)
    }

    #[tokio::test]
    async fn test_connection_creation() {
        let conn = create_test_connection().await;
        assert_eq!(conn.id(), 1);
        assert!(conn.is_active());
        assert!(!conn.is_in_transaction());
    }

    #[tokio::test]
    async fn test_transaction_lifecycle() {
        let mut conn = create_test_connection().await;

        assert!(conn.begin().await.is_ok());
        assert!(conn.is_in_transaction());
        assert!(conn.begin().await.is_err());

        assert!(conn.commit().await.is_ok());
        assert!(!conn.is_in_transaction());
        assert!(matches!(
            conn.commit().await,
            Err(DbError::TransactionState(_))
        ));
    }

    #[tokio::test]
    async fn test_savepoint_requires_transaction() {
        let mut conn = create_test_connection().await;
        assert!(conn.savepoint("sp_1").await.is_err());

        conn.begin().await.unwrap();
        conn.savepoint("sp_1").await.unwrap();
        conn.rollback_to_savepoint("sp_1").await.unwrap();
        conn.rollback().await.unwrap();
        assert!(!conn.is_in_transaction());
    }

    #[tokio::test]
    async fn test_connection_close() {
        let mut conn = create_test_connection().await;
        conn.begin().await.unwrap();

        assert!(conn.close().await.is_ok());
        assert!(!conn.is_active());

        // Should fail after close
        let err = conn
            .execute(Statement::Insert {
                table: "notes".into(),
                values: fields! { "body" => "x" },
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Connection { .. }));
    }
}
