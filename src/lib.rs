// ============================================================================
// feedback_dal Library
// ============================================================================

pub mod accessor;
pub mod config;
pub mod connection;
pub mod core;
pub mod parser;
pub mod query;
pub mod result;
pub mod storage;
pub mod transaction;

// Re-export main types for convenience
pub use crate::core::{
    AttributeSpec, DataType, DbError, DefaultValue, EntityModel, Fields, Record, Result,
    TimeoutKind, Value,
};
pub use result::QueryResult;

pub use accessor::{
    BaseAccessor, FeedbackAccessor, Filter, Page, PageRequest, Redactor, UserAccessor,
    WriteOptions, feedback_model, user_model,
};
pub use config::{DataLayerConfig, TransactionConfig};
pub use connection::{ConnectionPool, PoolConfig, PoolGuard, PoolStats};
pub use query::{Association, Direction, Predicate, QueryConditionBuilder, QueryDescriptor};
pub use storage::{MemoryEngine, StorageEngine, StorageSession};
pub use transaction::{
    BatchOperation, RetryOptions, TransactionContext, TransactionManager, TransactionState,
    batch_op,
};

use std::sync::Arc;
use tracing::info;

// ============================================================================
// DataLayer
// ============================================================================

/// Entry point: one connection pool, one transaction manager, and the
/// accessors built on them.
///
/// Construct it once at startup and pass it (or the accessors it vends)
/// down explicitly.
///
/// # Examples
///
/// ```
/// use feedback_dal::{DataLayer, DataLayerConfig, WriteOptions, fields};
///
/// # #[tokio::main]
/// # async fn main() -> feedback_dal::Result<()> {
/// let layer = DataLayer::in_memory(DataLayerConfig::default()).await?;
/// let users = layer.users().await?;
///
/// let user = users
///     .register(
///         fields! { "organization_id" => "org-1", "email" => "Ada@Example.com" },
///         &WriteOptions::default(),
///     )
///     .await?;
/// assert_eq!(user.get_str("email"), Some("ada@example.com"));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DataLayer {
    config: DataLayerConfig,
    engine: Arc<dyn StorageEngine>,
    transactions: Arc<TransactionManager>,
    redactor: Arc<Redactor>,
}

impl DataLayer {
    /// Opens a data layer over `engine`.
    ///
    /// # Errors
    /// `Configuration` when the config is invalid; connection errors when the
    /// pool cannot open its minimum connections.
    pub async fn open(config: DataLayerConfig, engine: Arc<dyn StorageEngine>) -> Result<Self> {
        config.validate()?;

        let pool = ConnectionPool::new(config.effective_pool(), Arc::clone(&engine)).await?;
        let transactions = Arc::new(TransactionManager::new(
            Arc::new(pool),
            config.transaction.clone(),
        ));
        let redactor = Arc::new(Redactor::new(&config.sensitive_fields)?);

        info!(
            max_connections = config.pool.max_connections,
            retries = config.transaction.default_retries,
            "Data layer ready"
        );

        Ok(Self {
            config,
            engine,
            transactions,
            redactor,
        })
    }

    /// Data layer backed by a fresh [`MemoryEngine`].
    pub async fn in_memory(config: DataLayerConfig) -> Result<Self> {
        Self::open(config, Arc::new(MemoryEngine::new())).await
    }

    pub fn config(&self) -> &DataLayerConfig {
        &self.config
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }

    pub fn engine(&self) -> &Arc<dyn StorageEngine> {
        &self.engine
    }

    /// Registers `model` with the storage engine and returns its accessor.
    pub async fn accessor(&self, model: EntityModel) -> Result<BaseAccessor> {
        let model = Arc::new(model);
        self.engine.register_model(Arc::clone(&model)).await?;
        Ok(BaseAccessor::new(
            model,
            Arc::clone(&self.transactions),
            Arc::clone(&self.redactor),
            self.config.max_page_size,
        ))
    }

    pub async fn users(&self) -> Result<UserAccessor> {
        Ok(UserAccessor::new(self.accessor(user_model()).await?))
    }

    /// Feedback accessor; registers the user model too, since feedback rows
    /// reference users.
    pub async fn feedback(&self) -> Result<FeedbackAccessor> {
        let users = self.users().await?;
        let base = self.accessor(feedback_model()).await?;
        Ok(FeedbackAccessor::new(base, Arc::clone(users.model())))
    }

    pub async fn pool_stats(&self) -> PoolStats {
        self.transactions.pool().stats().await
    }
}

impl std::fmt::Debug for DataLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataLayer")
            .field("config", &self.config)
            .finish()
    }
}
