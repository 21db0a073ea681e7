use crate::core::{DbError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection pool configuration
///
/// Bounds the number of physical sessions the data layer may hold open and
/// how long callers wait for one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of connections in pool
    pub max_connections: usize,

    /// Minimum number of connections kept open
    pub min_connections: usize,

    /// How long `get_connection` waits before failing with an acquire timeout
    pub acquire_timeout: Duration,

    /// Connection idle timeout
    pub idle_timeout: Option<Duration>,

    /// Maximum connection lifetime
    pub max_lifetime: Option<Duration>,

    /// Per-statement time limit
    pub statement_timeout: Option<Duration>,
}

impl PoolConfig {
    pub fn new() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(600)),  // 10 minutes
            max_lifetime: Some(Duration::from_secs(1800)), // 30 minutes
            statement_timeout: None,
        }
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set minimum connections
    pub fn min_connections(mut self, min: usize) -> Self {
        self.min_connections = min;
        self
    }

    /// Set acquire timeout
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set idle timeout
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Set maximum lifetime
    pub fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = Some(lifetime);
        self
    }

    pub fn statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(DbError::Configuration(
                "max_connections must be > 0".to_string(),
            ));
        }

        if self.min_connections > self.max_connections {
            return Err(DbError::Configuration(
                "min_connections cannot exceed max_connections".to_string(),
            ));
        }

        if self.acquire_timeout.is_zero() {
            return Err(DbError::Configuration(
                "acquire_timeout must be > 0".to_string(),
            ));
        }

        if self.statement_timeout.is_some_and(|t| t.is_zero()) {
            return Err(DbError::Configuration(
                "statement_timeout must be > 0 when set".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new()
    }
}
