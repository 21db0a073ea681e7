use crate::connection::PoolConfig;
use crate::core::{DbError, Result};
use crate::query::DEFAULT_MAX_PAGE_SIZE;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Prefix shared by every environment variable read in [`DataLayerConfig::from_env`].
pub const ENV_PREFIX: &str = "FEEDBACK_DAL_";

/// Attribute names whose values never reach the logs.
pub const DEFAULT_SENSITIVE_FIELDS: &[&str] = &[
    "password",
    "password_hash",
    "token",
    "secret",
    "api_key",
    "access_token",
    "refresh_token",
];

/// Defaults for transactions opened by the manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Total attempts used by `with_retry` when the caller does not say.
    pub default_retries: u32,
    pub backoff_base_ms: u64,
    pub max_backoff_ms: u64,
    pub statement_timeout_ms: Option<u64>,
    /// Maximum lifetime of one top-level transaction.
    pub transaction_timeout_ms: Option<u64>,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            default_retries: 3,
            backoff_base_ms: 10,
            max_backoff_ms: 250,
            statement_timeout_ms: None,
            transaction_timeout_ms: None,
        }
    }
}

/// Configuration for a [`DataLayer`](crate::DataLayer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataLayerConfig {
    pub pool: PoolConfig,
    pub transaction: TransactionConfig,
    pub sensitive_fields: Vec<String>,
    pub max_page_size: usize,
}

impl Default for DataLayerConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            transaction: TransactionConfig::default(),
            sensitive_fields: DEFAULT_SENSITIVE_FIELDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
        }
    }
}

impl DataLayerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn transaction(mut self, transaction: TransactionConfig) -> Self {
        self.transaction = transaction;
        self
    }

    pub fn default_retries(mut self, retries: u32) -> Self {
        self.transaction.default_retries = retries;
        self
    }

    pub fn statement_timeout(mut self, timeout: Duration) -> Self {
        self.transaction.statement_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction.transaction_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn sensitive_field(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        if !self.sensitive_fields.contains(&field) {
            self.sensitive_fields.push(field);
        }
        self
    }

    pub fn max_page_size(mut self, max: usize) -> Self {
        self.max_page_size = max;
        self
    }

    /// Pool settings with the transaction-level statement timeout folded in.
    pub fn effective_pool(&self) -> PoolConfig {
        let mut pool = self.pool.clone();
        if let Some(ms) = self.transaction.statement_timeout_ms {
            pool.statement_timeout = Some(Duration::from_millis(ms));
        }
        pool
    }

    pub fn validate(&self) -> Result<()> {
        self.effective_pool().validate()?;

        if self.transaction.default_retries == 0 {
            return Err(DbError::Configuration(
                "default_retries must be >= 1".to_string(),
            ));
        }
        if self.transaction.max_backoff_ms < self.transaction.backoff_base_ms {
            return Err(DbError::Configuration(
                "max_backoff_ms cannot be below backoff_base_ms".to_string(),
            ));
        }
        if self.transaction.transaction_timeout_ms == Some(0) {
            return Err(DbError::Configuration(
                "transaction_timeout_ms must be > 0 when set".to_string(),
            ));
        }
        if self.max_page_size == 0 {
            return Err(DbError::Configuration(
                "max_page_size must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Reads `FEEDBACK_DAL_*` variables from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from `lookup`, which is asked for each
    /// `FEEDBACK_DAL_*` key. Missing keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let mut config = Self::default();

        if let Some(raw) = get("MAX_CONNECTIONS") {
            config.pool.max_connections = parse("MAX_CONNECTIONS", &raw)?;
        }
        if let Some(raw) = get("MIN_CONNECTIONS") {
            config.pool.min_connections = parse("MIN_CONNECTIONS", &raw)?;
        }
        if let Some(raw) = get("ACQUIRE_TIMEOUT_MS") {
            config.pool.acquire_timeout = Duration::from_millis(parse("ACQUIRE_TIMEOUT_MS", &raw)?);
        }
        if let Some(raw) = get("IDLE_TIMEOUT_MS") {
            config.pool.idle_timeout = Some(Duration::from_millis(parse("IDLE_TIMEOUT_MS", &raw)?));
        }
        if let Some(raw) = get("MAX_LIFETIME_MS") {
            config.pool.max_lifetime = Some(Duration::from_millis(parse("MAX_LIFETIME_MS", &raw)?));
        }
        if let Some(raw) = get("RETRIES") {
            config.transaction.default_retries = parse("RETRIES", &raw)?;
        }
        if let Some(raw) = get("BACKOFF_MS") {
            config.transaction.backoff_base_ms = parse("BACKOFF_MS", &raw)?;
        }
        if let Some(raw) = get("MAX_BACKOFF_MS") {
            config.transaction.max_backoff_ms = parse("MAX_BACKOFF_MS", &raw)?;
        }
        if let Some(raw) = get("STATEMENT_TIMEOUT_MS") {
            config.transaction.statement_timeout_ms = Some(parse("STATEMENT_TIMEOUT_MS", &raw)?);
        }
        if let Some(raw) = get("TRANSACTION_TIMEOUT_MS") {
            config.transaction.transaction_timeout_ms = Some(parse("TRANSACTION_TIMEOUT_MS", &raw)?);
        }
        if let Some(raw) = get("MAX_PAGE_SIZE") {
            config.max_page_size = parse("MAX_PAGE_SIZE", &raw)?;
        }
        if let Some(raw) = get("SENSITIVE_FIELDS") {
            for field in raw.split(',').map(str::trim).filter(|f| !f.is_empty()) {
                config = config.sensitive_field(field);
            }
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse<T: FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim().parse::<T>().map_err(|_| {
        DbError::Configuration(format!("invalid value for {ENV_PREFIX}{name}: '{raw}'"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = DataLayerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.transaction.default_retries, 3);
        assert_eq!(config.max_page_size, 100);
        assert!(config.sensitive_fields.iter().any(|f| f == "password"));
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = DataLayerConfig::from_lookup(lookup(&[
            ("FEEDBACK_DAL_MAX_CONNECTIONS", "4"),
            ("FEEDBACK_DAL_RETRIES", "5"),
            ("FEEDBACK_DAL_STATEMENT_TIMEOUT_MS", "750"),
            ("FEEDBACK_DAL_SENSITIVE_FIELDS", "ssn, phone"),
        ]))
        .unwrap();

        assert_eq!(config.pool.max_connections, 4);
        assert_eq!(config.transaction.default_retries, 5);
        assert_eq!(
            config.effective_pool().statement_timeout,
            Some(Duration::from_millis(750))
        );
        assert!(config.sensitive_fields.iter().any(|f| f == "ssn"));
        assert!(config.sensitive_fields.iter().any(|f| f == "phone"));
    }

    #[test]
    fn test_bad_values_are_configuration_errors() {
        let err = DataLayerConfig::from_lookup(lookup(&[("FEEDBACK_DAL_MAX_CONNECTIONS", "many")]))
            .unwrap_err();
        assert!(matches!(err, DbError::Configuration(_)));

        let err = DataLayerConfig::from_lookup(lookup(&[("FEEDBACK_DAL_RETRIES", "0")]))
            .unwrap_err();
        assert!(matches!(err, DbError::Configuration(_)));
    }
}
