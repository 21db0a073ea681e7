use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// SQLSTATE codes reported for serialization failures and deadlocks.
///
/// Errors carrying one of these codes are expected to succeed when the whole
/// transaction is replayed.
pub const SERIALIZATION_CODES: &[&str] = &[
    "40001", // serialization_failure
    "40P01", // deadlock_detected
];

/// SQLSTATE codes reported for transient connection loss.
pub const CONNECTION_CODES: &[&str] = &[
    "08000", // connection_exception
    "08001", // sqlclient_unable_to_establish_sqlconnection
    "08003", // connection_does_not_exist
    "08004", // sqlserver_rejected_establishment_of_sqlconnection
    "08006", // connection_failure
    "57P01", // admin_shutdown
    "57P02", // crash_shutdown
    "57P03", // cannot_connect_now
    "53300", // too_many_connections
];

pub const UNIQUE_VIOLATION: &str = "23505";
pub const FOREIGN_KEY_VIOLATION: &str = "23503";
pub const NOT_NULL_VIOLATION: &str = "23502";
pub const CHECK_VIOLATION: &str = "23514";
pub const SERIALIZATION_FAILURE: &str = "40001";
pub const DEADLOCK_DETECTED: &str = "40P01";
pub const CONNECTION_FAILURE: &str = "08006";

/// Which deadline fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// No pooled connection became available in time.
    Acquire,
    /// A single statement ran past the statement timeout.
    Statement,
    /// A transaction outlived its maximum lifetime.
    Transaction,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Acquire => "acquire",
            Self::Statement => "statement",
            Self::Transaction => "transaction",
        };
        write!(f, "{label}")
    }
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Constraint violation [{code}]: {message}")]
    Constraint { code: String, message: String },

    #[error("{entity} with id {id} not found")]
    NotFound { entity: String, id: String },

    #[error("Conflict [{code}]: {message}")]
    Conflict { code: String, message: String },

    #[error("Connection error [{code}]: {message}")]
    Connection { code: String, message: String },

    #[error("{kind} timeout after {}ms", .elapsed.as_millis())]
    Timeout { kind: TimeoutKind, elapsed: Duration },

    #[error("Retries exhausted after {attempts} attempt(s): {source}")]
    RetryExhausted {
        attempts: usize,
        #[source]
        source: Box<DbError>,
    },

    #[error("Transaction state error: {0}")]
    TransactionState(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error(transparent)]
    Application(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, DbError>;

impl DbError {
    pub fn constraint(code: &str, message: impl Into<String>) -> Self {
        Self::Constraint {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn conflict(code: &str, message: impl Into<String>) -> Self {
        Self::Conflict {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn connection(code: &str, message: impl Into<String>) -> Self {
        Self::Connection {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn not_found(entity: &str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }

    /// Maps a raw driver SQLSTATE onto the error taxonomy.
    ///
    /// Codes outside the known classes become `Execution`, which is never retried.
    pub fn from_sqlstate(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        if SERIALIZATION_CODES.contains(&code) {
            return Self::conflict(code, message);
        }
        if CONNECTION_CODES.contains(&code) {
            return Self::connection(code, message);
        }
        if code.starts_with("23") {
            return Self::constraint(code, message);
        }
        if code == "57014" {
            // query_canceled, raised by statement_timeout
            return Self::Timeout {
                kind: TimeoutKind::Statement,
                elapsed: Duration::ZERO,
            };
        }
        if code.starts_with("22") || code.starts_with("42") {
            return Self::Validation(format!("[{code}] {message}"));
        }
        Self::Execution(format!("[{code}] {message}"))
    }

    /// SQLSTATE carried by this error, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Constraint { code, .. }
            | Self::Conflict { code, .. }
            | Self::Connection { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Returns `true` when replaying the whole transaction may succeed.
    ///
    /// Decided purely by SQLSTATE membership in [`SERIALIZATION_CODES`] or
    /// [`CONNECTION_CODES`]; message text is never inspected.
    pub fn is_retryable(&self) -> bool {
        match self.code() {
            Some(code) => SERIALIZATION_CODES.contains(&code) || CONNECTION_CODES.contains(&code),
            None => false,
        }
    }

    pub fn is_acquire_timeout(&self) -> bool {
        matches!(
            self,
            Self::Timeout {
                kind: TimeoutKind::Acquire,
                ..
            }
        )
    }

    /// Innermost cause, unwrapping `RetryExhausted`.
    pub fn root_cause(&self) -> &DbError {
        match self {
            Self::RetryExhausted { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
