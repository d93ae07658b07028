//! Error types for the connection lifecycle and transaction propagation layers.
//!
//! Driver errors are converted into [`DbError`] exactly once, at the point where
//! they leave sqlx (`From<sqlx::Error>`). Everything above that boundary passes
//! `DbError` through unchanged.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Unable to connect after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        attempts: u64,
        #[source]
        source: Box<DbError>,
    },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("No rows returned")]
    NotFound,

    #[error("Not connected: {message}")]
    NotConnected { message: String },

    #[error("Unable to terminate transaction statement: not in a transaction")]
    NotInTransaction,

    #[error("Unable to get transaction from context")]
    NoTransactionInContext,

    #[error("Transaction {transaction_id} is already {state}")]
    TransactionTerminated {
        transaction_id: String,
        state: String,
    },

    #[error("Transaction {transaction_id} connection is already in use by this task")]
    TransactionBusy { transaction_id: String },

    #[error("Timeout: {operation} exceeded its deadline")]
    Timeout { operation: String },

    #[error("Cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<DbError>,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    pub fn retries_exhausted(attempts: u64, last: DbError) -> Self {
        Self::RetriesExhausted {
            attempts,
            source: Box::new(last),
        }
    }

    pub fn not_connected(message: impl Into<String>) -> Self {
        Self::NotConnected {
            message: message.into(),
        }
    }

    pub fn transaction_terminated(
        transaction_id: impl Into<String>,
        state: impl std::fmt::Display,
    ) -> Self {
        Self::TransactionTerminated {
            transaction_id: transaction_id.into(),
            state: state.to_string(),
        }
    }

    pub fn transaction_busy(transaction_id: impl Into<String>) -> Self {
        Self::TransactionBusy {
            transaction_id: transaction_id.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Attach a caller-supplied description to this error.
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::RetriesExhausted { source, .. } | Self::Context { source, .. } => {
                source.suggestion()
            }
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Timeout { .. } | Self::NotConnected { .. }
        )
    }

    /// True for the "no rows found" condition, looking through added context.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound => true,
            Self::Context { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// True for misuse of the transaction state machine. These are programming
    /// errors and must not be retried.
    pub fn is_transaction_state(&self) -> bool {
        matches!(
            self,
            Self::NotInTransaction
                | Self::NoTransactionInContext
                | Self::TransactionTerminated { .. }
                | Self::TransactionBusy { .. }
        )
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection parameters and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::NotFound,
            sqlx::Error::PoolTimedOut => DbError::timeout("connection pool acquire"),
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Reconnect to the database")
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify the sslmode setting and server certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => DbError::database(
                format!("Column not found: {}", col),
                None,
                "Check the selected column names",
            ),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
