//! Error types for holdings-load
//!
//! Errors are classified so the orchestrator can decide how far a failure
//! reaches:
//! - Call-fatal errors (validation, connection)
//! - Partition-local errors (schema, transfer)

use std::fmt;
use thiserror::Error;

use crate::types::PartitionKey;

/// Result type for holdings-load operations
pub type Result<T> = std::result::Result<T, Error>;

/// SQLSTATE codes that mean "the object is already there".
///
/// `23505` shows up when two sessions race on `CREATE TABLE` and the loser
/// trips the unique index on `pg_type`.
const ALREADY_EXISTS_CODES: &[&str] = &["42P07", "42710", "23505"];

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Malformed input record (not retriable)
    Validation,
    /// Store unreachable or session lost (retriable)
    Connection,
    /// Statement execution errors
    Query,
    /// Transaction control errors
    Transaction,
    /// DDL failures
    Schema,
    /// Bulk-copy failure for one partition group
    Transfer,
    /// Configuration error
    Configuration,
    /// Local I/O
    Io,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Connection | Self::Transfer)
    }

    /// Whether errors in this category abort a whole load call
    #[inline]
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::Validation | Self::Connection)
    }
}

/// Main error type for holdings-load
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// A record failed validation before any I/O
    #[error("validation error{}: {message}", .row.map(|r| format!(" at row {r}")).unwrap_or_default())]
    Validation { row: Option<usize>, message: String },

    /// Connection failed or was lost
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Statement execution failed
    #[error("query error: {message}")]
    Query {
        message: String,
        sql: Option<String>,
        /// SQLSTATE reported by the server, if any
        code: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Transaction control failed
    #[error("transaction error: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// DDL failed for a table or partition
    #[error("schema error on {table}: {message}")]
    Schema {
        table: String,
        message: String,
        #[source]
        source: Option<Box<Error>>,
    },

    /// Bulk copy of one partition group failed
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Local I/O error (sources, log files)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of a single partition group's bulk copy.
///
/// The group's transaction has been rolled back when this is returned.
#[derive(Error, Debug)]
#[error("transfer of {rows} rows into {table} for {key} failed: {source}")]
pub struct TransferError {
    /// Qualified parent table name
    pub table: String,
    /// Partition key of the group
    pub key: PartitionKey,
    /// Number of rows in the group
    pub rows: usize,
    /// Underlying cause
    #[source]
    pub source: Box<Error>,
}

impl TransferError {
    /// Create a transfer error for a group
    pub fn new(table: impl Into<String>, key: PartitionKey, rows: usize, source: Error) -> Self {
        Self {
            table: table.into(),
            key,
            rows,
            source: Box::new(source),
        }
    }

    /// Whether the underlying cause was a lost connection
    pub fn is_connection_lost(&self) -> bool {
        self.source.category() == ErrorCategory::Connection
    }
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation { .. } => ErrorCategory::Validation,
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Query { .. } => ErrorCategory::Query,
            Self::Transaction { .. } => ErrorCategory::Transaction,
            Self::Schema { .. } => ErrorCategory::Schema,
            Self::Transfer(_) => ErrorCategory::Transfer,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Io(_) => ErrorCategory::Io,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Whether this error means the DDL target already exists
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::Query {
                code: Some(code), ..
            } => ALREADY_EXISTS_CODES.contains(&code.as_str()),
            Self::Schema {
                source: Some(inner),
                ..
            } => inner.is_already_exists(),
            _ => false,
        }
    }

    /// SQLSTATE of the underlying server error, if any
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Query { code, .. } => code.as_deref(),
            Self::Schema {
                source: Some(inner),
                ..
            } => inner.sql_state(),
            Self::Transfer(t) => t.source.sql_state(),
            _ => None,
        }
    }

    /// Create a validation error for a given input row
    pub fn validation(row: Option<usize>, message: impl Into<String>) -> Self {
        Self::Validation {
            row,
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: None,
            code: None,
            source: None,
        }
    }

    /// Create a query error with SQL
    pub fn query_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
            code: None,
            source: None,
        }
    }

    /// Create a query error carrying a SQLSTATE
    pub fn query_with_code(
        message: impl Into<String>,
        sql: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
            code: Some(code.into()),
            source: None,
        }
    }

    /// Create a transaction error
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap a statement failure as a schema error on `table`
    pub fn schema_with_source(table: impl Into<String>, source: Error) -> Self {
        Self::Schema {
            table: table.into(),
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Connection => write!(f, "connection"),
            Self::Query => write!(f, "query"),
            Self::Transaction => write!(f, "transaction"),
            Self::Schema => write!(f, "schema"),
            Self::Transfer => write!(f, "transfer"),
            Self::Configuration => write!(f, "configuration"),
            Self::Io => write!(f, "io"),
        }
    }
}
