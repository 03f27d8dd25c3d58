use std::time::Duration;
use thiserror::Error;

/// Failures reported by the ledger layer (sessions, transactions, statements).
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Table '{0}' already exists")]
    TableExists(String),

    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Index on '{table}.{field}' already exists")]
    IndexExists { table: String, field: String },

    #[error("Document '{document_id}' not found in table '{table}'")]
    DocumentNotFound { table: String, document_id: String },

    #[error("Statement expects {expected} parameter(s), got {actual}")]
    ParameterMismatch { expected: usize, actual: usize },

    #[error("OCC conflict: {0}")]
    OccConflict(String),

    #[error("Transaction '{0}' is no longer active")]
    TransactionClosed(String),

    #[error("Session is closed")]
    SessionClosed,

    #[error("Ledger '{0}' not found")]
    LedgerNotFound(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Journal error: {0}")]
    JournalError(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Statement {index} failed: {source}")]
    Statement {
        index: usize,
        statement: String,
        #[source]
        source: Box<LedgerError>,
    },

    #[error("Execution error: {0}")]
    ExecutionError(String),
}

impl LedgerError {
    /// True for failures a fresh transaction attempt may not hit again.
    pub fn is_retriable(&self) -> bool {
        match self {
            LedgerError::OccConflict(_) => true,
            LedgerError::Statement { source, .. } => source.is_retriable(),
            _ => false,
        }
    }
}

impl From<std::io::Error> for LedgerError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

/// Errors returned to the migration framework by driver operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    #[error("Invalid connection string: {0}")]
    Config(String),

    #[error("Failed to connect to ledger: {0}")]
    Connection(#[source] LedgerError),

    #[error("Migration lock is already held by this driver")]
    AlreadyLocked,

    #[error("Migration lock is held by '{holder}' since {acquired_at}")]
    LockHeld { holder: String, acquired_at: String },

    #[error("Lock {operation} failed: {source}")]
    LockIo {
        operation: &'static str,
        #[source]
        source: LedgerError,
    },

    #[error("Failed to read schema version: {0}")]
    VersionRead(#[source] LedgerError),

    #[error("Failed to write schema version: {0}")]
    VersionWrite(#[source] LedgerError),

    #[error("Invalid schema version {0}: must be >= -1")]
    InvalidVersion(i64),

    #[error("Migration failed at statement {index} ({statement}): {source}")]
    Execution {
        index: usize,
        statement: String,
        #[source]
        source: LedgerError,
    },

    #[error("Failed to read migration: {0}")]
    MigrationRead(#[from] std::io::Error),

    #[error("Drop failed: {0}")]
    Drop(#[source] LedgerError),

    #[error("Close failed: {0}")]
    Close(#[source] LedgerError),

    #[error("No driver registered for scheme '{0}'")]
    UnknownScheme(String),
}

pub type Result<T> = std::result::Result<T, MigrateError>;

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_occ_conflict_is_retriable() {
        assert!(LedgerError::OccConflict("t".into()).is_retriable());
        assert!(!LedgerError::TableNotFound("t".into()).is_retriable());
        assert!(!LedgerError::Timeout(Duration::from_secs(1)).is_retriable());
    }

    #[test]
    fn test_wrapped_statement_error_keeps_classification() {
        let wrapped = LedgerError::Statement {
            index: 2,
            statement: "INSERT INTO t VALUE {}".into(),
            source: Box::new(LedgerError::OccConflict("t".into())),
        };
        assert!(wrapped.is_retriable());

        let fatal = LedgerError::Statement {
            index: 0,
            statement: "DROP TABLE t".into(),
            source: Box::new(LedgerError::TableNotFound("t".into())),
        };
        assert!(!fatal.is_retriable());
    }

    #[test]
    fn test_execution_error_exposes_cause() {
        use std::error::Error;

        let err = MigrateError::Execution {
            index: 1,
            statement: "CREATE TABLE users".into(),
            source: LedgerError::TableExists("users".into()),
        };
        let cause = err.source().map(|s| s.to_string());
        assert_eq!(cause.as_deref(), Some("Table 'users' already exists"));
        assert!(err.to_string().contains("statement 1"));
    }
}
