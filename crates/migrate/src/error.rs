//! Error types for the migration engine
//!
//! Store-level failures carry a classified [`StoreErrorKind`] so guards can
//! tell "already exists" apart from real failures. Everything above the store
//! (source loading, statement execution, ledger bookkeeping) has its own type,
//! and [`RunError`] ties a failure to the migration version that caused it.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::migrations::definitions::Version;

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type alias for engine operations
pub type MigrateResult<T> = Result<T, MigrationError>;

/// Classification of a store failure, derived from the SQLSTATE when one is available
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreErrorKind {
    /// Unique or primary key violation (23505)
    UniqueViolation,
    /// Relation already exists (42P07)
    DuplicateTable,
    /// Named object such as a constraint already exists (42710)
    DuplicateObject,
    /// Column already exists (42701)
    DuplicateColumn,
    /// Foreign key violation, e.g. orphaned rows (23503)
    ForeignKeyViolation,
    /// NULL in a NOT NULL column (23502)
    NotNullViolation,
    /// Referenced table, column or object does not exist (42P01, 42703, 42704)
    UndefinedObject,
    /// Connection, pool or transport failure
    Connection,
    /// Transaction already completed or could not be started
    Transaction,
    /// Anything else
    Other,
}

impl StoreErrorKind {
    /// Map a PostgreSQL SQLSTATE code onto a kind
    pub fn from_sqlstate(code: &str) -> Self {
        match code {
            "23505" => StoreErrorKind::UniqueViolation,
            "42P07" => StoreErrorKind::DuplicateTable,
            "42710" => StoreErrorKind::DuplicateObject,
            "42701" => StoreErrorKind::DuplicateColumn,
            "23503" => StoreErrorKind::ForeignKeyViolation,
            "23502" => StoreErrorKind::NotNullViolation,
            "42P01" | "42703" | "42704" => StoreErrorKind::UndefinedObject,
            c if c.starts_with("08") => StoreErrorKind::Connection,
            "25P02" => StoreErrorKind::Transaction,
            _ => StoreErrorKind::Other,
        }
    }
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StoreErrorKind::UniqueViolation => "unique violation",
            StoreErrorKind::DuplicateTable => "duplicate table",
            StoreErrorKind::DuplicateObject => "duplicate object",
            StoreErrorKind::DuplicateColumn => "duplicate column",
            StoreErrorKind::ForeignKeyViolation => "foreign key violation",
            StoreErrorKind::NotNullViolation => "not-null violation",
            StoreErrorKind::UndefinedObject => "undefined object",
            StoreErrorKind::Connection => "connection error",
            StoreErrorKind::Transaction => "transaction error",
            StoreErrorKind::Other => "database error",
        };
        f.write_str(label)
    }
}

/// A failure reported by a store backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}{}: {message}", .code.as_ref().map(|c| format!(" [{}]", c)).unwrap_or_default())]
pub struct StoreError {
    pub kind: StoreErrorKind,
    /// SQLSTATE, when the backend reported one
    pub code: Option<String>,
    pub message: String,
}

impl StoreError {
    pub fn new(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
        }
    }

    /// Build an error from a SQLSTATE code and driver message
    pub fn from_sqlstate(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        Self {
            kind: StoreErrorKind::from_sqlstate(&code),
            code: Some(code),
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Connection, message)
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Transaction, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Other, message)
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => match db.code() {
                Some(code) => StoreError::from_sqlstate(code.into_owned(), db.message()),
                None => StoreError::other(db.message()),
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::connection(err.to_string()),
            _ => StoreError::other(err.to_string()),
        }
    }
}

/// Malformed migration definitions. Nothing is executed when loading fails.
#[derive(Debug, Error)]
pub enum SourceLoadError {
    #[error("failed to read {path}: {message}")]
    Unreadable { path: PathBuf, message: String },

    #[error("invalid migration file name '{0}': expected <version>_<name>.sql or .yaml")]
    InvalidFileName(String),

    #[error("invalid migration version '{0}'")]
    InvalidVersion(String),

    #[error("duplicate migration version {version} ('{first}' and '{second}')")]
    DuplicateVersion {
        version: Version,
        first: String,
        second: String,
    },

    #[error("migration {version}: {message}")]
    Malformed { version: Version, message: String },
}

/// A required seeded row is missing, so no default can be resolved from it
#[derive(Debug, Clone, Error)]
#[error("required row {table}.{key_column} = {key} does not exist")]
pub struct LookupMustExistError {
    pub table: String,
    pub key_column: String,
    pub key: String,
}

/// A constraint with the expected name exists but enforces something else
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("constraint {name} on {table} already exists with a different definition (expected {expected}, found {found})")]
pub struct ConstraintMismatch {
    pub table: String,
    pub name: String,
    pub expected: String,
    pub found: String,
}

/// Why a single statement failed
#[derive(Debug, Clone, Error)]
pub enum StatementFailure {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    LookupMustExist(#[from] LookupMustExistError),

    #[error(transparent)]
    ConstraintMismatch(#[from] ConstraintMismatch),
}

/// A statement inside a unit failed; the unit's transaction must be rolled back
#[derive(Debug, Clone, Error)]
#[error("statement {statement_index} failed: {cause}")]
pub struct ExecutionError {
    /// Zero-based index of the failing statement within its unit
    pub statement_index: usize,
    #[source]
    pub cause: StatementFailure,
}

/// The ledger already holds this version
#[derive(Debug, Clone, Error)]
#[error("migration version {version} is already recorded in the ledger")]
pub struct DuplicateVersionError {
    pub version: Version,
}

/// Engine-level failure
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(transparent)]
    Source(#[from] SourceLoadError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    DuplicateVersion(#[from] DuplicateVersionError),

    /// Versions seen earlier in this process disappeared from the ledger
    #[error("ledger lost previously applied versions: {}", join_versions(.missing))]
    LedgerRegression { missing: Vec<Version> },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MigrationError {
    /// True when the failure came from a missing required row
    pub fn is_lookup_must_exist(&self) -> bool {
        matches!(
            self,
            MigrationError::Execution(ExecutionError {
                cause: StatementFailure::LookupMustExist(_),
                ..
            })
        )
    }
}

fn join_versions(versions: &[Version]) -> String {
    versions
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// A migration run aborted. Later units were not attempted.
#[derive(Debug)]
pub struct RunError {
    /// Version of the unit being applied, `None` if the run failed before or between units
    pub failed_version: Option<Version>,
    pub failed_name: Option<String>,
    pub cause: MigrationError,
}

impl RunError {
    /// Failure outside of any particular unit (loading, ledger reads, locking)
    pub fn outside(cause: impl Into<MigrationError>) -> Self {
        Self {
            failed_version: None,
            failed_name: None,
            cause: cause.into(),
        }
    }

    /// Failure while applying the given unit
    pub fn at(version: &Version, name: &str, cause: impl Into<MigrationError>) -> Self {
        Self {
            failed_version: Some(version.clone()),
            failed_name: Some(name.to_string()),
            cause: cause.into(),
        }
    }

    /// Index of the failing statement, when the failure came from one
    pub fn statement_index(&self) -> Option<usize> {
        match &self.cause {
            MigrationError::Execution(e) => Some(e.statement_index),
            _ => None,
        }
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.failed_version, &self.failed_name) {
            (Some(version), Some(name)) => {
                write!(f, "migration {} ({}) failed: {}", version, name, self.cause)
            }
            (Some(version), None) => write!(f, "migration {} failed: {}", version, self.cause),
            _ => write!(f, "migration run failed: {}", self.cause),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

/// Configuration error type
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required field: {field}. {hint}")]
    MissingRequired { field: String, hint: String },

    #[error("Invalid value for field '{field}': '{value}'. Expected: {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Configuration validation failed: {message}")]
    ValidationFailed { message: String },
}

impl ConfigError {
    /// Create a missing required field error
    pub fn missing_required(field: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::MissingRequired {
            field: field.into(),
            hint: hint.into(),
        }
    }

    /// Create an invalid value error
    pub fn invalid_value(
        field: impl Into<String>,
        value: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.into(),
            expected: expected.into(),
        }
    }

    /// Create a validation failed error
    pub fn validation_failed(message: impl Into<String>) -> Self {
        Self::ValidationFailed {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlstate_classification() {
        assert_eq!(StoreErrorKind::from_sqlstate("23505"), StoreErrorKind::UniqueViolation);
        assert_eq!(StoreErrorKind::from_sqlstate("42P07"), StoreErrorKind::DuplicateTable);
        assert_eq!(StoreErrorKind::from_sqlstate("42710"), StoreErrorKind::DuplicateObject);
        assert_eq!(StoreErrorKind::from_sqlstate("42701"), StoreErrorKind::DuplicateColumn);
        assert_eq!(StoreErrorKind::from_sqlstate("23503"), StoreErrorKind::ForeignKeyViolation);
        assert_eq!(StoreErrorKind::from_sqlstate("08006"), StoreErrorKind::Connection);
        assert_eq!(StoreErrorKind::from_sqlstate("22P02"), StoreErrorKind::Other);
    }

    #[test]
    fn test_store_error_display_includes_code() {
        let err = StoreError::from_sqlstate("23503", "insert violates fk_products_supplier_id");
        assert_eq!(
            err.to_string(),
            "foreign key violation [23503]: insert violates fk_products_supplier_id"
        );

        let err = StoreError::other("boom");
        assert_eq!(err.to_string(), "database error: boom");
    }

    #[test]
    fn test_run_error_reports_version_index_and_cause() {
        let version = Version::parse("0002").unwrap();
        let cause = ExecutionError {
            statement_index: 3,
            cause: StatementFailure::LookupMustExist(LookupMustExistError {
                table: "suppliers".to_string(),
                key_column: "supplier_code".to_string(),
                key: "'unknown'".to_string(),
            }),
        };
        let err = RunError::at(&version, "backfill suppliers", cause);

        assert_eq!(err.statement_index(), Some(3));
        assert!(err.cause.is_lookup_must_exist());
        let message = err.to_string();
        assert!(message.contains("migration 0002 (backfill suppliers) failed"));
        assert!(message.contains("statement 3 failed"));
        assert!(message.contains("suppliers.supplier_code = 'unknown'"));
    }

    #[test]
    fn test_run_error_outside_unit() {
        let err = RunError::outside(StoreError::connection("refused"));
        assert_eq!(err.failed_version, None);
        assert_eq!(err.statement_index(), None);
        assert_eq!(
            err.to_string(),
            "migration run failed: connection error: refused"
        );
    }
}
