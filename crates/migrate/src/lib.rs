//! # strata-migrate: idempotent schema migrations
//!
//! Applies an ordered sequence of migration units to a PostgreSQL store so
//! that re-running the sequence is always safe:
//!
//! - every unit runs in one transaction together with its ledger entry;
//! - guarded statements tolerate work that is already done (existing tables,
//!   columns, constraints and seeded rows);
//! - runtime lookups fail the unit instead of writing NULLs.
//!
//! The [`MemoryStore`] backend mirrors PostgreSQL's relevant behavior in
//! process and backs the test suite.

pub mod backends;
pub mod catalog;
pub mod config;
pub mod error;
pub mod migrations;
pub mod security;

pub use backends::{
    DatabaseBackendType, DatabaseValue, MemoryStore, MigrationStore, PostgresStore,
    StoreTransaction,
};
pub use config::MigrateConfig;
pub use error::{
    ConfigError, ConstraintMismatch, DuplicateVersionError, ExecutionError, LookupMustExistError,
    MigrateResult, MigrationError, RunError, SourceLoadError, StatementFailure, StoreError,
    StoreErrorKind, StoreResult,
};
pub use migrations::{
    ConstraintCheck, DirectorySource, GuardOutcome, GuardPolicy, MigrationRunner,
    MigrationSource, MigrationStatus, MigrationStatusLine, MigrationUnit, RunOptions, RunReport,
    RunState, StaticSource, Statement, Version,
};
