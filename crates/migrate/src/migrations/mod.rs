//! Migration System
//!
//! Units come from a [`MigrationSource`], are ordered by [`Version`], executed
//! by the [`StatementExecutor`] under the idempotence rules of
//! [`GuardPolicy`], and recorded in the [`VersionLedger`]. The
//! [`MigrationRunner`] ties these together.

pub mod definitions;
pub mod executor;
pub mod guard;
pub mod ledger;
pub mod runner;
pub mod schema;
pub mod source;
pub mod sql_split;

pub use definitions::{
    AddColumn, AddForeignKey, ColumnRef, ColumnValue, LedgerEntry, Literal, MigrationStatus,
    MigrationStatusLine, MigrationUnit, RowLookup, RunReport, RunState, SeedRow, Statement,
    UnitReport, ValueRef, Version,
};
pub use executor::{ExecutionReport, StatementExecutor, StatementReport};
pub use guard::{ConstraintCheck, GuardKind, GuardOutcome, GuardPolicy, RawConstraint};
pub use ledger::{VersionLedger, DEFAULT_LEDGER_TABLE};
pub use runner::{MigrationRunner, RunOptions};
pub use schema::{
    ColumnDef, ColumnInfo, ColumnType, ConstraintInfo, ConstraintKind, DefaultExpr, ForeignKeyDef,
    TableDef,
};
pub use source::{DirectorySource, MigrationSource, StaticSource};
pub use sql_split::split_sql_statements;
