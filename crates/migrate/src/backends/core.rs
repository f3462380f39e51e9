//! Core Store Traits
//!
//! This module defines the traits the migration engine talks to. A store hands
//! out transactions; everything a migration does (raw SQL, typed schema
//! changes, catalog introspection, ledger bookkeeping) goes through a
//! [`StoreTransaction`] so that a unit and its ledger entry commit together.

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use super::DatabaseBackendType;
use crate::error::StoreResult;
use crate::migrations::definitions::LedgerEntry;
use crate::migrations::schema::{ColumnDef, ColumnInfo, ConstraintInfo, ForeignKeyDef, TableDef};

/// A connection to the store being migrated
#[async_trait]
pub trait MigrationStore: Send + Sync {
    /// Which backend this is
    fn backend_type(&self) -> DatabaseBackendType;

    /// Begin a transaction
    async fn begin_transaction(&self) -> StoreResult<Box<dyn StoreTransaction>>;

    /// Acquire a session-level advisory lock, waiting if another session holds it
    async fn lock(&self, key: i64) -> StoreResult<()>;

    /// Release a lock taken with [`MigrationStore::lock`]
    async fn unlock(&self, key: i64) -> StoreResult<()>;

    /// Close the store
    async fn close(&self) -> StoreResult<()>;
}

/// Abstract store transaction
///
/// Typed operations are not guarded here: they fail with the store's native
/// error (duplicate table, duplicate object, ...) and the executor decides
/// what is tolerated.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Execute a statement within the transaction, returning affected rows
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> StoreResult<u64>;

    async fn savepoint(&mut self, name: &str) -> StoreResult<()>;

    async fn rollback_to_savepoint(&mut self, name: &str) -> StoreResult<()>;

    async fn release_savepoint(&mut self, name: &str) -> StoreResult<()>;

    async fn table_exists(&mut self, table: &str) -> StoreResult<bool>;

    async fn column_info(&mut self, table: &str, column: &str) -> StoreResult<Option<ColumnInfo>>;

    async fn constraint_info(
        &mut self,
        table: &str,
        name: &str,
    ) -> StoreResult<Option<ConstraintInfo>>;

    async fn create_table(&mut self, table: &TableDef) -> StoreResult<()>;

    async fn add_column(&mut self, table: &str, column: &ColumnDef) -> StoreResult<()>;

    /// Insert a row unless one with the same natural key exists; returns rows inserted
    async fn insert_if_absent(
        &mut self,
        table: &str,
        key: &[String],
        values: &[(String, DatabaseValue)],
    ) -> StoreResult<u64>;

    /// Read `id_column` of the row whose `key_column` equals `key`
    async fn find_value(
        &mut self,
        table: &str,
        key_column: &str,
        key: &DatabaseValue,
        id_column: &str,
    ) -> StoreResult<Option<DatabaseValue>>;

    /// Set `column = value` on every row where it is NULL; returns rows updated
    async fn backfill_column(
        &mut self,
        table: &str,
        column: &str,
        value: &DatabaseValue,
    ) -> StoreResult<u64>;

    async fn set_column_default(
        &mut self,
        table: &str,
        column: &str,
        value: &DatabaseValue,
    ) -> StoreResult<()>;

    async fn set_not_null(&mut self, table: &str, column: &str) -> StoreResult<()>;

    async fn add_foreign_key(&mut self, table: &str, foreign_key: &ForeignKeyDef) -> StoreResult<()>;

    /// Create the ledger table if it does not exist
    async fn ensure_ledger(&mut self, table: &str) -> StoreResult<()>;

    async fn ledger_entries(&mut self, table: &str) -> StoreResult<Vec<LedgerEntry>>;

    /// Append one ledger entry; a recorded version fails with a unique violation
    async fn insert_ledger_entry(&mut self, table: &str, entry: &LedgerEntry) -> StoreResult<()>;

    /// Commit the transaction
    async fn commit(self: Box<Self>) -> StoreResult<()>;

    /// Rollback the transaction
    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

/// Database value enumeration for type-safe parameter binding
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseValue {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    String(String),
    DateTime(chrono::DateTime<chrono::Utc>),
    Json(JsonValue),
}

impl DatabaseValue {
    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, DatabaseValue::Null)
    }
}

impl std::fmt::Display for DatabaseValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseValue::Null => f.write_str("NULL"),
            DatabaseValue::Bool(b) => write!(f, "{}", b),
            DatabaseValue::Int32(i) => write!(f, "{}", i),
            DatabaseValue::Int64(i) => write!(f, "{}", i),
            DatabaseValue::Float64(v) => write!(f, "{}", v),
            DatabaseValue::String(s) => write!(f, "'{}'", s),
            DatabaseValue::DateTime(dt) => write!(f, "'{}'", dt.to_rfc3339()),
            DatabaseValue::Json(j) => write!(f, "{}", j),
        }
    }
}

impl From<bool> for DatabaseValue {
    fn from(value: bool) -> Self {
        DatabaseValue::Bool(value)
    }
}

impl From<i32> for DatabaseValue {
    fn from(value: i32) -> Self {
        DatabaseValue::Int32(value)
    }
}

impl From<i64> for DatabaseValue {
    fn from(value: i64) -> Self {
        DatabaseValue::Int64(value)
    }
}

impl From<f64> for DatabaseValue {
    fn from(value: f64) -> Self {
        DatabaseValue::Float64(value)
    }
}

impl From<String> for DatabaseValue {
    fn from(value: String) -> Self {
        DatabaseValue::String(value)
    }
}

impl From<&str> for DatabaseValue {
    fn from(value: &str) -> Self {
        DatabaseValue::String(value.to_string())
    }
}

impl From<chrono::DateTime<chrono::Utc>> for DatabaseValue {
    fn from(value: chrono::DateTime<chrono::Utc>) -> Self {
        DatabaseValue::DateTime(value)
    }
}

impl From<JsonValue> for DatabaseValue {
    fn from(value: JsonValue) -> Self {
        DatabaseValue::Json(value)
    }
}

impl<T> From<Option<T>> for DatabaseValue
where
    T: Into<DatabaseValue>,
{
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => DatabaseValue::Null,
        }
    }
}
