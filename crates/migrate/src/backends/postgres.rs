//! PostgreSQL Backend Implementation
//!
//! This module provides the PostgreSQL implementation of the store traits
//! using sqlx as the underlying database driver.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::{Column, Executor, PgPool, Postgres, Row, TypeInfo, ValueRef};
use tokio::sync::Mutex;
use tracing::debug;

use super::core::*;
use super::pg_sql;
use super::DatabaseBackendType;
use crate::error::{StoreError, StoreResult};
use crate::migrations::definitions::{LedgerEntry, Version};
use crate::migrations::schema::{
    ColumnDef, ColumnInfo, ConstraintInfo, ConstraintKind, ForeignKeyDef, TableDef,
};

/// One connection runs the migration transaction, the other holds the advisory lock
const POOL_SIZE: u32 = 2;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Check that a URL names a PostgreSQL database
pub fn validate_database_url(url: &str) -> StoreResult<()> {
    let parsed = url::Url::parse(url)
        .map_err(|e| StoreError::connection(format!("Invalid database URL: {}", e)))?;

    if !matches!(parsed.scheme(), "postgres" | "postgresql") {
        return Err(StoreError::connection(format!(
            "Invalid PostgreSQL URL scheme '{}'",
            parsed.scheme()
        )));
    }

    if parsed.path().trim_start_matches('/').is_empty() {
        return Err(StoreError::connection("Missing database name in URL"));
    }

    Ok(())
}

/// PostgreSQL store
pub struct PostgresStore {
    pool: PgPool,
    lock_conn: Mutex<Option<PoolConnection<Postgres>>>,
}

impl PostgresStore {
    /// Connect with a small fixed-size pool
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        validate_database_url(database_url)?;

        let pool = PgPoolOptions::new()
            .max_connections(POOL_SIZE)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::connection(format!("Failed to create PostgreSQL pool: {}", e)))?;

        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            lock_conn: Mutex::new(None),
        }
    }

    /// Get the database pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MigrationStore for PostgresStore {
    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::PostgreSQL
    }

    async fn begin_transaction(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::transaction(format!("Failed to start transaction: {}", e)))?;
        Ok(Box::new(PostgresTransaction::new(tx)))
    }

    async fn lock(&self, key: i64) -> StoreResult<()> {
        let mut guard = self.lock_conn.lock().await;
        if guard.is_some() {
            return Err(StoreError::other(format!(
                "advisory lock {} is already held by this store",
                key
            )));
        }

        let mut conn = self.pool.acquire().await?;
        debug!(key, "waiting for advisory lock");
        sqlx::query(pg_sql::ADVISORY_LOCK)
            .bind(key)
            .execute(&mut *conn)
            .await?;
        *guard = Some(conn);
        Ok(())
    }

    async fn unlock(&self, key: i64) -> StoreResult<()> {
        let conn = self.lock_conn.lock().await.take();
        match conn {
            Some(mut conn) => {
                sqlx::query(pg_sql::ADVISORY_UNLOCK)
                    .bind(key)
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            }
            None => Err(StoreError::other(format!("advisory lock {} is not held", key))),
        }
    }

    async fn close(&self) -> StoreResult<()> {
        self.lock_conn.lock().await.take();
        self.pool.close().await;
        Ok(())
    }
}

/// PostgreSQL transaction implementation
pub struct PostgresTransaction {
    tx: Option<sqlx::Transaction<'static, Postgres>>,
}

impl PostgresTransaction {
    pub fn new(tx: sqlx::Transaction<'static, Postgres>) -> Self {
        Self { tx: Some(tx) }
    }

    fn tx(&mut self) -> StoreResult<&mut sqlx::Transaction<'static, Postgres>> {
        self.tx
            .as_mut()
            .ok_or_else(|| StoreError::transaction("Transaction already completed"))
    }

    async fn run(&mut self, sql: &str) -> StoreResult<u64> {
        debug!(sql, "executing");
        let tx = self.tx()?;
        let result = (&mut **tx).execute(sql).await?;
        Ok(result.rows_affected())
    }

    async fn run_bound(&mut self, sql: &str, params: &[DatabaseValue]) -> StoreResult<u64> {
        debug!(sql, params = params.len(), "executing");
        let tx = self.tx()?;
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_database_value(query, param);
        }
        let result = query.execute(&mut **tx).await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> StoreResult<u64> {
        if params.is_empty() {
            self.run(sql).await
        } else {
            self.run_bound(sql, params).await
        }
    }

    async fn savepoint(&mut self, name: &str) -> StoreResult<()> {
        self.run(&pg_sql::savepoint(name)).await.map(|_| ())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> StoreResult<()> {
        self.run(&pg_sql::rollback_to_savepoint(name))
            .await
            .map(|_| ())
    }

    async fn release_savepoint(&mut self, name: &str) -> StoreResult<()> {
        self.run(&pg_sql::release_savepoint(name)).await.map(|_| ())
    }

    async fn table_exists(&mut self, table: &str) -> StoreResult<bool> {
        let tx = self.tx()?;
        let exists: bool = sqlx::query_scalar(pg_sql::TABLE_EXISTS)
            .bind(table)
            .fetch_one(&mut **tx)
            .await?;
        Ok(exists)
    }

    async fn column_info(&mut self, table: &str, column: &str) -> StoreResult<Option<ColumnInfo>> {
        let tx = self.tx()?;
        let row = sqlx::query(pg_sql::COLUMN_INFO)
            .bind(table)
            .bind(column)
            .fetch_optional(&mut **tx)
            .await?;

        match row {
            Some(row) => Ok(Some(ColumnInfo {
                name: row.try_get("column_name")?,
                data_type: row.try_get("data_type")?,
                nullable: row.try_get("nullable")?,
                default: row.try_get("column_default")?,
            })),
            None => Ok(None),
        }
    }

    async fn constraint_info(
        &mut self,
        table: &str,
        name: &str,
    ) -> StoreResult<Option<ConstraintInfo>> {
        let tx = self.tx()?;
        let row = sqlx::query(pg_sql::CONSTRAINT_INFO)
            .bind(table)
            .bind(name)
            .fetch_optional(&mut **tx)
            .await?;

        match row {
            Some(row) => {
                let kind: String = row.try_get("kind")?;
                Ok(Some(ConstraintInfo {
                    name: row.try_get("name")?,
                    kind: ConstraintKind::from_pg_contype(&kind),
                    columns: row.try_get("columns")?,
                    referenced_table: row.try_get("referenced_table")?,
                    referenced_columns: row.try_get("referenced_columns")?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn create_table(&mut self, table: &TableDef) -> StoreResult<()> {
        self.run(&pg_sql::create_table(table)).await.map(|_| ())
    }

    async fn add_column(&mut self, table: &str, column: &ColumnDef) -> StoreResult<()> {
        self.run(&pg_sql::add_column(table, column)).await.map(|_| ())
    }

    async fn insert_if_absent(
        &mut self,
        table: &str,
        key: &[String],
        values: &[(String, DatabaseValue)],
    ) -> StoreResult<u64> {
        let columns: Vec<String> = values.iter().map(|(c, _)| c.clone()).collect();
        let params: Vec<DatabaseValue> = values.iter().map(|(_, v)| v.clone()).collect();
        let sql = pg_sql::insert_if_absent(table, key, &columns);
        self.run_bound(&sql, &params).await
    }

    async fn find_value(
        &mut self,
        table: &str,
        key_column: &str,
        key: &DatabaseValue,
        id_column: &str,
    ) -> StoreResult<Option<DatabaseValue>> {
        let sql = pg_sql::select_value(table, key_column, id_column);
        debug!(sql = %sql, key = %key, "looking up row");
        let tx = self.tx()?;
        let row = bind_database_value(sqlx::query(&sql), key)
            .fetch_optional(&mut **tx)
            .await?;

        match row {
            Some(row) => postgres_value_to_database_value(&row, 0).map(Some),
            None => Ok(None),
        }
    }

    async fn backfill_column(
        &mut self,
        table: &str,
        column: &str,
        value: &DatabaseValue,
    ) -> StoreResult<u64> {
        let sql = pg_sql::backfill(table, column);
        self.run_bound(&sql, std::slice::from_ref(value)).await
    }

    async fn set_column_default(
        &mut self,
        table: &str,
        column: &str,
        value: &DatabaseValue,
    ) -> StoreResult<()> {
        self.run(&pg_sql::set_default(table, column, value))
            .await
            .map(|_| ())
    }

    async fn set_not_null(&mut self, table: &str, column: &str) -> StoreResult<()> {
        self.run(&pg_sql::set_not_null(table, column))
            .await
            .map(|_| ())
    }

    async fn add_foreign_key(&mut self, table: &str, foreign_key: &ForeignKeyDef) -> StoreResult<()> {
        self.run(&pg_sql::add_foreign_key(table, foreign_key))
            .await
            .map(|_| ())
    }

    async fn ensure_ledger(&mut self, table: &str) -> StoreResult<()> {
        self.run(&pg_sql::create_ledger(table)).await.map(|_| ())
    }

    async fn ledger_entries(&mut self, table: &str) -> StoreResult<Vec<LedgerEntry>> {
        let sql = pg_sql::select_ledger(table);
        let tx = self.tx()?;
        let rows = sqlx::query(&sql).fetch_all(&mut **tx).await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let version: String = row.try_get("version")?;
            let version = Version::parse(&version).map_err(|e| {
                StoreError::other(format!("Ledger table {} holds {}", table, e))
            })?;
            entries.push(LedgerEntry {
                version,
                name: row.try_get("name")?,
                applied_at: row.try_get("applied_at")?,
            });
        }

        entries.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(entries)
    }

    async fn insert_ledger_entry(&mut self, table: &str, entry: &LedgerEntry) -> StoreResult<()> {
        let sql = pg_sql::insert_ledger(table);
        let tx = self.tx()?;
        sqlx::query(&sql)
            .bind(entry.version.as_str())
            .bind(&entry.name)
            .bind(entry.applied_at)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> StoreResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| StoreError::transaction("Transaction already completed"))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::transaction(format!("Transaction commit failed: {}", e)))
    }

    async fn rollback(mut self: Box<Self>) -> StoreResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| StoreError::transaction("Transaction already completed"))?;

        tx.rollback()
            .await
            .map_err(|e| StoreError::transaction(format!("Transaction rollback failed: {}", e)))
    }
}

/// Bind a DatabaseValue to a sqlx query
fn bind_database_value<'a>(
    query: sqlx::query::Query<'a, Postgres, PgArguments>,
    value: &DatabaseValue,
) -> sqlx::query::Query<'a, Postgres, PgArguments> {
    match value {
        DatabaseValue::Null => query.bind(Option::<String>::None),
        DatabaseValue::Bool(b) => query.bind(*b),
        DatabaseValue::Int32(i) => query.bind(*i),
        DatabaseValue::Int64(i) => query.bind(*i),
        DatabaseValue::Float64(f) => query.bind(*f),
        DatabaseValue::String(s) => query.bind(s.clone()),
        DatabaseValue::DateTime(dt) => query.bind(*dt),
        DatabaseValue::Json(j) => query.bind(j.clone()),
    }
}

/// Convert a PostgreSQL column value to DatabaseValue
fn postgres_value_to_database_value(row: &PgRow, index: usize) -> StoreResult<DatabaseValue> {
    if row.try_get_raw(index)?.is_null() {
        return Ok(DatabaseValue::Null);
    }

    let type_name = row.columns()[index].type_info().name().to_string();

    let value = match type_name.as_str() {
        "BOOL" => DatabaseValue::Bool(row.try_get(index)?),
        "INT2" => DatabaseValue::Int32(i32::from(row.try_get::<i16, _>(index)?)),
        "INT4" => DatabaseValue::Int32(row.try_get(index)?),
        "INT8" => DatabaseValue::Int64(row.try_get(index)?),
        "FLOAT4" => DatabaseValue::Float64(f64::from(row.try_get::<f32, _>(index)?)),
        "FLOAT8" => DatabaseValue::Float64(row.try_get(index)?),
        "TIMESTAMPTZ" => DatabaseValue::DateTime(row.try_get(index)?),
        "TIMESTAMP" => {
            let naive: chrono::NaiveDateTime = row.try_get(index)?;
            DatabaseValue::DateTime(naive.and_utc())
        }
        "JSON" | "JSONB" => DatabaseValue::Json(row.try_get(index)?),
        _ => {
            let value: String = row.try_get(index).map_err(|e| {
                StoreError::other(format!(
                    "Failed to get value as string for unknown type '{}': {}",
                    type_name, e
                ))
            })?;
            DatabaseValue::String(value)
        }
    };

    Ok(value)
}
