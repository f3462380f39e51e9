//! In-process store
//!
//! [`MemoryStore`] keeps a small relational catalog in memory: tables with
//! typed columns, rows, primary key / unique / foreign key constraints and the
//! ledger. It enforces the same constraints PostgreSQL would for the typed
//! operations and reports the same SQLSTATE codes, so guard behaviour can be
//! exercised without a database.
//!
//! Raw SQL is not interpreted. It is appended to a journal (together with the
//! SQL the typed operations would have run) and can be made to fail with
//! [`MemoryStore::fail_on`].
//!
//! A transaction works on a copy of the catalog and publishes it on commit.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;

use super::core::*;
use super::pg_sql;
use super::DatabaseBackendType;
use crate::error::{StoreError, StoreResult};
use crate::migrations::definitions::LedgerEntry;
use crate::migrations::schema::{
    ColumnDef, ColumnInfo, ColumnType, ConstraintInfo, ConstraintKind, DefaultExpr, ForeignKeyDef,
    TableDef,
};

/// A stored row, keyed by column name
pub type MemoryRow = BTreeMap<String, DatabaseValue>;

#[derive(Debug, Clone)]
enum MemDefault {
    Serial,
    Now,
    Value(DatabaseValue),
}

#[derive(Debug, Clone)]
struct MemColumn {
    name: String,
    ty: ColumnType,
    nullable: bool,
    default: Option<MemDefault>,
}

impl MemColumn {
    fn from_def(def: &ColumnDef) -> Self {
        let default = match &def.default {
            Some(DefaultExpr::Now) => Some(MemDefault::Now),
            Some(DefaultExpr::Literal(literal)) => {
                let value = normalize(&DatabaseValue::from(literal));
                (!value.is_null()).then_some(MemDefault::Value(value))
            }
            None if def.ty.is_serial() => Some(MemDefault::Serial),
            None => None,
        };

        Self {
            name: def.name.clone(),
            ty: def.ty.clone(),
            nullable: def.nullable && !def.primary_key && !def.ty.is_serial(),
            default,
        }
    }

    fn info(&self) -> ColumnInfo {
        let default = self.default.as_ref().map(|d| match d {
            MemDefault::Serial => "nextval(sequence)".to_string(),
            MemDefault::Now => "now()".to_string(),
            MemDefault::Value(v) => pg_sql::render_literal(v),
        });

        ColumnInfo {
            name: self.name.clone(),
            data_type: self.ty.sql_type().to_lowercase(),
            nullable: self.nullable,
            default,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct MemTable {
    columns: Vec<MemColumn>,
    rows: Vec<MemoryRow>,
    constraints: Vec<ConstraintInfo>,
    next_serial: i64,
}

impl MemTable {
    fn column(&self, name: &str) -> Option<&MemColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    fn constraint(&self, name: &str) -> Option<&ConstraintInfo> {
        self.constraints.iter().find(|c| c.name == name)
    }

    fn default_for(&mut self, index: usize) -> DatabaseValue {
        match self.columns[index].default.clone() {
            Some(MemDefault::Serial) => {
                self.next_serial += 1;
                DatabaseValue::Int64(self.next_serial)
            }
            Some(MemDefault::Now) => DatabaseValue::DateTime(Utc::now()),
            Some(MemDefault::Value(v)) => v,
            None => DatabaseValue::Null,
        }
    }

    fn build_row(&mut self, values: &[(String, DatabaseValue)]) -> MemoryRow {
        let mut row = MemoryRow::new();
        for index in 0..self.columns.len() {
            let name = self.columns[index].name.clone();
            let value = match values.iter().find(|(column, _)| *column == name) {
                Some((_, value)) => normalize(value),
                None => self.default_for(index),
            };
            row.insert(name, value);
        }
        row
    }

    fn is_unique_over(&self, columns: &[String]) -> bool {
        self.constraints.iter().any(|c| {
            matches!(c.kind, ConstraintKind::PrimaryKey | ConstraintKind::Unique)
                && same_columns(&c.columns, columns)
        })
    }
}

#[derive(Debug, Clone, Default)]
struct Catalog {
    tables: BTreeMap<String, MemTable>,
    ledgers: BTreeMap<String, Vec<LedgerEntry>>,
    journal: Vec<String>,
}

impl Catalog {
    fn table(&self, name: &str) -> StoreResult<&MemTable> {
        self.tables.get(name).ok_or_else(|| undefined_table(name))
    }

    fn table_mut(&mut self, name: &str) -> StoreResult<&mut MemTable> {
        self.tables.get_mut(name).ok_or_else(|| undefined_table(name))
    }

    fn column(&self, table: &str, column: &str) -> StoreResult<&MemColumn> {
        self.table(table)?
            .column(column)
            .ok_or_else(|| undefined_column(table, column))
    }

    /// Run `f`, restoring the table if it fails so a failed statement leaves no trace
    fn atomically<T>(
        &mut self,
        table: &str,
        f: impl FnOnce(&mut Catalog) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let snapshot = self.tables.get(table).cloned();
        let result = f(self);
        if result.is_err() {
            if let Some(snapshot) = snapshot {
                self.tables.insert(table.to_string(), snapshot);
            }
        }
        result
    }

    fn create_table(&mut self, def: &TableDef) -> StoreResult<()> {
        if self.tables.contains_key(&def.name) {
            return Err(StoreError::from_sqlstate(
                "42P07",
                format!("relation \"{}\" already exists", def.name),
            ));
        }

        let mut table = MemTable::default();
        for column in &def.columns {
            if table.column(&column.name).is_some() {
                return Err(StoreError::from_sqlstate(
                    "42701",
                    format!("column \"{}\" specified more than once", column.name),
                ));
            }
            table.columns.push(MemColumn::from_def(column));
            if let Some(constraint) = column_constraint(&def.name, column) {
                table.constraints.push(constraint);
            }
        }

        if def.columns.iter().filter(|c| c.primary_key).count() > 1 {
            return Err(StoreError::from_sqlstate(
                "42P16",
                format!("multiple primary keys for table \"{}\" are not allowed", def.name),
            ));
        }

        for columns in &def.unique {
            if let Some(missing) = columns.iter().find(|c| table.column(c).is_none()) {
                return Err(undefined_column(&def.name, missing));
            }
            table.constraints.push(ConstraintInfo {
                name: format!("{}_{}_key", def.name, columns.join("_")),
                kind: ConstraintKind::Unique,
                columns: columns.clone(),
                referenced_table: None,
                referenced_columns: Vec::new(),
            });
        }

        self.tables.insert(def.name.clone(), table);
        self.journal.push(pg_sql::create_table(def));
        Ok(())
    }

    fn add_column(&mut self, table: &str, def: &ColumnDef) -> StoreResult<()> {
        if self.table(table)?.column(&def.name).is_some() {
            return Err(StoreError::from_sqlstate(
                "42701",
                format!(
                    "column \"{}\" of relation \"{}\" already exists",
                    def.name, table
                ),
            ));
        }

        self.atomically(table, |catalog| {
            let t = catalog.table_mut(table)?;
            t.columns.push(MemColumn::from_def(def));
            let index = t.columns.len() - 1;
            for row_index in 0..t.rows.len() {
                let value = t.default_for(index);
                t.rows[row_index].insert(def.name.clone(), value);
            }
            if let Some(constraint) = column_constraint(table, def) {
                t.constraints.push(constraint);
            }
            catalog.check_all_rows(table)
        })?;

        self.journal.push(pg_sql::add_column(table, def));
        Ok(())
    }

    fn insert(
        &mut self,
        table: &str,
        values: &[(String, DatabaseValue)],
        conflict_key: Option<&[String]>,
    ) -> StoreResult<u64> {
        let t = self.table(table)?;
        if let Some((column, _)) = values.iter().find(|(c, _)| t.column(c).is_none()) {
            return Err(undefined_column(table, column));
        }

        if let Some(key) = conflict_key {
            if !t.is_unique_over(key) {
                return Err(StoreError::from_sqlstate(
                    "42P10",
                    "there is no unique or exclusion constraint matching the ON CONFLICT specification",
                ));
            }

            let provided: MemoryRow = values
                .iter()
                .map(|(c, v)| (c.clone(), normalize(v)))
                .collect();
            let conflict = t.rows.iter().any(|row| {
                key.iter().all(|k| match (row.get(k), provided.get(k)) {
                    (Some(existing), Some(new)) => !existing.is_null() && existing == new,
                    _ => false,
                })
            });
            if conflict {
                return Ok(0);
            }
        }

        let row = self.table_mut(table)?.build_row(values);
        self.check_row(table, &row, None)?;
        self.table_mut(table)?.rows.push(row);
        Ok(1)
    }

    fn find_value(
        &self,
        table: &str,
        key_column: &str,
        key: &DatabaseValue,
        id_column: &str,
    ) -> StoreResult<Option<DatabaseValue>> {
        self.column(table, key_column)?;
        self.column(table, id_column)?;

        let key = normalize(key);
        Ok(self
            .table(table)?
            .rows
            .iter()
            .find(|row| row.get(key_column) == Some(&key))
            .and_then(|row| row.get(id_column).cloned()))
    }

    fn backfill(&mut self, table: &str, column: &str, value: &DatabaseValue) -> StoreResult<u64> {
        self.column(table, column)?;
        let value = normalize(value);

        let updated = self.atomically(table, |catalog| {
            let t = catalog.table_mut(table)?;
            let mut updated = 0;
            for row in t.rows.iter_mut() {
                if row.get(column).map_or(true, |v| v.is_null()) {
                    row.insert(column.to_string(), value.clone());
                    updated += 1;
                }
            }
            catalog.check_all_rows(table)?;
            Ok(updated)
        })?;

        self.journal.push(pg_sql::backfill(table, column));
        Ok(updated)
    }

    fn set_default(&mut self, table: &str, column: &str, value: &DatabaseValue) -> StoreResult<()> {
        self.column(table, column)?;
        let value = normalize(value);
        let sql = pg_sql::set_default(table, column, &value);

        let t = self.table_mut(table)?;
        if let Some(c) = t.columns.iter_mut().find(|c| c.name == column) {
            c.default = (!value.is_null()).then_some(MemDefault::Value(value));
        }

        self.journal.push(sql);
        Ok(())
    }

    fn set_not_null(&mut self, table: &str, column: &str) -> StoreResult<()> {
        self.column(table, column)?;

        let t = self.table_mut(table)?;
        if t.rows
            .iter()
            .any(|row| row.get(column).map_or(true, |v| v.is_null()))
        {
            return Err(StoreError::from_sqlstate(
                "23502",
                format!(
                    "column \"{}\" of relation \"{}\" contains null values",
                    column, table
                ),
            ));
        }
        if let Some(c) = t.columns.iter_mut().find(|c| c.name == column) {
            c.nullable = false;
        }

        self.journal.push(pg_sql::set_not_null(table, column));
        Ok(())
    }

    fn add_foreign_key(&mut self, table: &str, fk: &ForeignKeyDef) -> StoreResult<()> {
        self.column(table, &fk.column)?;
        self.column(&fk.references_table, &fk.references_column)?;

        let referenced_key = vec![fk.references_column.clone()];
        if !self.table(&fk.references_table)?.is_unique_over(&referenced_key) {
            return Err(StoreError::from_sqlstate(
                "42830",
                format!(
                    "there is no unique constraint matching given keys for referenced table \"{}\"",
                    fk.references_table
                ),
            ));
        }

        if self.table(table)?.constraint(&fk.name).is_some() {
            return Err(StoreError::from_sqlstate(
                "42710",
                format!(
                    "constraint \"{}\" for relation \"{}\" already exists",
                    fk.name, table
                ),
            ));
        }

        self.atomically(table, |catalog| {
            catalog.table_mut(table)?.constraints.push(ConstraintInfo {
                name: fk.name.clone(),
                kind: ConstraintKind::ForeignKey,
                columns: vec![fk.column.clone()],
                referenced_table: Some(fk.references_table.clone()),
                referenced_columns: referenced_key.clone(),
            });
            catalog.check_all_rows(table)
        })?;

        self.journal.push(pg_sql::add_foreign_key(table, fk));
        Ok(())
    }

    fn check_all_rows(&self, table: &str) -> StoreResult<()> {
        let t = self.table(table)?;
        for (index, row) in t.rows.iter().enumerate() {
            self.check_row(table, row, Some(index))?;
        }
        Ok(())
    }

    /// Enforce NOT NULL, unique and foreign key constraints for one row
    fn check_row(&self, table: &str, row: &MemoryRow, skip: Option<usize>) -> StoreResult<()> {
        let t = self.table(table)?;

        for column in &t.columns {
            if !column.nullable && row.get(&column.name).map_or(true, |v| v.is_null()) {
                return Err(StoreError::from_sqlstate(
                    "23502",
                    format!(
                        "null value in column \"{}\" of relation \"{}\" violates not-null constraint",
                        column.name, table
                    ),
                ));
            }
        }

        for constraint in &t.constraints {
            match constraint.kind {
                ConstraintKind::PrimaryKey | ConstraintKind::Unique => {
                    let values: Vec<&DatabaseValue> = constraint
                        .columns
                        .iter()
                        .filter_map(|c| row.get(c))
                        .collect();
                    if values.len() != constraint.columns.len() || values.iter().any(|v| v.is_null())
                    {
                        continue;
                    }
                    let duplicate = t.rows.iter().enumerate().any(|(i, other)| {
                        Some(i) != skip
                            && constraint
                                .columns
                                .iter()
                                .zip(&values)
                                .all(|(c, v)| other.get(c) == Some(*v))
                    });
                    if duplicate {
                        return Err(StoreError::from_sqlstate(
                            "23505",
                            format!(
                                "duplicate key value violates unique constraint \"{}\"",
                                constraint.name
                            ),
                        ));
                    }
                }
                ConstraintKind::ForeignKey => {
                    let (column, referenced_table, referenced_column) = match (
                        constraint.columns.first(),
                        constraint.referenced_table.as_deref(),
                        constraint.referenced_columns.first(),
                    ) {
                        (Some(c), Some(rt), Some(rc)) => (c, rt, rc),
                        _ => continue,
                    };
                    let value = match row.get(column) {
                        Some(v) if !v.is_null() => v,
                        _ => continue,
                    };
                    let present = self
                        .table(referenced_table)?
                        .rows
                        .iter()
                        .any(|r| r.get(referenced_column) == Some(value));
                    if !present {
                        return Err(StoreError::from_sqlstate(
                            "23503",
                            format!(
                                "insert or update on table \"{}\" violates foreign key constraint \"{}\"",
                                table, constraint.name
                            ),
                        ));
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn ledger(&self, table: &str) -> StoreResult<&Vec<LedgerEntry>> {
        self.ledgers.get(table).ok_or_else(|| undefined_table(table))
    }

    fn insert_ledger_entry(&mut self, table: &str, entry: &LedgerEntry) -> StoreResult<()> {
        let entries = self
            .ledgers
            .get_mut(table)
            .ok_or_else(|| undefined_table(table))?;
        if entries.iter().any(|e| e.version == entry.version) {
            return Err(StoreError::from_sqlstate(
                "23505",
                format!("duplicate key value violates unique constraint \"{}_pkey\"", table),
            ));
        }
        entries.push(entry.clone());
        Ok(())
    }
}

struct Fault {
    pattern: String,
    error: StoreError,
}

#[derive(Default)]
struct Shared {
    catalog: Catalog,
    faults: Vec<Fault>,
    locks: BTreeSet<i64>,
}

fn lock_shared(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory store; clones share the same catalog
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make raw SQL containing `pattern` fail with `error`
    pub fn fail_on(&self, pattern: &str, error: StoreError) {
        lock_shared(&self.shared).faults.push(Fault {
            pattern: pattern.to_string(),
            error,
        });
    }

    pub fn create_table(&self, def: &TableDef) -> StoreResult<()> {
        lock_shared(&self.shared).catalog.create_table(def)
    }

    pub fn insert_row(&self, table: &str, values: &[(&str, DatabaseValue)]) -> StoreResult<()> {
        let values: Vec<(String, DatabaseValue)> = values
            .iter()
            .map(|(c, v)| (c.to_string(), v.clone()))
            .collect();
        lock_shared(&self.shared)
            .catalog
            .insert(table, &values, None)
            .map(|_| ())
    }

    pub fn has_table(&self, table: &str) -> bool {
        lock_shared(&self.shared).catalog.tables.contains_key(table)
    }

    /// Committed rows of a table, empty if it does not exist
    pub fn rows(&self, table: &str) -> Vec<MemoryRow> {
        lock_shared(&self.shared)
            .catalog
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn column(&self, table: &str, column: &str) -> Option<ColumnInfo> {
        lock_shared(&self.shared)
            .catalog
            .column(table, column)
            .ok()
            .map(MemColumn::info)
    }

    pub fn constraint(&self, table: &str, name: &str) -> Option<ConstraintInfo> {
        lock_shared(&self.shared)
            .catalog
            .tables
            .get(table)
            .and_then(|t| t.constraint(name).cloned())
    }

    /// Committed statements, raw and typed, in execution order
    pub fn journal(&self) -> Vec<String> {
        lock_shared(&self.shared).catalog.journal.clone()
    }

    pub fn ledger(&self, table: &str) -> Vec<LedgerEntry> {
        lock_shared(&self.shared)
            .catalog
            .ledgers
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Write a ledger entry directly, creating the ledger if needed
    pub fn record_ledger_entry(&self, table: &str, entry: LedgerEntry) -> StoreResult<()> {
        let mut shared = lock_shared(&self.shared);
        shared.catalog.ledgers.entry(table.to_string()).or_default();
        shared.catalog.insert_ledger_entry(table, &entry)
    }

    /// Drop ledger entries; the engine itself never does this
    pub fn truncate_ledger(&self, table: &str) {
        if let Some(entries) = lock_shared(&self.shared).catalog.ledgers.get_mut(table) {
            entries.clear();
        }
    }
}

#[async_trait]
impl MigrationStore for MemoryStore {
    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::Memory
    }

    async fn begin_transaction(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        let working = lock_shared(&self.shared).catalog.clone();
        Ok(Box::new(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            working,
            savepoints: Vec::new(),
        }))
    }

    /// Fails instead of waiting when the key is held
    async fn lock(&self, key: i64) -> StoreResult<()> {
        if lock_shared(&self.shared).locks.insert(key) {
            Ok(())
        } else {
            Err(StoreError::other(format!("advisory lock {} is held", key)))
        }
    }

    async fn unlock(&self, key: i64) -> StoreResult<()> {
        if lock_shared(&self.shared).locks.remove(&key) {
            Ok(())
        } else {
            Err(StoreError::other(format!("advisory lock {} is not held", key)))
        }
    }

    async fn close(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Transaction over a private copy of the catalog
pub struct MemoryTransaction {
    shared: Arc<Mutex<Shared>>,
    working: Catalog,
    savepoints: Vec<(String, Catalog)>,
}

impl MemoryTransaction {
    fn savepoint_position(&self, name: &str) -> StoreResult<usize> {
        self.savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| {
                StoreError::from_sqlstate("3B001", format!("savepoint \"{}\" does not exist", name))
            })
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn execute(&mut self, sql: &str, _params: &[DatabaseValue]) -> StoreResult<u64> {
        let fault = lock_shared(&self.shared)
            .faults
            .iter()
            .find(|f| sql.contains(&f.pattern))
            .map(|f| f.error.clone());
        if let Some(error) = fault {
            return Err(error);
        }
        self.working.journal.push(sql.trim().to_string());
        Ok(0)
    }

    async fn savepoint(&mut self, name: &str) -> StoreResult<()> {
        self.savepoints
            .push((name.to_string(), self.working.clone()));
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> StoreResult<()> {
        let position = self.savepoint_position(name)?;
        self.working = self.savepoints[position].1.clone();
        self.savepoints.truncate(position + 1);
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> StoreResult<()> {
        let position = self.savepoint_position(name)?;
        self.savepoints.truncate(position);
        Ok(())
    }

    async fn table_exists(&mut self, table: &str) -> StoreResult<bool> {
        Ok(self.working.tables.contains_key(table))
    }

    async fn column_info(&mut self, table: &str, column: &str) -> StoreResult<Option<ColumnInfo>> {
        Ok(self
            .working
            .tables
            .get(table)
            .and_then(|t| t.column(column))
            .map(MemColumn::info))
    }

    async fn constraint_info(
        &mut self,
        table: &str,
        name: &str,
    ) -> StoreResult<Option<ConstraintInfo>> {
        Ok(self
            .working
            .tables
            .get(table)
            .and_then(|t| t.constraint(name).cloned()))
    }

    async fn create_table(&mut self, table: &TableDef) -> StoreResult<()> {
        self.working.create_table(table)
    }

    async fn add_column(&mut self, table: &str, column: &ColumnDef) -> StoreResult<()> {
        self.working.add_column(table, column)
    }

    async fn insert_if_absent(
        &mut self,
        table: &str,
        key: &[String],
        values: &[(String, DatabaseValue)],
    ) -> StoreResult<u64> {
        let inserted = self.working.insert(table, values, Some(key))?;
        let columns: Vec<String> = values.iter().map(|(c, _)| c.clone()).collect();
        self.working
            .journal
            .push(pg_sql::insert_if_absent(table, key, &columns));
        Ok(inserted)
    }

    async fn find_value(
        &mut self,
        table: &str,
        key_column: &str,
        key: &DatabaseValue,
        id_column: &str,
    ) -> StoreResult<Option<DatabaseValue>> {
        self.working.find_value(table, key_column, key, id_column)
    }

    async fn backfill_column(
        &mut self,
        table: &str,
        column: &str,
        value: &DatabaseValue,
    ) -> StoreResult<u64> {
        self.working.backfill(table, column, value)
    }

    async fn set_column_default(
        &mut self,
        table: &str,
        column: &str,
        value: &DatabaseValue,
    ) -> StoreResult<()> {
        self.working.set_default(table, column, value)
    }

    async fn set_not_null(&mut self, table: &str, column: &str) -> StoreResult<()> {
        self.working.set_not_null(table, column)
    }

    async fn add_foreign_key(&mut self, table: &str, foreign_key: &ForeignKeyDef) -> StoreResult<()> {
        self.working.add_foreign_key(table, foreign_key)
    }

    async fn ensure_ledger(&mut self, table: &str) -> StoreResult<()> {
        self.working.ledgers.entry(table.to_string()).or_default();
        Ok(())
    }

    async fn ledger_entries(&mut self, table: &str) -> StoreResult<Vec<LedgerEntry>> {
        let mut entries = self.working.ledger(table)?.clone();
        entries.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(entries)
    }

    async fn insert_ledger_entry(&mut self, table: &str, entry: &LedgerEntry) -> StoreResult<()> {
        self.working.insert_ledger_entry(table, entry)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTransaction { shared, working, .. } = *self;
        lock_shared(&shared).catalog = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}

fn normalize(value: &DatabaseValue) -> DatabaseValue {
    match value {
        DatabaseValue::Int32(i) => DatabaseValue::Int64(i64::from(*i)),
        other => other.clone(),
    }
}

fn same_columns(a: &[String], b: &[String]) -> bool {
    let a: BTreeSet<&String> = a.iter().collect();
    let b: BTreeSet<&String> = b.iter().collect();
    a == b
}

fn column_constraint(table: &str, column: &ColumnDef) -> Option<ConstraintInfo> {
    let (name, kind) = if column.primary_key {
        (format!("{}_pkey", table), ConstraintKind::PrimaryKey)
    } else if column.unique {
        (format!("{}_{}_key", table, column.name), ConstraintKind::Unique)
    } else {
        return None;
    };

    Some(ConstraintInfo {
        name,
        kind,
        columns: vec![column.name.clone()],
        referenced_table: None,
        referenced_columns: Vec::new(),
    })
}

fn undefined_table(table: &str) -> StoreError {
    StoreError::from_sqlstate("42P01", format!("relation \"{}\" does not exist", table))
}

fn undefined_column(table: &str, column: &str) -> StoreError {
    StoreError::from_sqlstate(
        "42703",
        format!("column \"{}\" of relation \"{}\" does not exist", column, table),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreErrorKind;

    fn suppliers() -> TableDef {
        TableDef::new("suppliers")
            .column(ColumnDef::new("id", ColumnType::BigSerial).primary_key())
            .column(ColumnDef::new("supplier_code", ColumnType::Text).not_null().unique())
            .column(ColumnDef::new("name", ColumnType::Text).not_null())
    }

    fn products() -> TableDef {
        TableDef::new("products")
            .column(ColumnDef::new("id", ColumnType::BigSerial).primary_key())
            .column(ColumnDef::new("sku", ColumnType::Text).not_null())
    }

    #[test]
    fn test_create_table_twice_is_duplicate_table() {
        let store = MemoryStore::new();
        store.create_table(&suppliers()).unwrap();
        let err = store.create_table(&suppliers()).unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::DuplicateTable);
        assert_eq!(err.code.as_deref(), Some("42P07"));
    }

    #[test]
    fn test_serial_and_unique_enforcement() {
        let store = MemoryStore::new();
        store.create_table(&suppliers()).unwrap();
        store
            .insert_row("suppliers", &[("supplier_code", "acme".into()), ("name", "Acme".into())])
            .unwrap();
        store
            .insert_row("suppliers", &[("supplier_code", "globex".into()), ("name", "Globex".into())])
            .unwrap();

        let rows = store.rows("suppliers");
        assert_eq!(rows[0]["id"], DatabaseValue::Int64(1));
        assert_eq!(rows[1]["id"], DatabaseValue::Int64(2));

        let err = store
            .insert_row("suppliers", &[("supplier_code", "acme".into()), ("name", "Again".into())])
            .unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::UniqueViolation);

        let err = store
            .insert_row("suppliers", &[("supplier_code", "nameless".into())])
            .unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::NotNullViolation);
    }

    #[tokio::test]
    async fn test_insert_if_absent_never_overwrites() {
        let store = MemoryStore::new();
        store.create_table(&suppliers()).unwrap();

        let mut tx = store.begin_transaction().await.unwrap();
        let key = vec!["supplier_code".to_string()];
        let first = vec![
            ("supplier_code".to_string(), DatabaseValue::from("unknown")),
            ("name".to_string(), DatabaseValue::from("Unknown supplier")),
        ];
        let second = vec![
            ("supplier_code".to_string(), DatabaseValue::from("unknown")),
            ("name".to_string(), DatabaseValue::from("Renamed")),
        ];
        assert_eq!(tx.insert_if_absent("suppliers", &key, &first).await.unwrap(), 1);
        assert_eq!(tx.insert_if_absent("suppliers", &key, &second).await.unwrap(), 0);
        tx.commit().await.unwrap();

        let rows = store.rows("suppliers");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], DatabaseValue::from("Unknown supplier"));
    }

    #[tokio::test]
    async fn test_foreign_key_rejects_orphans_and_duplicates() {
        let store = MemoryStore::new();
        store.create_table(&suppliers()).unwrap();
        store.create_table(&products()).unwrap();
        store
            .insert_row("suppliers", &[("supplier_code", "unknown".into()), ("name", "U".into())])
            .unwrap();
        store.insert_row("products", &[("sku", "A-1".into())]).unwrap();

        let fk = ForeignKeyDef::new("fk_products_supplier_id", "supplier_id", "suppliers", "id");
        let mut tx = store.begin_transaction().await.unwrap();
        tx.add_column("products", &ColumnDef::new("supplier_id", ColumnType::BigInt))
            .await
            .unwrap();
        tx.backfill_column("products", "supplier_id", &DatabaseValue::Int64(99))
            .await
            .unwrap();
        let err = tx.add_foreign_key("products", &fk).await.unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::ForeignKeyViolation);
        assert!(tx.constraint_info("products", &fk.name).await.unwrap().is_none());
        tx.rollback().await.unwrap();

        assert!(store.column("products", "supplier_id").is_none());

        let mut tx = store.begin_transaction().await.unwrap();
        tx.add_column("products", &ColumnDef::new("supplier_id", ColumnType::BigInt))
            .await
            .unwrap();
        tx.backfill_column("products", "supplier_id", &DatabaseValue::Int64(1))
            .await
            .unwrap();
        tx.add_foreign_key("products", &fk).await.unwrap();
        let err = tx.add_foreign_key("products", &fk).await.unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::DuplicateObject);
        tx.commit().await.unwrap();

        let err = store
            .insert_row("products", &[("sku", "B-2".into()), ("supplier_id", 7i64.into())])
            .unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::ForeignKeyViolation);
    }

    #[tokio::test]
    async fn test_savepoint_rollback_restores_state() {
        let store = MemoryStore::new();
        let mut tx = store.begin_transaction().await.unwrap();
        tx.create_table(&suppliers()).await.unwrap();
        tx.savepoint("sp").await.unwrap();
        tx.execute("CREATE INDEX idx ON suppliers (name)", &[])
            .await
            .unwrap();
        tx.create_table(&products()).await.unwrap();
        tx.rollback_to_savepoint("sp").await.unwrap();
        tx.release_savepoint("sp").await.unwrap();
        assert!(tx.table_exists("suppliers").await.unwrap());
        assert!(!tx.table_exists("products").await.unwrap());
        tx.commit().await.unwrap();

        assert_eq!(store.journal().len(), 1);
        assert!(store.journal()[0].starts_with("CREATE TABLE \"suppliers\""));
    }

    #[tokio::test]
    async fn test_fault_injection_and_uncommitted_work() {
        let store = MemoryStore::new();
        store.fail_on("boom", StoreError::from_sqlstate("22012", "division by zero"));

        let mut tx = store.begin_transaction().await.unwrap();
        tx.execute("SELECT 1", &[]).await.unwrap();
        let err = tx.execute("SELECT boom()", &[]).await.unwrap_err();
        assert_eq!(err.code.as_deref(), Some("22012"));
        tx.rollback().await.unwrap();

        assert!(store.journal().is_empty());
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let store = MemoryStore::new();
        store.lock(7).await.unwrap();
        assert!(store.lock(7).await.is_err());
        store.unlock(7).await.unwrap();
        assert!(store.unlock(7).await.is_err());
        store.lock(7).await.unwrap();
    }
}
