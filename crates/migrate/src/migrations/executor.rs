//! Statement executor
//!
//! Runs the statements of one unit, in order, inside the transaction the
//! runner opened for it. Guarded statements run under a savepoint so that a
//! tolerated failure ("already exists") can be undone without poisoning the
//! rest of the transaction. The first fatal failure stops the unit.

use tracing::{debug, warn};

use super::definitions::{
    AddColumn, AddForeignKey, ColumnRef, ColumnValue, MigrationUnit, RowLookup, SeedRow,
    Statement, ValueRef,
};
use super::guard::{GuardKind, GuardOutcome, GuardPolicy, RawConstraint};
use super::schema::TableDef;
use crate::backends::{DatabaseValue, StoreTransaction};
use crate::error::{ExecutionError, LookupMustExistError, StatementFailure, StoreError};

/// What one statement did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementReport {
    pub index: usize,
    pub kind: &'static str,
    pub outcome: GuardOutcome,
    /// Rows inserted or updated, where the statement reports it
    pub rows_affected: u64,
}

/// Per-statement outcomes of one unit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    pub statements: Vec<StatementReport>,
}

impl ExecutionReport {
    pub fn created_count(&self) -> usize {
        self.count(|o| *o == GuardOutcome::Created)
    }

    pub fn already_existed_count(&self) -> usize {
        self.count(|o| *o == GuardOutcome::AlreadyExisted)
    }

    pub fn rows_affected(&self) -> u64 {
        self.statements.iter().map(|s| s.rows_affected).sum()
    }

    fn count(&self, f: impl Fn(&GuardOutcome) -> bool) -> usize {
        self.statements.iter().filter(|s| f(&s.outcome)).count()
    }
}

type StepResult = Result<(GuardOutcome, u64), StatementFailure>;

/// Executes the statements of a unit against an open transaction
#[derive(Debug, Clone, Copy, Default)]
pub struct StatementExecutor {
    guard: GuardPolicy,
}

impl StatementExecutor {
    pub fn new(guard: GuardPolicy) -> Self {
        Self { guard }
    }

    pub fn guard(&self) -> &GuardPolicy {
        &self.guard
    }

    /// Execute every statement of `unit`; the caller commits or rolls back
    pub async fn execute(
        &self,
        unit: &MigrationUnit,
        tx: &mut dyn StoreTransaction,
    ) -> Result<ExecutionReport, ExecutionError> {
        let mut report = ExecutionReport::default();

        for (index, statement) in unit.statements().iter().enumerate() {
            let (outcome, rows_affected) = self
                .execute_statement(index, statement, tx)
                .await
                .map_err(|cause| ExecutionError {
                    statement_index: index,
                    cause,
                })?;

            debug!(
                version = %unit.version(),
                index,
                kind = statement.kind(),
                outcome = %outcome,
                rows_affected,
                "Statement executed"
            );

            report.statements.push(StatementReport {
                index,
                kind: statement.kind(),
                outcome,
                rows_affected,
            });
        }

        Ok(report)
    }

    async fn execute_statement(
        &self,
        index: usize,
        statement: &Statement,
        tx: &mut dyn StoreTransaction,
    ) -> StepResult {
        match statement {
            Statement::Sql(sql) => self.sql(index, sql, tx).await,
            Statement::CreateTable(table) => self.create_table(index, table, tx).await,
            Statement::AddColumn(add) => self.add_column(index, add, tx).await,
            Statement::SeedRow(seed) => self.seed_row(index, seed, tx).await,
            Statement::RequireRow(lookup) => {
                resolve_lookup(lookup, tx).await?;
                Ok((GuardOutcome::AlreadyExisted, 0))
            }
            Statement::Backfill(cv) => self.backfill(cv, tx).await,
            Statement::SetDefault(cv) => self.set_default(cv, tx).await,
            Statement::SetNotNull(col) => self.set_not_null(col, tx).await,
            Statement::AddForeignKey(fk) => self.add_foreign_key(index, fk, tx).await,
        }
    }

    async fn sql(&self, index: usize, sql: &str, tx: &mut dyn StoreTransaction) -> StepResult {
        match self.guard.classify_sql(sql) {
            Some(kind) => {
                let savepoint = savepoint_name(index);
                tx.savepoint(&savepoint).await?;
                let result = tx.execute(sql, &[]).await;
                let settled = self.settle(tx, &savepoint, kind, result).await?;
                if kind == GuardKind::Constraint && settled.0 == GuardOutcome::AlreadyExisted {
                    return self.existing_raw_constraint(sql, tx).await;
                }
                Ok(settled)
            }
            None => {
                let rows = tx.execute(sql, &[]).await?;
                Ok((GuardOutcome::Created, rows))
            }
        }
    }

    /// Judge the constraint a raw `ADD CONSTRAINT` collided with
    async fn existing_raw_constraint(
        &self,
        sql: &str,
        tx: &mut dyn StoreTransaction,
    ) -> StepResult {
        let raw = RawConstraint::parse(sql);
        let found = match &raw {
            Some(raw) => tx.constraint_info(&raw.table, &raw.name).await?,
            None => None,
        };
        let outcome = self
            .guard
            .on_existing_raw_constraint(sql, raw.as_ref(), found.as_ref())?;
        Ok((outcome, 0))
    }

    async fn create_table(
        &self,
        index: usize,
        table: &TableDef,
        tx: &mut dyn StoreTransaction,
    ) -> StepResult {
        if tx.table_exists(&table.name).await? {
            return Ok((self.guard.on_existing_object(GuardKind::Additive), 0));
        }
        let savepoint = savepoint_name(index);
        tx.savepoint(&savepoint).await?;
        let result = tx.create_table(table).await.map(|_| 0);
        self.settle(tx, &savepoint, GuardKind::Additive, result).await
    }

    async fn add_column(
        &self,
        index: usize,
        add: &AddColumn,
        tx: &mut dyn StoreTransaction,
    ) -> StepResult {
        if tx.column_info(&add.table, &add.column.name).await?.is_some() {
            return Ok((self.guard.on_existing_object(GuardKind::Additive), 0));
        }
        let savepoint = savepoint_name(index);
        tx.savepoint(&savepoint).await?;
        let result = tx.add_column(&add.table, &add.column).await.map(|_| 0);
        self.settle(tx, &savepoint, GuardKind::Additive, result).await
    }

    async fn seed_row(
        &self,
        index: usize,
        seed: &SeedRow,
        tx: &mut dyn StoreTransaction,
    ) -> StepResult {
        let values: Vec<(String, DatabaseValue)> = seed
            .values
            .iter()
            .map(|(column, literal)| (column.clone(), DatabaseValue::from(literal)))
            .collect();

        let savepoint = savepoint_name(index);
        tx.savepoint(&savepoint).await?;
        let result = tx.insert_if_absent(&seed.table, &seed.key, &values).await;
        match self.settle(tx, &savepoint, GuardKind::Seed, result).await? {
            (GuardOutcome::Created, 0) => Ok((GuardOutcome::AlreadyExisted, 0)),
            settled => Ok(settled),
        }
    }

    async fn backfill(&self, cv: &ColumnValue, tx: &mut dyn StoreTransaction) -> StepResult {
        let value = resolve_value(&cv.value, tx).await?;
        let rows = tx.backfill_column(&cv.table, &cv.column, &value).await?;
        let outcome = if rows == 0 {
            GuardOutcome::AlreadyExisted
        } else {
            GuardOutcome::Created
        };
        Ok((outcome, rows))
    }

    async fn set_default(&self, cv: &ColumnValue, tx: &mut dyn StoreTransaction) -> StepResult {
        let value = resolve_value(&cv.value, tx).await?;
        tx.set_column_default(&cv.table, &cv.column, &value).await?;
        Ok((GuardOutcome::Created, 0))
    }

    async fn set_not_null(&self, col: &ColumnRef, tx: &mut dyn StoreTransaction) -> StepResult {
        let info = tx.column_info(&col.table, &col.column).await?;
        if matches!(info, Some(ref c) if !c.nullable) {
            return Ok((GuardOutcome::AlreadyExisted, 0));
        }
        tx.set_not_null(&col.table, &col.column).await?;
        Ok((GuardOutcome::Created, 0))
    }

    async fn add_foreign_key(
        &self,
        index: usize,
        fk: &AddForeignKey,
        tx: &mut dyn StoreTransaction,
    ) -> StepResult {
        if let Some(existing) = tx.constraint_info(&fk.table, &fk.constraint.name).await? {
            let outcome = self
                .guard
                .on_existing_constraint(&fk.table, &fk.constraint, &existing)?;
            return Ok((outcome, 0));
        }
        let savepoint = savepoint_name(index);
        tx.savepoint(&savepoint).await?;
        let result = tx.add_foreign_key(&fk.table, &fk.constraint).await.map(|_| 0);
        self.settle(tx, &savepoint, GuardKind::Constraint, result).await
    }

    /// Release the savepoint on success, undo to it on a tolerated failure
    async fn settle(
        &self,
        tx: &mut dyn StoreTransaction,
        savepoint: &str,
        kind: GuardKind,
        result: Result<u64, StoreError>,
    ) -> StepResult {
        match result {
            Ok(rows) => {
                tx.release_savepoint(savepoint).await?;
                Ok((GuardOutcome::Created, rows))
            }
            Err(error) => match self.guard.classify_failure(kind, &error) {
                GuardOutcome::Failed(error) => Err(error.into()),
                outcome => {
                    warn!(error = %error, "Tolerating failure of guarded statement");
                    tx.rollback_to_savepoint(savepoint).await?;
                    tx.release_savepoint(savepoint).await?;
                    Ok((outcome, 0))
                }
            },
        }
    }
}

fn savepoint_name(index: usize) -> String {
    format!("strata_guard_{}", index)
}

async fn resolve_value(
    value: &ValueRef,
    tx: &mut dyn StoreTransaction,
) -> Result<DatabaseValue, StatementFailure> {
    match value {
        ValueRef::Literal(literal) => Ok(DatabaseValue::from(literal)),
        ValueRef::Lookup(lookup) => resolve_lookup(lookup, tx).await,
    }
}

/// Read the looked-up value; a missing row or NULL value is fatal
async fn resolve_lookup(
    lookup: &RowLookup,
    tx: &mut dyn StoreTransaction,
) -> Result<DatabaseValue, StatementFailure> {
    let key = DatabaseValue::from(&lookup.key);
    match tx
        .find_value(&lookup.table, &lookup.key_column, &key, &lookup.id_column)
        .await?
    {
        Some(value) if !value.is_null() => Ok(value),
        _ => Err(LookupMustExistError {
            table: lookup.table.clone(),
            key_column: lookup.key_column.clone(),
            key: lookup.key.to_string(),
        }
        .into()),
    }
}
