//! Migration Runner - Applies pending units against a store
//!
//! Resolves which units are pending by comparing the source with the ledger,
//! then applies them strictly in version order. Each unit and its ledger entry
//! share one transaction; the first failure rolls that transaction back and
//! stops the run, leaving later units unattempted.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, warn};

use super::definitions::{
    MigrationStatus, MigrationStatusLine, MigrationUnit, RunReport, RunState, UnitReport, Version,
};
use super::executor::StatementExecutor;
use super::guard::GuardPolicy;
use super::ledger::VersionLedger;
use super::source::MigrationSource;
use crate::backends::{MigrationStore, StoreTransaction};
use crate::error::{MigrateResult, RunError};

/// Limits and coordination for a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Advisory lock held for the whole run, so concurrent runners serialize
    pub lock_key: Option<i64>,
    /// Apply at most this many units
    pub max_units: Option<usize>,
    /// Start no new unit once this much time has passed
    pub deadline: Option<Duration>,
}

impl RunOptions {
    pub fn with_lock(mut self, key: i64) -> Self {
        self.lock_key = Some(key);
        self
    }

    pub fn with_max_units(mut self, max_units: usize) -> Self {
        self.max_units = Some(max_units);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Applies migration units from a source to a store
pub struct MigrationRunner {
    source: Box<dyn MigrationSource>,
    store: Arc<dyn MigrationStore>,
    ledger: VersionLedger,
    executor: StatementExecutor,
    options: RunOptions,
    state: Mutex<RunState>,
}

impl MigrationRunner {
    pub fn new(source: Box<dyn MigrationSource>, store: Arc<dyn MigrationStore>) -> Self {
        Self {
            source,
            store,
            ledger: VersionLedger::default(),
            executor: StatementExecutor::default(),
            options: RunOptions::default(),
            state: Mutex::new(RunState::Idle),
        }
    }

    pub fn with_ledger_table(mut self, table: impl Into<String>) -> Self {
        self.ledger = VersionLedger::new(table);
        self
    }

    pub fn with_guard_policy(mut self, guard: GuardPolicy) -> Self {
        self.executor = StatementExecutor::new(guard);
        self
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn ledger(&self) -> &VersionLedger {
        &self.ledger
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Current lifecycle state
    pub fn state(&self) -> RunState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_state(&self, state: RunState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Apply every pending unit in version order
    pub async fn run(&self) -> Result<RunReport, RunError> {
        let start_time = Instant::now();

        if let Some(key) = self.options.lock_key {
            self.store.lock(key).await.map_err(|e| self.abort(RunError::outside(e)))?;
            info!(key, "Acquired migration lock");
        }

        let result = self.run_pending(start_time).await;

        if let Some(key) = self.options.lock_key {
            if let Err(e) = self.store.unlock(key).await {
                warn!(key, error = %e, "Failed to release migration lock");
            }
        }

        result
    }

    async fn run_pending(&self, start_time: Instant) -> Result<RunReport, RunError> {
        self.set_state(RunState::Resolving);

        let units = self
            .source
            .list_units()
            .await
            .map_err(|e| self.abort(RunError::outside(e)))?;
        let applied = self
            .applied_versions()
            .await
            .map_err(|e| self.abort(RunError::outside(e)))?;

        let pending = pending_units(units.clone(), &applied);
        let mut report = RunReport {
            skipped_count: units.len() - pending.len(),
            ..RunReport::default()
        };

        if pending.is_empty() {
            info!("No pending migrations");
        }

        for (index, unit) in pending.iter().enumerate() {
            if let Some(reason) = self.limit_reached(index, start_time) {
                report.remaining_count = pending.len() - index;
                info!(remaining = report.remaining_count, reason, "Stopping before next migration");
                break;
            }

            self.set_state(RunState::Applying {
                index,
                version: unit.version().clone(),
            });
            info!(version = %unit.version(), name = unit.name(), "Applying migration");

            let unit_report = self
                .apply_unit(unit)
                .await
                .map_err(|e| self.abort(RunError::at(unit.version(), unit.name(), e)))?;

            info!(
                version = %unit.version(),
                created = unit_report.execution.created_count(),
                already_existed = unit_report.execution.already_existed_count(),
                execution_time_ms = (unit_report.execution_time_ms as u64),
                "Applied migration"
            );

            report.applied.push(unit.version().clone());
            report.reports.push(unit_report);
        }

        report.applied_count = report.applied.len();
        report.execution_time_ms = start_time.elapsed().as_millis();
        self.set_state(RunState::Committed);

        Ok(report)
    }

    fn limit_reached(&self, applied_so_far: usize, start_time: Instant) -> Option<&'static str> {
        if matches!(self.options.max_units, Some(max) if applied_so_far >= max) {
            return Some("unit limit reached");
        }
        if matches!(self.options.deadline, Some(deadline) if start_time.elapsed() >= deadline) {
            return Some("deadline passed");
        }
        None
    }

    /// Run one unit and its ledger entry in a single transaction
    async fn apply_unit(&self, unit: &MigrationUnit) -> MigrateResult<UnitReport> {
        let start_time = Instant::now();
        let mut tx = self.store.begin_transaction().await?;

        let execution = match self.executor.execute(unit, tx.as_mut()).await {
            Ok(execution) => execution,
            Err(e) => {
                rollback(tx, unit.version()).await;
                return Err(e.into());
            }
        };

        if let Err(e) = self
            .ledger
            .record_applied(tx.as_mut(), unit.version(), unit.name(), Utc::now())
            .await
        {
            rollback(tx, unit.version()).await;
            return Err(e);
        }

        tx.commit().await?;
        self.ledger.mark_committed(unit.version());

        Ok(UnitReport {
            version: unit.version().clone(),
            name: unit.name().to_string(),
            execution,
            execution_time_ms: start_time.elapsed().as_millis(),
        })
    }

    fn abort(&self, error: RunError) -> RunError {
        self.set_state(RunState::Aborted);
        error
    }

    async fn applied_versions(&self) -> MigrateResult<BTreeSet<Version>> {
        let mut tx = self.store.begin_transaction().await?;
        match self.ledger.get_applied(tx.as_mut()).await {
            Ok(applied) => {
                tx.commit().await?;
                Ok(applied)
            }
            Err(e) => {
                if let Err(rollback_error) = tx.rollback().await {
                    warn!(error = %rollback_error, "Failed to roll back ledger read");
                }
                Err(e)
            }
        }
    }

    /// Every known version with its state, orphaned ledger entries included
    pub async fn status(&self) -> MigrateResult<Vec<MigrationStatusLine>> {
        let units = self.source.list_units().await?;

        let mut tx = self.store.begin_transaction().await?;
        let entries = self.ledger.entries(tx.as_mut()).await;
        tx.rollback().await?;

        let mut recorded: BTreeMap<Version, _> = entries?
            .into_iter()
            .map(|entry| (entry.version.clone(), entry))
            .collect();

        let mut lines: Vec<MigrationStatusLine> = units
            .iter()
            .map(|unit| {
                let status = match recorded.remove(unit.version()) {
                    Some(entry) => MigrationStatus::Applied {
                        applied_at: entry.applied_at,
                    },
                    None => MigrationStatus::Pending,
                };
                MigrationStatusLine {
                    version: unit.version().clone(),
                    name: unit.name().to_string(),
                    status,
                }
            })
            .collect();

        lines.extend(recorded.into_values().map(|entry| MigrationStatusLine {
            version: entry.version,
            name: entry.name,
            status: MigrationStatus::Orphaned {
                applied_at: entry.applied_at,
            },
        }));
        lines.sort_by(|a, b| a.version.cmp(&b.version));

        Ok(lines)
    }

    /// Units a run would apply, in order, without changing anything
    pub async fn plan(&self) -> MigrateResult<Vec<MigrationUnit>> {
        let units = self.source.list_units().await?;
        let applied = self.applied_versions().await?;
        Ok(pending_units(units, &applied))
    }
}

fn pending_units(units: Vec<MigrationUnit>, applied: &BTreeSet<Version>) -> Vec<MigrationUnit> {
    let mut pending: Vec<MigrationUnit> = units
        .into_iter()
        .filter(|unit| !applied.contains(unit.version()))
        .collect();
    pending.sort_by(|a, b| a.version().cmp(b.version()));
    pending
}

async fn rollback(tx: Box<dyn StoreTransaction>, version: &Version) {
    if let Err(e) = tx.rollback().await {
        warn!(version = %version, error = %e, "Failed to roll back migration transaction");
    }
}

impl std::fmt::Debug for MigrationRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationRunner")
            .field("source", &self.source.describe())
            .field("backend", &self.store.backend_type())
            .field("ledger", &self.ledger.table())
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryStore;
    use crate::migrations::definitions::Statement;
    use crate::migrations::source::StaticSource;

    fn sql_unit(version: &str, sql: &str) -> MigrationUnit {
        MigrationUnit::new(
            Version::parse(version).unwrap(),
            format!("unit {}", version),
            vec![Statement::Sql(sql.to_string())],
        )
    }

    fn runner(store: &MemoryStore, units: Vec<MigrationUnit>) -> MigrationRunner {
        let source = StaticSource::new(units).unwrap();
        MigrationRunner::new(Box::new(source), Arc::new(store.clone()))
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let store = MemoryStore::new();
        let runner = runner(&store, vec![sql_unit("1", "SELECT 1")]);
        assert_eq!(runner.state(), RunState::Idle);

        runner.run().await.unwrap();
        assert_eq!(runner.state(), RunState::Committed);

        store.fail_on("SELECT 2", crate::error::StoreError::other("boom"));
        let failing = self::runner(&store, vec![sql_unit("2", "SELECT 2")]);
        failing.run().await.unwrap_err();
        assert_eq!(failing.state(), RunState::Aborted);
    }

    #[tokio::test]
    async fn test_deadline_of_zero_applies_nothing() {
        let store = MemoryStore::new();
        let runner = runner(&store, vec![sql_unit("1", "SELECT 1"), sql_unit("2", "SELECT 2")])
            .with_options(RunOptions::default().with_deadline(Duration::ZERO));

        let report = runner.run().await.unwrap();
        assert_eq!(report.applied_count, 0);
        assert_eq!(report.remaining_count, 2);
        assert!(store.ledger(crate::migrations::ledger::DEFAULT_LEDGER_TABLE).is_empty());
    }

    #[tokio::test]
    async fn test_custom_ledger_table() {
        let store = MemoryStore::new();
        let runner = runner(&store, vec![sql_unit("1", "SELECT 1")]).with_ledger_table("schema_log");

        runner.run().await.unwrap();
        assert_eq!(store.ledger("schema_log").len(), 1);
        assert!(store.ledger(crate::migrations::ledger::DEFAULT_LEDGER_TABLE).is_empty());
    }
}
