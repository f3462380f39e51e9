//! Version ledger
//!
//! The ledger is an append-only table of applied versions living in the same
//! store as the schema it describes. Entries are written in the unit's own
//! transaction, so a version is recorded exactly when its statements commit.

use std::collections::BTreeSet;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::definitions::{LedgerEntry, Version};
use crate::backends::StoreTransaction;
use crate::error::{DuplicateVersionError, MigrateResult, MigrationError, StoreErrorKind};

/// Default ledger table name
pub const DEFAULT_LEDGER_TABLE: &str = "_strata_migrations";

/// Reads and appends ledger entries
///
/// Remembers every version it has seen applied, so a ledger that shrinks
/// underneath a running process is reported instead of silently re-applying.
#[derive(Debug)]
pub struct VersionLedger {
    table: String,
    seen: Mutex<BTreeSet<Version>>,
}

impl Default for VersionLedger {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_TABLE)
    }
}

impl VersionLedger {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            seen: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Applied versions, creating the ledger on first use
    pub async fn get_applied(
        &self,
        tx: &mut dyn StoreTransaction,
    ) -> MigrateResult<BTreeSet<Version>> {
        let applied: BTreeSet<Version> = self
            .entries(tx)
            .await?
            .into_iter()
            .map(|entry| entry.version)
            .collect();

        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        let missing: Vec<Version> = seen.difference(&applied).cloned().collect();
        if !missing.is_empty() {
            return Err(MigrationError::LedgerRegression { missing });
        }
        seen.extend(applied.iter().cloned());

        Ok(applied)
    }

    /// Every entry, ordered by version
    pub async fn entries(&self, tx: &mut dyn StoreTransaction) -> MigrateResult<Vec<LedgerEntry>> {
        tx.ensure_ledger(&self.table).await?;
        Ok(tx.ledger_entries(&self.table).await?)
    }

    /// Append an entry in the caller's transaction
    pub async fn record_applied(
        &self,
        tx: &mut dyn StoreTransaction,
        version: &Version,
        name: &str,
        applied_at: DateTime<Utc>,
    ) -> MigrateResult<LedgerEntry> {
        let entry = LedgerEntry {
            version: version.clone(),
            name: name.to_string(),
            applied_at,
        };

        match tx.insert_ledger_entry(&self.table, &entry).await {
            Ok(()) => {
                debug!(version = %version, table = %self.table, "Recorded ledger entry");
                Ok(entry)
            }
            Err(e) if e.kind == StoreErrorKind::UniqueViolation => {
                Err(DuplicateVersionError {
                    version: version.clone(),
                }
                .into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Note a version whose transaction committed
    pub fn mark_committed(&self, version: &Version) {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(version.clone());
    }
}
