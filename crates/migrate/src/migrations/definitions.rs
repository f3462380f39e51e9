//! Migration Definitions - Core types and structures for migrations
//!
//! Defines the fundamental types used throughout the migration system:
//! versions and their ordering, migration units and their statements, ledger
//! entries and the reports produced by a run.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::executor::ExecutionReport;
use super::schema::{ColumnDef, ForeignKeyDef, TableDef};
use crate::backends::DatabaseValue;
use crate::error::SourceLoadError;
use crate::security::validate_identifier;

/// Ordered identifier of a migration unit
///
/// Versions made only of digits (underscores allowed, so `20240101_120000`
/// qualifies) compare numerically. Anything else sorts after all numeric
/// versions and compares lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(String);

impl Version {
    pub fn parse(raw: &str) -> Result<Self, SourceLoadError> {
        let valid = !raw.is_empty()
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(SourceLoadError::InvalidVersion(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Digits with underscores removed and leading zeros stripped, if numeric
    fn numeric_key(&self) -> Option<String> {
        let numeric = self.0.chars().any(|c| c.is_ascii_digit())
            && self.0.chars().all(|c| c.is_ascii_digit() || c == '_');
        if !numeric {
            return None;
        }
        let digits: String = self.0.chars().filter(|c| c.is_ascii_digit()).collect();
        let trimmed = digits.trim_start_matches('0');
        Some(trimmed.to_string())
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let by_value = match (self.numeric_key(), other.numeric_key()) {
            (Some(a), Some(b)) => a.len().cmp(&b.len()).then_with(|| a.cmp(&b)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        by_value.then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Version {
    type Err = SourceLoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::parse(s)
    }
}

/// A typed literal value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Null => f.write_str("NULL"),
            Literal::Bool(b) => write!(f, "{}", b),
            Literal::Int(i) => write!(f, "{}", i),
            Literal::Float(v) => write!(f, "{}", v),
            Literal::Text(s) => write!(f, "'{}'", s),
        }
    }
}

impl From<&Literal> for DatabaseValue {
    fn from(literal: &Literal) -> Self {
        match literal {
            Literal::Null => DatabaseValue::Null,
            Literal::Bool(b) => DatabaseValue::Bool(*b),
            Literal::Int(i) => DatabaseValue::Int64(*i),
            Literal::Float(v) => DatabaseValue::Float64(*v),
            Literal::Text(s) => DatabaseValue::String(s.clone()),
        }
    }
}

impl From<&str> for Literal {
    fn from(value: &str) -> Self {
        Literal::Text(value.to_string())
    }
}

impl From<i64> for Literal {
    fn from(value: i64) -> Self {
        Literal::Int(value)
    }
}

impl From<bool> for Literal {
    fn from(value: bool) -> Self {
        Literal::Bool(value)
    }
}

fn default_id_column() -> String {
    "id".to_string()
}

/// Looks up one column of a seeded row by its natural key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowLookup {
    pub table: String,
    pub key_column: String,
    pub key: Literal,
    #[serde(default = "default_id_column")]
    pub id_column: String,
}

impl RowLookup {
    pub fn new(table: &str, key_column: &str, key: impl Into<Literal>, id_column: &str) -> Self {
        Self {
            table: table.to_string(),
            key_column: key_column.to_string(),
            key: key.into(),
            id_column: id_column.to_string(),
        }
    }
}

/// A value that is either known up front or resolved from a row at execution time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueRef {
    Literal(Literal),
    Lookup(RowLookup),
}

/// `table.column`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddColumn {
    pub table: String,
    pub column: ColumnDef,
}

/// Row inserted only when no row with the same natural key exists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedRow {
    pub table: String,
    /// Natural key columns; must be covered by a unique constraint
    pub key: Vec<String>,
    pub values: BTreeMap<String, Literal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnValue {
    pub table: String,
    pub column: String,
    pub value: ValueRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddForeignKey {
    pub table: String,
    pub constraint: ForeignKeyDef,
}

/// One executable operation of a migration unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Statement {
    /// Raw SQL; guarded when it is recognizably additive
    Sql(String),
    CreateTable(TableDef),
    AddColumn(AddColumn),
    SeedRow(SeedRow),
    /// Abort the unit unless the row exists
    RequireRow(RowLookup),
    /// Set the column for rows where it is NULL
    Backfill(ColumnValue),
    SetDefault(ColumnValue),
    SetNotNull(ColumnRef),
    AddForeignKey(AddForeignKey),
}

impl Statement {
    /// Short label used in logs and reports
    pub fn kind(&self) -> &'static str {
        match self {
            Statement::Sql(_) => "sql",
            Statement::CreateTable(_) => "create_table",
            Statement::AddColumn(_) => "add_column",
            Statement::SeedRow(_) => "seed_row",
            Statement::RequireRow(_) => "require_row",
            Statement::Backfill(_) => "backfill",
            Statement::SetDefault(_) => "set_default",
            Statement::SetNotNull(_) => "set_not_null",
            Statement::AddForeignKey(_) => "add_foreign_key",
        }
    }

    fn identifiers(&self) -> Vec<&str> {
        match self {
            Statement::Sql(_) => Vec::new(),
            Statement::CreateTable(table) => {
                let mut ids = vec![table.name.as_str()];
                ids.extend(table.columns.iter().map(|c| c.name.as_str()));
                ids.extend(table.unique.iter().flatten().map(|c| c.as_str()));
                ids
            }
            Statement::AddColumn(add) => vec![add.table.as_str(), add.column.name.as_str()],
            Statement::SeedRow(seed) => {
                let mut ids = vec![seed.table.as_str()];
                ids.extend(seed.key.iter().map(|c| c.as_str()));
                ids.extend(seed.values.keys().map(|c| c.as_str()));
                ids
            }
            Statement::RequireRow(lookup) => lookup_identifiers(lookup),
            Statement::Backfill(cv) | Statement::SetDefault(cv) => {
                let mut ids = vec![cv.table.as_str(), cv.column.as_str()];
                if let ValueRef::Lookup(lookup) = &cv.value {
                    ids.extend(lookup_identifiers(lookup));
                }
                ids
            }
            Statement::SetNotNull(col) => vec![col.table.as_str(), col.column.as_str()],
            Statement::AddForeignKey(fk) => vec![
                fk.table.as_str(),
                fk.constraint.name.as_str(),
                fk.constraint.column.as_str(),
                fk.constraint.references_table.as_str(),
                fk.constraint.references_column.as_str(),
            ],
        }
    }
}

fn lookup_identifiers(lookup: &RowLookup) -> Vec<&str> {
    vec![
        lookup.table.as_str(),
        lookup.key_column.as_str(),
        lookup.id_column.as_str(),
    ]
}

/// A named, versioned batch of statements applied as one transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationUnit {
    version: Version,
    name: String,
    statements: Vec<Statement>,
}

impl MigrationUnit {
    pub fn new(version: Version, name: impl Into<String>, statements: Vec<Statement>) -> Self {
        Self {
            version,
            name: name.into(),
            statements,
        }
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    /// Reject units that cannot be applied safely
    ///
    /// Besides identifier checks this enforces backfill-then-constrain: a
    /// column added by this unit may only become NOT NULL or gain a foreign key
    /// after the unit has backfilled it or given it a default.
    pub fn validate(&self) -> Result<(), SourceLoadError> {
        if self.statements.is_empty() {
            return Err(self.malformed("migration has no statements"));
        }

        // (table, column) added by this unit -> populated yet?
        let mut added: HashMap<(&str, &str), bool> = HashMap::new();

        for (index, statement) in self.statements.iter().enumerate() {
            for identifier in statement.identifiers() {
                validate_identifier(identifier)
                    .map_err(|e| self.malformed(format!("statement {}: {}", index, e)))?;
            }

            match statement {
                Statement::Sql(sql) if sql.trim().is_empty() => {
                    return Err(self.malformed(format!("statement {}: empty SQL", index)));
                }
                Statement::CreateTable(table) if table.columns.is_empty() => {
                    return Err(self.malformed(format!(
                        "statement {}: table {} has no columns",
                        index, table.name
                    )));
                }
                Statement::AddColumn(add) => {
                    if add.column.is_required() && !add.column.fills_existing_rows() {
                        return Err(self.malformed(format!(
                            "statement {}: column {}.{} is added NOT NULL without a default; add it nullable, backfill, then set NOT NULL",
                            index, add.table, add.column.name
                        )));
                    }
                    added.insert(
                        (add.table.as_str(), add.column.name.as_str()),
                        add.column.fills_existing_rows(),
                    );
                }
                Statement::SeedRow(seed) => {
                    if seed.key.is_empty() {
                        return Err(self.malformed(format!(
                            "statement {}: seed row for {} has no natural key",
                            index, seed.table
                        )));
                    }
                    if let Some(missing) = seed.key.iter().find(|k| !seed.values.contains_key(*k)) {
                        return Err(self.malformed(format!(
                            "statement {}: seed row for {} has no value for key column {}",
                            index, seed.table, missing
                        )));
                    }
                }
                Statement::Backfill(cv) | Statement::SetDefault(cv) => {
                    if let Some(populated) = added.get_mut(&(cv.table.as_str(), cv.column.as_str())) {
                        *populated = true;
                    }
                }
                Statement::SetNotNull(col) => {
                    self.require_populated(&added, index, &col.table, &col.column, "NOT NULL")?;
                }
                Statement::AddForeignKey(fk) => {
                    self.require_populated(
                        &added,
                        index,
                        &fk.table,
                        &fk.constraint.column,
                        "a foreign key",
                    )?;
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn require_populated<'a>(
        &self,
        added: &HashMap<(&'a str, &'a str), bool>,
        index: usize,
        table: &'a str,
        column: &'a str,
        what: &str,
    ) -> Result<(), SourceLoadError> {
        match added.get(&(table, column)) {
            Some(false) => Err(self.malformed(format!(
                "statement {}: {} on {}.{} before the column is backfilled or defaulted",
                index, what, table, column
            ))),
            _ => Ok(()),
        }
    }

    fn malformed(&self, message: impl Into<String>) -> SourceLoadError {
        SourceLoadError::Malformed {
            version: self.version.clone(),
            message: message.into(),
        }
    }
}

/// One row of the version ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub version: Version,
    pub name: String,
    pub applied_at: DateTime<Utc>,
}

/// What a single applied unit did
#[derive(Debug, Clone)]
pub struct UnitReport {
    pub version: Version,
    pub name: String,
    pub execution: ExecutionReport,
    pub execution_time_ms: u128,
}

/// Result of running migrations
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Versions applied by this run, in order
    pub applied: Vec<Version>,
    /// Number of migrations that were applied
    pub applied_count: usize,
    /// Number of migrations that were skipped (already applied)
    pub skipped_count: usize,
    /// Pending migrations left for a later run because a limit was reached
    pub remaining_count: usize,
    /// Total execution time in milliseconds
    pub execution_time_ms: u128,
    pub reports: Vec<UnitReport>,
}

/// Migration status in the system
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MigrationStatus {
    /// Known to the source, not yet applied
    Pending,
    /// Applied and known to the source
    Applied { applied_at: DateTime<Utc> },
    /// Recorded in the ledger but unknown to the source
    Orphaned { applied_at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatusLine {
    pub version: Version,
    pub name: String,
    #[serde(flatten)]
    pub status: MigrationStatus,
}

/// Where a runner is in its lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Resolving,
    Applying { index: usize, version: Version },
    Committed,
    Aborted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::schema::ColumnType;

    fn v(raw: &str) -> Version {
        Version::parse(raw).unwrap()
    }

    #[test]
    fn test_numeric_versions_compare_numerically() {
        assert!(v("2") < v("10"));
        assert!(v("9") < v("42"));
        assert!(v("0002") < v("10"));
        assert!(v("20240101_120000") < v("20240102_000000"));
    }

    #[test]
    fn test_non_numeric_versions_sort_after_numeric() {
        assert!(v("999") < v("a1"));
        assert!(v("v1") < v("v2"));
        assert!(v("v10") < v("v2"));
    }

    #[test]
    fn test_leading_zeros_tiebreak_is_stable() {
        assert_ne!(v("1"), v("01"));
        assert!(v("01") < v("1"));
    }

    #[test]
    fn test_version_rejects_bad_characters() {
        assert!(Version::parse("").is_err());
        assert!(Version::parse("1 2").is_err());
        assert!(Version::parse("1;drop").is_err());
    }

    #[test]
    fn test_statement_yaml_shape() {
        let yaml = r#"
- sql: "CREATE INDEX idx_products_sku ON products (sku)"
- seed_row:
    table: suppliers
    key: [supplier_code]
    values:
      supplier_code: unknown
      name: Unknown supplier
- backfill:
    table: products
    column: supplier_id
    value:
      lookup:
        table: suppliers
        key_column: supplier_code
        key: unknown
- set_not_null:
    table: products
    column: supplier_id
"#;
        let statements: Vec<Statement> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(statements.len(), 4);
        assert_eq!(statements[0].kind(), "sql");
        match &statements[2] {
            Statement::Backfill(cv) => match &cv.value {
                ValueRef::Lookup(lookup) => {
                    assert_eq!(lookup.id_column, "id");
                    assert_eq!(lookup.key, Literal::Text("unknown".to_string()));
                }
                other => panic!("expected lookup, got {:?}", other),
            },
            other => panic!("expected backfill, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_not_null_before_backfill() {
        let unit = MigrationUnit::new(
            v("1"),
            "premature constraint",
            vec![
                Statement::AddColumn(AddColumn {
                    table: "products".to_string(),
                    column: ColumnDef::new("supplier_id", ColumnType::BigInt),
                }),
                Statement::SetNotNull(ColumnRef {
                    table: "products".to_string(),
                    column: "supplier_id".to_string(),
                }),
            ],
        );
        let err = unit.validate().unwrap_err();
        assert!(err.to_string().contains("before the column is backfilled"));
    }

    #[test]
    fn test_validate_accepts_backfill_then_constrain() {
        let unit = MigrationUnit::new(
            v("1"),
            "ordered",
            vec![
                Statement::AddColumn(AddColumn {
                    table: "products".to_string(),
                    column: ColumnDef::new("supplier_id", ColumnType::BigInt),
                }),
                Statement::Backfill(ColumnValue {
                    table: "products".to_string(),
                    column: "supplier_id".to_string(),
                    value: ValueRef::Literal(Literal::Int(1)),
                }),
                Statement::SetNotNull(ColumnRef {
                    table: "products".to_string(),
                    column: "supplier_id".to_string(),
                }),
            ],
        );
        assert!(unit.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_required_column_without_default() {
        let unit = MigrationUnit::new(
            v("1"),
            "required column",
            vec![Statement::AddColumn(AddColumn {
                table: "products".to_string(),
                column: ColumnDef::new("supplier_id", ColumnType::BigInt).not_null(),
            })],
        );
        assert!(unit.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_identifiers_and_empty_units() {
        let unit = MigrationUnit::new(
            v("1"),
            "bad",
            vec![Statement::SetNotNull(ColumnRef {
                table: "products; drop table x".to_string(),
                column: "supplier_id".to_string(),
            })],
        );
        assert!(unit.validate().is_err());

        let empty = MigrationUnit::new(v("2"), "empty", Vec::new());
        assert!(matches!(
            empty.validate(),
            Err(SourceLoadError::Malformed { .. })
        ));
    }

    #[test]
    fn test_status_line_json_shape() {
        let line = MigrationStatusLine {
            version: v("3"),
            name: "add suppliers".to_string(),
            status: MigrationStatus::Pending,
        };
        let json = serde_json::to_value(&line).unwrap();
        assert_eq!(json["version"], "3");
        assert_eq!(json["state"], "pending");
    }
}
