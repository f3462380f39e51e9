//! Supplier table with a default "unknown" supplier
//!
//! Creates `suppliers`, seeds the `unknown` row, then gives every owning table
//! a `supplier_id` column pointing at it. The column is added nullable,
//! backfilled with the unknown supplier's id and only then made NOT NULL and
//! constrained, so existing rows never violate the new column.

use std::collections::BTreeMap;

use crate::migrations::definitions::{
    AddColumn, AddForeignKey, ColumnRef, ColumnValue, Literal, MigrationUnit, RowLookup, SeedRow,
    Statement, ValueRef, Version,
};
use crate::migrations::schema::{ColumnDef, ColumnType, DefaultExpr, ForeignKeyDef, TableDef};

pub const SUPPLIERS_TABLE: &str = "suppliers";
pub const SUPPLIER_CODE_COLUMN: &str = "supplier_code";
pub const SUPPLIER_ID_COLUMN: &str = "supplier_id";
pub const UNKNOWN_SUPPLIER_CODE: &str = "unknown";
pub const UNKNOWN_SUPPLIER_NAME: &str = "Unknown supplier";

/// Tables that get a `supplier_id` when none are configured
pub const DEFAULT_OWNING_TABLES: &[&str] = &["emails", "dispute_documents"];

fn suppliers_table() -> TableDef {
    TableDef::new(SUPPLIERS_TABLE)
        .column(ColumnDef::new("id", ColumnType::BigSerial).primary_key())
        .column(
            ColumnDef::new(SUPPLIER_CODE_COLUMN, ColumnType::Text)
                .not_null()
                .unique(),
        )
        .column(ColumnDef::new("name", ColumnType::Text).not_null())
        .column(ColumnDef::new("email_domain", ColumnType::Text).unique())
        .column(
            ColumnDef::new("created_at", ColumnType::TimestampTz)
                .not_null()
                .default(DefaultExpr::Now),
        )
}

fn unknown_supplier() -> RowLookup {
    RowLookup::new(SUPPLIERS_TABLE, SUPPLIER_CODE_COLUMN, UNKNOWN_SUPPLIER_CODE, "id")
}

/// Build the supplier unit for `owning_tables`
pub fn supplier_unit(version: Version, owning_tables: &[String]) -> MigrationUnit {
    let mut values = BTreeMap::new();
    values.insert(
        SUPPLIER_CODE_COLUMN.to_string(),
        Literal::from(UNKNOWN_SUPPLIER_CODE),
    );
    values.insert("name".to_string(), Literal::from(UNKNOWN_SUPPLIER_NAME));

    let mut statements = vec![
        Statement::CreateTable(suppliers_table()),
        Statement::SeedRow(SeedRow {
            table: SUPPLIERS_TABLE.to_string(),
            key: vec![SUPPLIER_CODE_COLUMN.to_string()],
            values,
        }),
        Statement::RequireRow(unknown_supplier()),
    ];

    for table in owning_tables {
        let column = ColumnRef {
            table: table.clone(),
            column: SUPPLIER_ID_COLUMN.to_string(),
        };
        let from_unknown = ColumnValue {
            table: table.clone(),
            column: SUPPLIER_ID_COLUMN.to_string(),
            value: ValueRef::Lookup(unknown_supplier()),
        };

        statements.push(Statement::AddColumn(AddColumn {
            table: table.clone(),
            column: ColumnDef::new(SUPPLIER_ID_COLUMN, ColumnType::BigInt),
        }));
        statements.push(Statement::Backfill(from_unknown.clone()));
        statements.push(Statement::SetDefault(from_unknown));
        statements.push(Statement::SetNotNull(column));
        statements.push(Statement::AddForeignKey(AddForeignKey {
            table: table.clone(),
            constraint: ForeignKeyDef::new(
                &format!("fk_{}_{}", table, SUPPLIER_ID_COLUMN),
                SUPPLIER_ID_COLUMN,
                SUPPLIERS_TABLE,
                "id",
            ),
        }));
    }

    MigrationUnit::new(version, "create suppliers", statements)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_unit_is_valid() {
        let unit = supplier_unit(Version::parse("1").unwrap(), &tables(DEFAULT_OWNING_TABLES));
        unit.validate().unwrap();
        assert_eq!(unit.statements().len(), 3 + 5 * DEFAULT_OWNING_TABLES.len());
    }

    #[test]
    fn test_backfill_precedes_not_null_and_constraint() {
        let unit = supplier_unit(Version::parse("1").unwrap(), &tables(&["products"]));
        let kinds: Vec<_> = unit.statements().iter().map(|s| s.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                "create_table",
                "seed_row",
                "require_row",
                "add_column",
                "backfill",
                "set_default",
                "set_not_null",
                "add_foreign_key",
            ]
        );
    }

    #[test]
    fn test_without_owning_tables_only_creates_suppliers() {
        let unit = supplier_unit(Version::parse("1").unwrap(), &[]);
        assert_eq!(unit.statements().len(), 3);
    }
}
