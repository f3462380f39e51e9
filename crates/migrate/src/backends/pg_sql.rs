//! PostgreSQL statement rendering
//!
//! Every identifier goes through [`escape_identifier`]. Values are bound as
//! parameters wherever PostgreSQL allows it; DDL defaults cannot be bound, so
//! they are rendered as typed literals by [`render_literal`].

use crate::backends::DatabaseValue;
use crate::migrations::definitions::Literal;
use crate::migrations::schema::{ColumnDef, DefaultExpr, ForeignKeyDef, TableDef};
use crate::security::{escape_identifier, quote_literal};

pub const TABLE_EXISTS: &str = "SELECT EXISTS (\
    SELECT 1 FROM information_schema.tables \
    WHERE table_schema = current_schema() AND table_name = $1)";

pub const COLUMN_INFO: &str = "SELECT column_name::text AS column_name, \
    data_type::text AS data_type, \
    (is_nullable = 'YES') AS nullable, \
    column_default::text AS column_default \
    FROM information_schema.columns \
    WHERE table_schema = current_schema() AND table_name = $1 AND column_name = $2";

pub const CONSTRAINT_INFO: &str = "SELECT c.conname::text AS name, \
    c.contype::text AS kind, \
    ARRAY(SELECT a.attname::text FROM unnest(c.conkey) WITH ORDINALITY AS k(attnum, ord) \
          JOIN pg_attribute a ON a.attrelid = c.conrelid AND a.attnum = k.attnum \
          ORDER BY k.ord) AS columns, \
    rt.relname::text AS referenced_table, \
    ARRAY(SELECT a.attname::text FROM unnest(c.confkey) WITH ORDINALITY AS k(attnum, ord) \
          JOIN pg_attribute a ON a.attrelid = c.confrelid AND a.attnum = k.attnum \
          ORDER BY k.ord) AS referenced_columns \
    FROM pg_constraint c \
    JOIN pg_class t ON t.oid = c.conrelid \
    JOIN pg_namespace n ON n.oid = t.relnamespace \
    LEFT JOIN pg_class rt ON rt.oid = c.confrelid \
    WHERE n.nspname = current_schema() AND t.relname = $1 AND c.conname = $2";

pub const ADVISORY_LOCK: &str = "SELECT pg_advisory_lock($1)";

pub const ADVISORY_UNLOCK: &str = "SELECT pg_advisory_unlock($1)";

/// Render a value as a typed SQL literal
pub fn render_literal(value: &DatabaseValue) -> String {
    match value {
        DatabaseValue::Null => "NULL".to_string(),
        DatabaseValue::Bool(true) => "TRUE".to_string(),
        DatabaseValue::Bool(false) => "FALSE".to_string(),
        DatabaseValue::Int32(i) => i.to_string(),
        DatabaseValue::Int64(i) => i.to_string(),
        DatabaseValue::Float64(f) if f.is_finite() => format!("{:?}", f),
        DatabaseValue::Float64(f) => format!("{}::double precision", quote_literal(&f.to_string())),
        DatabaseValue::String(s) => quote_literal(s),
        DatabaseValue::DateTime(dt) => format!("{}::timestamptz", quote_literal(&dt.to_rfc3339())),
        DatabaseValue::Json(j) => format!("{}::jsonb", quote_literal(&j.to_string())),
    }
}

fn render_default(default: &DefaultExpr) -> String {
    match default {
        DefaultExpr::Now => "now()".to_string(),
        DefaultExpr::Literal(literal) => render_literal(&DatabaseValue::from(literal)),
    }
}

/// Column clause as used in CREATE TABLE and ADD COLUMN
pub fn column_definition(column: &ColumnDef) -> String {
    let mut sql = format!("{} {}", escape_identifier(&column.name), column.ty.sql_type());

    if column.primary_key {
        sql.push_str(" PRIMARY KEY");
    } else if !column.nullable {
        sql.push_str(" NOT NULL");
    }

    if column.unique && !column.primary_key {
        sql.push_str(" UNIQUE");
    }

    match &column.default {
        Some(DefaultExpr::Literal(Literal::Null)) | None => {}
        Some(default) => {
            sql.push_str(" DEFAULT ");
            sql.push_str(&render_default(default));
        }
    }

    sql
}

pub fn create_table(table: &TableDef) -> String {
    let mut parts: Vec<String> = table.columns.iter().map(column_definition).collect();

    for columns in &table.unique {
        parts.push(format!("UNIQUE ({})", join_identifiers(columns)));
    }

    format!(
        "CREATE TABLE {} (\n    {}\n)",
        escape_identifier(&table.name),
        parts.join(",\n    ")
    )
}

pub fn add_column(table: &str, column: &ColumnDef) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN {}",
        escape_identifier(table),
        column_definition(column)
    )
}

/// `INSERT ... ON CONFLICT (key) DO NOTHING` with one placeholder per column
pub fn insert_if_absent(table: &str, key: &[String], columns: &[String]) -> String {
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${}", i)).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO NOTHING",
        escape_identifier(table),
        join_identifiers(columns),
        placeholders.join(", "),
        join_identifiers(key)
    )
}

pub fn select_value(table: &str, key_column: &str, id_column: &str) -> String {
    format!(
        "SELECT {} FROM {} WHERE {} = $1 LIMIT 1",
        escape_identifier(id_column),
        escape_identifier(table),
        escape_identifier(key_column)
    )
}

pub fn backfill(table: &str, column: &str) -> String {
    let column = escape_identifier(column);
    format!(
        "UPDATE {} SET {} = $1 WHERE {} IS NULL",
        escape_identifier(table),
        column,
        column
    )
}

pub fn set_default(table: &str, column: &str, value: &DatabaseValue) -> String {
    format!(
        "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {}",
        escape_identifier(table),
        escape_identifier(column),
        render_literal(value)
    )
}

pub fn set_not_null(table: &str, column: &str) -> String {
    format!(
        "ALTER TABLE {} ALTER COLUMN {} SET NOT NULL",
        escape_identifier(table),
        escape_identifier(column)
    )
}

pub fn add_foreign_key(table: &str, foreign_key: &ForeignKeyDef) -> String {
    format!(
        "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
        escape_identifier(table),
        escape_identifier(&foreign_key.name),
        escape_identifier(&foreign_key.column),
        escape_identifier(&foreign_key.references_table),
        escape_identifier(&foreign_key.references_column)
    )
}

pub fn create_ledger(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    \
            version TEXT PRIMARY KEY,\n    \
            name TEXT NOT NULL,\n    \
            applied_at TIMESTAMPTZ NOT NULL DEFAULT now()\n\
        )",
        escape_identifier(table)
    )
}

pub fn select_ledger(table: &str) -> String {
    format!(
        "SELECT version, name, applied_at FROM {}",
        escape_identifier(table)
    )
}

pub fn insert_ledger(table: &str) -> String {
    format!(
        "INSERT INTO {} (version, name, applied_at) VALUES ($1, $2, $3)",
        escape_identifier(table)
    )
}

pub fn savepoint(name: &str) -> String {
    format!("SAVEPOINT {}", escape_identifier(name))
}

pub fn rollback_to_savepoint(name: &str) -> String {
    format!("ROLLBACK TO SAVEPOINT {}", escape_identifier(name))
}

pub fn release_savepoint(name: &str) -> String {
    format!("RELEASE SAVEPOINT {}", escape_identifier(name))
}

fn join_identifiers(identifiers: &[String]) -> String {
    identifiers
        .iter()
        .map(|i| escape_identifier(i))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::schema::ColumnType;

    #[test]
    fn test_create_table_sql() {
        let table = TableDef::new("suppliers")
            .column(ColumnDef::new("id", ColumnType::BigSerial).primary_key())
            .column(ColumnDef::new("supplier_code", ColumnType::Text).not_null().unique())
            .column(
                ColumnDef::new("created_at", ColumnType::TimestampTz)
                    .not_null()
                    .default(DefaultExpr::Now),
            );

        assert_eq!(
            create_table(&table),
            "CREATE TABLE \"suppliers\" (\n    \
             \"id\" BIGSERIAL PRIMARY KEY,\n    \
             \"supplier_code\" TEXT NOT NULL UNIQUE,\n    \
             \"created_at\" TIMESTAMPTZ NOT NULL DEFAULT now()\n)"
        );
    }

    #[test]
    fn test_table_level_unique() {
        let table = TableDef::new("prices")
            .column(ColumnDef::new("sku", ColumnType::Text))
            .column(ColumnDef::new("region", ColumnType::Text))
            .unique_together(&["sku", "region"]);
        assert!(create_table(&table).contains("UNIQUE (\"sku\", \"region\")"));
    }

    #[test]
    fn test_insert_if_absent_sql() {
        let sql = insert_if_absent(
            "suppliers",
            &["supplier_code".to_string()],
            &["name".to_string(), "supplier_code".to_string()],
        );
        assert_eq!(
            sql,
            "INSERT INTO \"suppliers\" (\"name\", \"supplier_code\") VALUES ($1, $2) \
             ON CONFLICT (\"supplier_code\") DO NOTHING"
        );
    }

    #[test]
    fn test_backfill_and_constraint_sql() {
        assert_eq!(
            backfill("products", "supplier_id"),
            "UPDATE \"products\" SET \"supplier_id\" = $1 WHERE \"supplier_id\" IS NULL"
        );
        assert_eq!(
            set_default("products", "supplier_id", &DatabaseValue::Int64(1)),
            "ALTER TABLE \"products\" ALTER COLUMN \"supplier_id\" SET DEFAULT 1"
        );
        let fk = ForeignKeyDef::new("fk_products_supplier_id", "supplier_id", "suppliers", "id");
        assert_eq!(
            add_foreign_key("products", &fk),
            "ALTER TABLE \"products\" ADD CONSTRAINT \"fk_products_supplier_id\" \
             FOREIGN KEY (\"supplier_id\") REFERENCES \"suppliers\" (\"id\")"
        );
    }

    #[test]
    fn test_render_literal_escapes_text() {
        assert_eq!(render_literal(&DatabaseValue::from("it's")), "'it''s'");
        assert_eq!(render_literal(&DatabaseValue::Bool(true)), "TRUE");
        assert_eq!(render_literal(&DatabaseValue::Float64(1.5)), "1.5");
        assert_eq!(render_literal(&DatabaseValue::Null), "NULL");
    }

    #[test]
    fn test_identifiers_are_quoted() {
        assert_eq!(
            set_not_null("order\"items", "x"),
            "ALTER TABLE \"order\"\"items\" ALTER COLUMN \"x\" SET NOT NULL"
        );
        assert_eq!(savepoint("strata_guard_3"), "SAVEPOINT \"strata_guard_3\"");
    }
}
