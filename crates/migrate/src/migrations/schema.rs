//! Schema descriptions used by typed statements
//!
//! Tables, columns and foreign keys are described here and rendered to SQL by
//! the store backend. The introspection types ([`ColumnInfo`],
//! [`ConstraintInfo`]) are what a backend reports back about existing objects.

use serde::{Deserialize, Serialize};

use super::definitions::Literal;

/// Column data types understood by the typed statements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    BigSerial,
    Serial,
    BigInt,
    Integer,
    Text,
    Varchar(u32),
    Boolean,
    Date,
    Timestamp,
    #[serde(alias = "timestamptz")]
    TimestampTz,
    Jsonb,
}

impl ColumnType {
    /// SQL spelling of the type
    pub fn sql_type(&self) -> String {
        match self {
            ColumnType::BigSerial => "BIGSERIAL".to_string(),
            ColumnType::Serial => "SERIAL".to_string(),
            ColumnType::BigInt => "BIGINT".to_string(),
            ColumnType::Integer => "INTEGER".to_string(),
            ColumnType::Text => "TEXT".to_string(),
            ColumnType::Varchar(len) => format!("VARCHAR({})", len),
            ColumnType::Boolean => "BOOLEAN".to_string(),
            ColumnType::Date => "DATE".to_string(),
            ColumnType::Timestamp => "TIMESTAMP".to_string(),
            ColumnType::TimestampTz => "TIMESTAMPTZ".to_string(),
            ColumnType::Jsonb => "JSONB".to_string(),
        }
    }

    /// Serial types fill themselves from a sequence
    pub fn is_serial(&self) -> bool {
        matches!(self, ColumnType::BigSerial | ColumnType::Serial)
    }
}

/// Column default expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultExpr {
    /// `now()`
    Now,
    Literal(Literal),
}

fn default_true() -> bool {
    true
}

/// A column definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub default: Option<DefaultExpr>,
}

impl ColumnDef {
    pub fn new(name: &str, ty: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            ty,
            nullable: true,
            unique: false,
            primary_key: false,
            default: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn default(mut self, default: DefaultExpr) -> Self {
        self.default = Some(default);
        self
    }

    /// True when the column cannot hold NULL once created
    pub fn is_required(&self) -> bool {
        !self.nullable || self.primary_key
    }

    /// True when existing rows receive a value as the column is added
    pub fn fills_existing_rows(&self) -> bool {
        self.default.is_some() || self.ty.is_serial()
    }
}

/// A table definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    /// Table-level unique constraints, one entry per column set
    #[serde(default)]
    pub unique: Vec<Vec<String>>,
}

impl TableDef {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            columns: Vec::new(),
            unique: Vec::new(),
        }
    }

    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    pub fn unique_together(mut self, columns: &[&str]) -> Self {
        self.unique
            .push(columns.iter().map(|c| c.to_string()).collect());
        self
    }
}

fn default_id_column() -> String {
    "id".to_string()
}

/// A named foreign key on a single column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyDef {
    pub name: String,
    pub column: String,
    pub references_table: String,
    #[serde(default = "default_id_column")]
    pub references_column: String,
}

impl ForeignKeyDef {
    pub fn new(name: &str, column: &str, references_table: &str, references_column: &str) -> Self {
        Self {
            name: name.to_string(),
            column: column.to_string(),
            references_table: references_table.to_string(),
            references_column: references_column.to_string(),
        }
    }

    /// Does an existing constraint enforce exactly this foreign key?
    pub fn matches(&self, found: &ConstraintInfo) -> bool {
        found.kind == ConstraintKind::ForeignKey
            && found.columns == [self.column.as_str()]
            && found.referenced_table.as_deref() == Some(self.references_table.as_str())
            && found.referenced_columns == [self.references_column.as_str()]
    }

    pub fn describe(&self) -> String {
        format!(
            "FOREIGN KEY ({}) REFERENCES {}({})",
            self.column, self.references_table, self.references_column
        )
    }
}

/// Kind of an existing constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    PrimaryKey,
    Unique,
    ForeignKey,
    Check,
    Other,
}

impl ConstraintKind {
    /// Map `pg_constraint.contype`
    pub fn from_pg_contype(contype: &str) -> Self {
        match contype {
            "p" => ConstraintKind::PrimaryKey,
            "u" => ConstraintKind::Unique,
            "f" => ConstraintKind::ForeignKey,
            "c" => ConstraintKind::Check,
            _ => ConstraintKind::Other,
        }
    }
}

/// An existing constraint, as reported by the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintInfo {
    pub name: String,
    pub kind: ConstraintKind,
    pub columns: Vec<String>,
    pub referenced_table: Option<String>,
    pub referenced_columns: Vec<String>,
}

impl ConstraintInfo {
    pub fn describe(&self) -> String {
        let columns = self.columns.join(", ");
        match (self.kind, &self.referenced_table) {
            (ConstraintKind::ForeignKey, Some(table)) => format!(
                "FOREIGN KEY ({}) REFERENCES {}({})",
                columns,
                table,
                self.referenced_columns.join(", ")
            ),
            (ConstraintKind::PrimaryKey, _) => format!("PRIMARY KEY ({})", columns),
            (ConstraintKind::Unique, _) => format!("UNIQUE ({})", columns),
            (ConstraintKind::Check, _) => "CHECK".to_string(),
            _ => format!("constraint on ({})", columns),
        }
    }
}

/// An existing column, as reported by the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    /// Default expression as the store renders it
    pub default: Option<String>,
}
