//! Idempotence guards
//!
//! Stateless rules deciding when an operation that found its work already done
//! counts as success. The executor consults them inline: existence checks
//! short-circuit typed statements, and store errors are classified here into
//! tolerated (`AlreadyExisted`) or fatal (`Failed`).

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::tokenizer::{Token, Tokenizer};

use super::schema::{ConstraintInfo, ConstraintKind, ForeignKeyDef};
use crate::error::{ConstraintMismatch, StoreError, StoreErrorKind};

/// Result of one guarded operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardOutcome {
    /// The statement did its work
    Created,
    /// The work was already done; nothing changed
    AlreadyExisted,
    Failed(StoreError),
}

impl GuardOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, GuardOutcome::Failed(_))
    }
}

impl fmt::Display for GuardOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardOutcome::Created => f.write_str("created"),
            GuardOutcome::AlreadyExisted => f.write_str("already existed"),
            GuardOutcome::Failed(e) => write!(f, "failed: {}", e),
        }
    }
}

/// Family of guarded operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardKind {
    /// Create-if-absent: tables, columns, indexes
    Additive,
    /// Insert-if-absent by natural key
    Seed,
    /// Add-constraint-if-absent
    Constraint,
}

impl GuardKind {
    fn tolerates(&self, kind: StoreErrorKind) -> bool {
        match self {
            GuardKind::Additive => matches!(
                kind,
                StoreErrorKind::DuplicateTable
                    | StoreErrorKind::DuplicateObject
                    | StoreErrorKind::DuplicateColumn
            ),
            GuardKind::Seed => kind == StoreErrorKind::UniqueViolation,
            // Index-backed constraints report 42P07 for an existing name
            GuardKind::Constraint => matches!(
                kind,
                StoreErrorKind::DuplicateObject | StoreErrorKind::DuplicateTable
            ),
        }
    }
}

/// How an existing constraint with the expected name is judged
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintCheck {
    /// The existing constraint must enforce the same definition
    #[default]
    Strict,
    /// A matching name is enough
    NameOnly,
}

impl FromStr for ConstraintCheck {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "strict" => Ok(ConstraintCheck::Strict),
            "name_only" | "name" => Ok(ConstraintCheck::NameOnly),
            _ => Err(format!("unknown constraint check '{}'", s)),
        }
    }
}

impl fmt::Display for ConstraintCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstraintCheck::Strict => f.write_str("strict"),
            ConstraintCheck::NameOnly => f.write_str("name_only"),
        }
    }
}

static LEADING_COMMENTS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:\s+|--[^\n]*(?:\n|$)|/\*(?s:.*?)\*/)*").expect("valid comment regex")
});

static ADD_CONSTRAINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^ALTER\s+TABLE\s+.+?\s+ADD\s+CONSTRAINT\s").expect("valid constraint regex")
});

static ALTER_ADD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^ALTER\s+TABLE\s+.+?\s+ADD\s").expect("valid alter regex")
});

static CREATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^CREATE\s").expect("valid create regex"));

static INSERT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^INSERT\s+INTO\s").expect("valid insert regex"));

static RAW_ADD_CONSTRAINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?is)^ALTER\s+TABLE\s+(?:IF\s+EXISTS\s+)?(?:ONLY\s+)?(?:(?:"[^"]+"|[\w$]+)\.)?(?P<table>"[^"]+"|[\w$]+)\s+ADD\s+CONSTRAINT\s+(?P<name>"[^"]+"|[\w$]+)\s+(?P<definition>.+?)\s*;?\s*$"#,
    )
    .expect("valid add constraint regex")
});

static FOREIGN_KEY_DEFINITION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?is)^FOREIGN\s+KEY\s*\((?P<columns>[^)]*)\)\s*REFERENCES\s+(?:(?:"[^"]+"|[\w$]+)\.)?(?P<table>"[^"]+"|[\w$]+)\s*(?:\((?P<referenced>[^)]*)\))?"#,
    )
    .expect("valid foreign key regex")
});

static KEY_DEFINITION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^(?P<kind>UNIQUE|PRIMARY\s+KEY)\s*\((?P<columns>[^)]*)\)")
        .expect("valid key regex")
});

/// Target of a raw `ALTER TABLE ... ADD CONSTRAINT` statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawConstraint {
    pub table: String,
    pub name: String,
    /// `None` for definitions that cannot be compared (CHECK, EXCLUDE, ...)
    pub expected: Option<ConstraintInfo>,
}

impl RawConstraint {
    /// Parse the table, name and definition out of raw SQL
    pub fn parse(sql: &str) -> Option<Self> {
        let caps = RAW_ADD_CONSTRAINT.captures(strip_leading_comments(sql))?;
        let name = normalize_identifier(&caps["name"]);
        let definition = &caps["definition"];

        let expected = if let Some(fk) = FOREIGN_KEY_DEFINITION.captures(definition) {
            Some(ConstraintInfo {
                name: name.clone(),
                kind: ConstraintKind::ForeignKey,
                columns: identifier_list(&fk["columns"]),
                referenced_table: Some(normalize_identifier(&fk["table"])),
                referenced_columns: fk
                    .name("referenced")
                    .map(|m| identifier_list(m.as_str()))
                    .unwrap_or_default(),
            })
        } else {
            KEY_DEFINITION.captures(definition).map(|key| ConstraintInfo {
                name: name.clone(),
                kind: key_kind(&key),
                columns: identifier_list(&key["columns"]),
                referenced_table: None,
                referenced_columns: Vec::new(),
            })
        };

        Some(Self {
            table: normalize_identifier(&caps["table"]),
            name,
            expected,
        })
    }

    fn describe_expected(&self) -> String {
        self.expected
            .as_ref()
            .map_or_else(|| "an uncomparable definition".to_string(), ConstraintInfo::describe)
    }
}

fn key_kind(caps: &Captures<'_>) -> ConstraintKind {
    if caps["kind"].eq_ignore_ascii_case("unique") {
        ConstraintKind::Unique
    } else {
        ConstraintKind::PrimaryKey
    }
}

/// Unquoted identifiers fold to lower case, quoted ones are kept verbatim
fn normalize_identifier(raw: &str) -> String {
    let raw = raw.trim();
    match raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
        Some(quoted) => quoted.to_string(),
        None => raw.to_lowercase(),
    }
}

fn identifier_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(normalize_identifier)
        .filter(|c| !c.is_empty())
        .collect()
}

/// Same kind on the same columns; an omitted referenced column list matches any
fn same_definition(expected: &ConstraintInfo, found: &ConstraintInfo) -> bool {
    expected.kind == found.kind
        && expected.columns == found.columns
        && expected.referenced_table == found.referenced_table
        && (expected.referenced_columns.is_empty()
            || expected.referenced_columns == found.referenced_columns)
}

fn strip_leading_comments(sql: &str) -> &str {
    LEADING_COMMENTS.find(sql).map_or(sql, |m| &sql[m.end()..])
}

fn is_word(token: &Token, keyword: &str) -> bool {
    matches!(token, Token::Word(w) if w.quote_style.is_none() && w.value.eq_ignore_ascii_case(keyword))
}

fn is_insert_source(token: &Token) -> bool {
    ["values", "select", "with", "default", "table", "overriding"]
        .iter()
        .any(|k| is_word(token, k))
}

/// `INSERT INTO ... VALUES (...)` with exactly one row
///
/// `INSERT ... SELECT`, `DEFAULT VALUES` and multi-row inserts are not seeds: a
/// unique violation there may hide rows that were never written.
fn is_single_row_insert(sql: &str) -> bool {
    let dialect = PostgreSqlDialect {};
    let Ok(tokens) = Tokenizer::new(&dialect, sql).tokenize() else {
        return false;
    };
    let mut tokens = tokens
        .iter()
        .filter(|t| !matches!(t, Token::Whitespace(_)));

    // Skip the target and its column list up to the first top-level keyword
    let mut depth = 0usize;
    let mut saw_into = false;
    let source = loop {
        match tokens.next() {
            None => return false,
            Some(Token::LParen) => depth += 1,
            Some(Token::RParen) => depth = depth.saturating_sub(1),
            Some(t) if depth == 0 && is_word(t, "into") => saw_into = true,
            Some(t) if depth == 0 && saw_into && is_insert_source(t) => break t,
            Some(_) => {}
        }
    };
    if !is_word(source, "values") || tokens.next() != Some(&Token::LParen) {
        return false;
    }

    let mut depth = 1usize;
    while depth > 0 {
        match tokens.next() {
            None => return false,
            Some(Token::LParen) => depth += 1,
            Some(Token::RParen) => depth -= 1,
            Some(_) => {}
        }
    }

    match tokens.next() {
        None | Some(Token::EOF) | Some(Token::SemiColon) => true,
        Some(t) => is_word(t, "on") || is_word(t, "returning"),
    }
}

/// Idempotence rules consulted by the executor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuardPolicy {
    pub constraint_check: ConstraintCheck,
}

impl GuardPolicy {
    pub fn new(constraint_check: ConstraintCheck) -> Self {
        Self { constraint_check }
    }

    /// The object a create-if-absent statement targets already exists
    pub fn on_existing_object(&self, _kind: GuardKind) -> GuardOutcome {
        GuardOutcome::AlreadyExisted
    }

    /// Decide whether a store failure means "already done"
    pub fn classify_failure(&self, kind: GuardKind, error: &StoreError) -> GuardOutcome {
        if kind.tolerates(error.kind) {
            GuardOutcome::AlreadyExisted
        } else {
            GuardOutcome::Failed(error.clone())
        }
    }

    /// A constraint with the expected name exists on `table`
    pub fn on_existing_constraint(
        &self,
        table: &str,
        expected: &ForeignKeyDef,
        found: &ConstraintInfo,
    ) -> Result<GuardOutcome, ConstraintMismatch> {
        match self.constraint_check {
            ConstraintCheck::NameOnly => Ok(GuardOutcome::AlreadyExisted),
            ConstraintCheck::Strict if expected.matches(found) => Ok(GuardOutcome::AlreadyExisted),
            ConstraintCheck::Strict => Err(ConstraintMismatch {
                table: table.to_string(),
                name: expected.name.clone(),
                expected: expected.describe(),
                found: found.describe(),
            }),
        }
    }

    /// A raw `ADD CONSTRAINT` hit an existing name; `found` is what the store holds under it
    ///
    /// Under `Strict` the statement must be parseable and the existing
    /// constraint must enforce the same definition.
    pub fn on_existing_raw_constraint(
        &self,
        sql: &str,
        raw: Option<&RawConstraint>,
        found: Option<&ConstraintInfo>,
    ) -> Result<GuardOutcome, ConstraintMismatch> {
        if self.constraint_check == ConstraintCheck::NameOnly {
            return Ok(GuardOutcome::AlreadyExisted);
        }

        let Some(raw) = raw else {
            return Err(ConstraintMismatch {
                table: "?".to_string(),
                name: "?".to_string(),
                expected: sql.trim().to_string(),
                found: "a constraint that could not be identified".to_string(),
            });
        };

        match (&raw.expected, found) {
            (Some(expected), Some(found)) if same_definition(expected, found) => {
                Ok(GuardOutcome::AlreadyExisted)
            }
            _ => Err(ConstraintMismatch {
                table: raw.table.clone(),
                name: raw.name.clone(),
                expected: raw.describe_expected(),
                found: found.map_or_else(
                    || "another object with that name".to_string(),
                    ConstraintInfo::describe,
                ),
            }),
        }
    }

    /// Which guard, if any, applies to a raw SQL statement
    pub fn classify_sql(&self, sql: &str) -> Option<GuardKind> {
        let body = strip_leading_comments(sql);

        if ADD_CONSTRAINT.is_match(body) {
            Some(GuardKind::Constraint)
        } else if ALTER_ADD.is_match(body) || CREATE.is_match(body) {
            Some(GuardKind::Additive)
        } else if INSERT.is_match(body) && is_single_row_insert(body) {
            Some(GuardKind::Seed)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_sql() {
        let policy = GuardPolicy::default();
        assert_eq!(
            policy.classify_sql("CREATE TABLE suppliers (id BIGSERIAL PRIMARY KEY)"),
            Some(GuardKind::Additive)
        );
        assert_eq!(
            policy.classify_sql("-- header\n/* block */\n  create unique index idx on t (a)"),
            Some(GuardKind::Additive)
        );
        assert_eq!(
            policy.classify_sql("ALTER TABLE products ADD COLUMN supplier_id BIGINT"),
            Some(GuardKind::Additive)
        );
        assert_eq!(
            policy.classify_sql(
                "ALTER TABLE products ADD CONSTRAINT fk_products_supplier_id FOREIGN KEY (supplier_id) REFERENCES suppliers (id)"
            ),
            Some(GuardKind::Constraint)
        );
        assert_eq!(
            policy.classify_sql("INSERT INTO suppliers (supplier_code) VALUES ('unknown')"),
            Some(GuardKind::Seed)
        );
        assert_eq!(
            policy.classify_sql(
                "INSERT INTO suppliers (supplier_code, name) VALUES ('unknown', 'Unknown (default)') ON CONFLICT DO NOTHING"
            ),
            Some(GuardKind::Seed)
        );
        assert_eq!(
            policy.classify_sql("UPDATE products SET supplier_id = 1 WHERE supplier_id IS NULL"),
            None
        );
        assert_eq!(
            policy.classify_sql("ALTER TABLE products ALTER COLUMN supplier_id SET NOT NULL"),
            None
        );
        assert_eq!(policy.classify_sql("DROP TABLE legacy"), None);
    }

    #[test]
    fn test_bulk_inserts_are_not_seeds() {
        let policy = GuardPolicy::default();
        for sql in [
            "INSERT INTO products (sku) SELECT sku FROM staging_products",
            "INSERT INTO products (sku) VALUES ('a'), ('b')",
            "INSERT INTO products DEFAULT VALUES",
            "INSERT INTO products (sku) WITH s AS (SELECT 'a' AS sku) SELECT sku FROM s",
            "INSERT INTO products (sku) VALUES ((SELECT max(sku) FROM staging_products)), ('b')",
        ] {
            assert_eq!(policy.classify_sql(sql), None, "{}", sql);
        }
    }

    #[test]
    fn test_parse_raw_constraint() {
        let raw = RawConstraint::parse(
            "ALTER TABLE public.\"Products\" ADD CONSTRAINT fk_products_supplier_id FOREIGN KEY (supplier_id) REFERENCES suppliers (id);",
        )
        .unwrap();
        assert_eq!(raw.table, "Products");
        assert_eq!(raw.name, "fk_products_supplier_id");
        let expected = raw.expected.unwrap();
        assert_eq!(expected.kind, ConstraintKind::ForeignKey);
        assert_eq!(expected.columns, vec!["supplier_id"]);
        assert_eq!(expected.referenced_table.as_deref(), Some("suppliers"));
        assert_eq!(expected.referenced_columns, vec!["id"]);

        let unique =
            RawConstraint::parse("alter table suppliers add constraint uq_code UNIQUE (Supplier_Code)")
                .unwrap();
        assert_eq!(unique.expected.unwrap().columns, vec!["supplier_code"]);

        let check = RawConstraint::parse(
            "ALTER TABLE products ADD CONSTRAINT ck_price CHECK (price > 0)",
        )
        .unwrap();
        assert_eq!(check.expected, None);
    }

    #[test]
    fn test_existing_raw_constraint_is_compared_under_strict() {
        let sql = "ALTER TABLE products ADD CONSTRAINT fk_products_supplier_id FOREIGN KEY (supplier_id) REFERENCES suppliers (id)";
        let raw = RawConstraint::parse(sql).unwrap();
        let same = ConstraintInfo {
            name: "fk_products_supplier_id".to_string(),
            kind: ConstraintKind::ForeignKey,
            columns: vec!["supplier_id".to_string()],
            referenced_table: Some("suppliers".to_string()),
            referenced_columns: vec!["id".to_string()],
        };
        let mut other = same.clone();
        other.referenced_table = Some("vendors".to_string());

        let strict = GuardPolicy::default();
        assert_eq!(
            strict.on_existing_raw_constraint(sql, Some(&raw), Some(&same)),
            Ok(GuardOutcome::AlreadyExisted)
        );
        let mismatch = strict
            .on_existing_raw_constraint(sql, Some(&raw), Some(&other))
            .unwrap_err();
        assert!(mismatch.found.contains("vendors"));
        assert!(strict.on_existing_raw_constraint(sql, Some(&raw), None).is_err());
        assert!(strict.on_existing_raw_constraint(sql, None, Some(&same)).is_err());

        let check_sql = "ALTER TABLE products ADD CONSTRAINT ck_price CHECK (price > 0)";
        let check = RawConstraint::parse(check_sql).unwrap();
        assert!(strict
            .on_existing_raw_constraint(check_sql, Some(&check), Some(&same))
            .is_err());

        let lenient = GuardPolicy::new(ConstraintCheck::NameOnly);
        assert_eq!(
            lenient.on_existing_raw_constraint(sql, Some(&raw), Some(&other)),
            Ok(GuardOutcome::AlreadyExisted)
        );
    }

    #[test]
    fn test_classify_failure() {
        let policy = GuardPolicy::default();
        let duplicate_table = StoreError::from_sqlstate("42P07", "relation exists");
        let unique = StoreError::from_sqlstate("23505", "duplicate key");
        let orphan = StoreError::from_sqlstate("23503", "violates foreign key");

        assert_eq!(
            policy.classify_failure(GuardKind::Additive, &duplicate_table),
            GuardOutcome::AlreadyExisted
        );
        assert_eq!(
            policy.classify_failure(GuardKind::Seed, &unique),
            GuardOutcome::AlreadyExisted
        );
        assert!(policy
            .classify_failure(GuardKind::Additive, &unique)
            .is_failed());
        assert_eq!(
            policy.classify_failure(GuardKind::Constraint, &orphan),
            GuardOutcome::Failed(orphan.clone())
        );
    }

    #[test]
    fn test_existing_constraint_strict_and_name_only() {
        let expected = ForeignKeyDef::new("fk_products_supplier_id", "supplier_id", "suppliers", "id");
        let same = ConstraintInfo {
            name: expected.name.clone(),
            kind: ConstraintKind::ForeignKey,
            columns: vec!["supplier_id".to_string()],
            referenced_table: Some("suppliers".to_string()),
            referenced_columns: vec!["id".to_string()],
        };
        let mut other = same.clone();
        other.referenced_table = Some("vendors".to_string());

        let strict = GuardPolicy::new(ConstraintCheck::Strict);
        assert_eq!(
            strict.on_existing_constraint("products", &expected, &same),
            Ok(GuardOutcome::AlreadyExisted)
        );
        let mismatch = strict
            .on_existing_constraint("products", &expected, &other)
            .unwrap_err();
        assert!(mismatch.found.contains("vendors"));

        let lenient = GuardPolicy::new(ConstraintCheck::NameOnly);
        assert_eq!(
            lenient.on_existing_constraint("products", &expected, &other),
            Ok(GuardOutcome::AlreadyExisted)
        );
    }

    #[test]
    fn test_constraint_check_from_str() {
        assert_eq!("strict".parse::<ConstraintCheck>(), Ok(ConstraintCheck::Strict));
        assert_eq!("name-only".parse::<ConstraintCheck>(), Ok(ConstraintCheck::NameOnly));
        assert!("loose".parse::<ConstraintCheck>().is_err());
    }
}
