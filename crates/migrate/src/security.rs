//! Identifier and literal safety for generated SQL
//!
//! Typed statements are rendered to SQL by the backends. Every table, column
//! and constraint name passes through [`validate_identifier`] when a unit is
//! loaded and through [`escape_identifier`] when it is rendered. Values that
//! cannot be bound as parameters (DDL defaults) go through [`quote_literal`].

use thiserror::Error;

/// Characters allowed in SQL identifiers (alphanumeric, underscore, dollar)
const ALLOWED_IDENTIFIER_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_$";

/// PostgreSQL truncates identifiers beyond this length
const MAX_IDENTIFIER_LEN: usize = 63;

/// SQL keywords rejected as bare identifiers
static SQL_KEYWORDS: &[&str] = &[
    "SELECT", "INSERT", "UPDATE", "DELETE", "FROM", "WHERE", "JOIN", "UNION", "DROP", "CREATE",
    "ALTER", "GRANT", "REVOKE", "TRUNCATE", "EXEC", "EXECUTE", "DECLARE", "CAST", "TABLE",
    "COLUMN", "CONSTRAINT", "REFERENCES", "DEFAULT", "NULL", "USER", "SESSION_USER",
    "CURRENT_USER",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid identifier '{identifier}': {reason}")]
pub struct InvalidIdentifier {
    pub identifier: String,
    pub reason: String,
}

impl InvalidIdentifier {
    fn new(identifier: &str, reason: impl Into<String>) -> Self {
        Self {
            identifier: identifier.to_string(),
            reason: reason.into(),
        }
    }
}

/// Escape a SQL identifier (table name, column name, etc.)
///
/// Doubles embedded double quotes and wraps the result in double quotes, so
/// any string is safe to splice into a statement.
///
/// ```
/// use strata_migrate::security::escape_identifier;
///
/// assert_eq!(escape_identifier("suppliers"), "\"suppliers\"");
/// assert_eq!(escape_identifier("table\"name"), "\"table\"\"name\"");
/// ```
pub fn escape_identifier(identifier: &str) -> String {
    let escaped = identifier.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

/// Validate that an identifier is safe for use in generated SQL
pub fn validate_identifier(identifier: &str) -> Result<(), InvalidIdentifier> {
    let first = identifier
        .chars()
        .next()
        .ok_or_else(|| InvalidIdentifier::new(identifier, "identifier cannot be empty"))?;

    if identifier.len() > MAX_IDENTIFIER_LEN {
        return Err(InvalidIdentifier::new(
            identifier,
            format!("too long (max {} characters)", MAX_IDENTIFIER_LEN),
        ));
    }

    if let Some(c) = identifier
        .chars()
        .find(|c| !ALLOWED_IDENTIFIER_CHARS.contains(*c))
    {
        return Err(InvalidIdentifier::new(
            identifier,
            format!("contains invalid character '{}'", c),
        ));
    }

    if first.is_ascii_digit() {
        return Err(InvalidIdentifier::new(identifier, "cannot start with a number"));
    }

    let upper = identifier.to_uppercase();
    if SQL_KEYWORDS.contains(&upper.as_str()) {
        return Err(InvalidIdentifier::new(identifier, "reserved SQL keyword"));
    }

    Ok(())
}

/// Render a string as a single-quoted SQL literal
///
/// Assumes `standard_conforming_strings = on` (the PostgreSQL default), where
/// only the quote character needs doubling.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_identifier() {
        assert_eq!(escape_identifier("purchase_orders"), "\"purchase_orders\"");
        assert_eq!(escape_identifier("table\"name"), "\"table\"\"name\"");
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("suppliers").is_ok());
        assert!(validate_identifier("supplier_id").is_ok());
        assert!(validate_identifier("_strata_migrations").is_ok());
        assert!(validate_identifier("fk_products_supplier_id").is_ok());

        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("1table").is_err());
        assert!(validate_identifier("table-name").is_err());
        assert!(validate_identifier("table name").is_err());
        assert!(validate_identifier("select").is_err());
        assert!(validate_identifier(&"x".repeat(64)).is_err());
    }

    #[test]
    fn test_invalid_identifier_message() {
        let err = validate_identifier("drop;--").unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid identifier 'drop;--': contains invalid character ';'"
        );
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("unknown"), "'unknown'");
        assert_eq!(quote_literal("O'Brien & Sons"), "'O''Brien & Sons'");
    }
}
