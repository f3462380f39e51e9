//! Split a SQL script into statements
//!
//! Uses the sqlparser tokenizer so semicolons inside string literals,
//! dollar-quoted bodies, quoted identifiers and comments do not end a
//! statement. Statements are sliced from the original text rather than
//! re-rendered, so the SQL that runs is the SQL that was written.

use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::tokenizer::{Token, Tokenizer};

/// Split `sql` at top-level semicolons
///
/// Segments holding only whitespace and comments are dropped. The returned
/// statements have no trailing semicolon.
pub fn split_sql_statements(sql: &str) -> Result<Vec<String>, String> {
    let dialect = PostgreSqlDialect {};
    let tokens = Tokenizer::new(&dialect, sql)
        .tokenize_with_location()
        .map_err(|e| format!("failed to tokenize SQL: {}", e))?;

    let line_starts = line_start_offsets(sql);
    let mut statements = Vec::new();
    let mut start = 0;
    let mut has_content = false;

    for token in &tokens {
        match &token.token {
            Token::SemiColon => {
                let end = byte_offset(
                    sql,
                    &line_starts,
                    token.location.line as usize,
                    token.location.column as usize,
                );
                if has_content {
                    statements.push(sql[start..end].trim().to_string());
                }
                start = end + 1;
                has_content = false;
            }
            Token::Whitespace(_) | Token::EOF => {}
            _ => has_content = true,
        }
    }

    if has_content {
        statements.push(sql[start..].trim().to_string());
    }

    Ok(statements)
}

fn line_start_offsets(sql: &str) -> Vec<usize> {
    std::iter::once(0)
        .chain(sql.match_indices('\n').map(|(i, _)| i + 1))
        .collect()
}

/// Convert a 1-based (line, column-in-chars) location into a byte offset
fn byte_offset(sql: &str, line_starts: &[usize], line: usize, column: usize) -> usize {
    let line_start = line_starts
        .get(line.saturating_sub(1))
        .copied()
        .unwrap_or(sql.len());
    sql[line_start..]
        .char_indices()
        .nth(column.saturating_sub(1))
        .map(|(i, _)| line_start + i)
        .unwrap_or(sql.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splits_simple_statements() {
        let sql = "CREATE TABLE a (id INT);\nINSERT INTO a VALUES (1);\n";
        assert_eq!(
            split_sql_statements(sql).unwrap(),
            vec!["CREATE TABLE a (id INT)", "INSERT INTO a VALUES (1)"]
        );
    }

    #[test]
    fn test_semicolons_in_literals_and_comments() {
        let sql = "INSERT INTO notes (body) VALUES ('a; b');\n\
                   -- trailing; comment\n\
                   SELECT \"odd;name\" FROM t";
        let statements = split_sql_statements(sql).unwrap();
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0], "INSERT INTO notes (body) VALUES ('a; b')");
        assert!(statements[1].ends_with("SELECT \"odd;name\" FROM t"));
    }

    #[test]
    fn test_dollar_quoted_function_body() {
        let sql = "CREATE FUNCTION touch() RETURNS trigger AS $$\n\
                   BEGIN\n  NEW.updated_at := now();\n  RETURN NEW;\nEND;\n\
                   $$ LANGUAGE plpgsql;\n\
                   SELECT 1;";
        let statements = split_sql_statements(sql).unwrap();
        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("RETURN NEW;"));
        assert_eq!(statements[1], "SELECT 1");
    }

    #[test]
    fn test_comment_only_segments_are_dropped() {
        let sql = "-- nothing here\n;\n/* still nothing */;\nSELECT 'é';";
        assert_eq!(split_sql_statements(sql).unwrap(), vec!["SELECT 'é'"]);
    }

    #[test]
    fn test_unterminated_literal_is_an_error() {
        assert!(split_sql_statements("SELECT 'open").is_err());
    }
}
