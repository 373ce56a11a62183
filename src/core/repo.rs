//! Shared repository-layer helpers.
//!
//! Every identifier spliced into a query fragment is validated against the
//! identifier grammar AND the live schema; every LIKE pattern built from
//! user input is escaped. Repositories call these helpers instead of
//! formatting SQL ad hoc.

use crate::core::error::EngineError;
use rusqlite::Connection;
use serde::Serialize;

/// Identifier grammar for table and column names.
const IDENTIFIER_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]*$";

/// Validate a table name against the grammar and `sqlite_master`.
pub fn validate_table(conn: &Connection, table: &str) -> Result<(), EngineError> {
    validate_identifier_shape(table)?;
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    if count == 0 {
        return Err(EngineError::Validation(format!(
            "invalid identifier: table '{}' not in schema",
            table
        )));
    }
    Ok(())
}

/// Validate a column name against the grammar and the table's live column
/// whitelist from `PRAGMA table_info`.
pub fn validate_column(conn: &Connection, table: &str, column: &str) -> Result<(), EngineError> {
    validate_table(conn, table)?;
    validate_identifier_shape(column)?;
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(());
        }
    }
    Err(EngineError::Validation(format!(
        "invalid identifier: column '{}' not in table '{}'",
        column, table
    )))
}

fn validate_identifier_shape(identifier: &str) -> Result<(), EngineError> {
    let re = regex::Regex::new(IDENTIFIER_PATTERN).expect("static identifier pattern");
    if !re.is_match(identifier) {
        return Err(EngineError::Validation(format!(
            "invalid identifier '{}'",
            identifier
        )));
    }
    Ok(())
}

/// Escape `%`, `_`, and `\` for a LIKE pattern used with `ESCAPE '\'`.
pub fn escape_like(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for ch in term.chars() {
        if ch == '%' || ch == '_' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// A `%term%` LIKE pattern with the term escaped.
pub fn contains_pattern(term: &str) -> String {
    format!("%{}%", escape_like(term))
}

/// One page of a filtered query.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
    pub pages: u32,
}

impl<T> Page<T> {
    pub fn new(data: Vec<T>, page: u32, page_size: u32, total: u64) -> Page<T> {
        let page_size = page_size.max(1);
        let pages = ((total + page_size as u64 - 1) / page_size as u64) as u32;
        Page {
            data,
            page,
            page_size,
            total,
            pages,
        }
    }

    /// OFFSET for a 1-based page number.
    pub fn offset(page: u32, page_size: u32) -> u64 {
        (page.saturating_sub(1) as u64) * page_size.max(1) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::db;
    use tempfile::tempdir;

    fn test_conn() -> (tempfile::TempDir, Connection) {
        let tmp = tempdir().expect("tempdir");
        let mut conn = db::db_connect(&tmp.path().join("engine.db")).expect("connect");
        crate::core::migration::run_migrations(&mut conn).expect("migrate");
        (tmp, conn)
    }

    #[test]
    fn test_validate_table_accepts_known_tables() {
        let (_tmp, conn) = test_conn();
        validate_table(&conn, "recipes").expect("recipes is a table");
        validate_table(&conn, "knowledge_edges").expect("edges is a table");
    }

    #[test]
    fn test_validate_table_rejects_injection_and_unknown() {
        let (_tmp, conn) = test_conn();
        assert!(validate_table(&conn, "recipes; DROP TABLE recipes").is_err());
        assert!(validate_table(&conn, "no_such_table").is_err());
        assert!(validate_table(&conn, "1recipes").is_err());
    }

    #[test]
    fn test_validate_column_uses_live_whitelist() {
        let (_tmp, conn) = test_conn();
        validate_column(&conn, "recipes", "title").expect("title exists");
        assert!(validate_column(&conn, "recipes", "no_such_column").is_err());
        assert!(validate_column(&conn, "recipes", "title OR 1=1").is_err());
    }

    #[test]
    fn test_escape_like_escapes_metacharacters() {
        assert_eq!(escape_like("100%_done\\x"), "100\\%\\_done\\\\x");
        assert_eq!(contains_pattern("a_b"), "%a\\_b%");
    }

    #[test]
    fn test_escaped_like_matches_literal() {
        let (_tmp, conn) = test_conn();
        conn.execute(
            "INSERT INTO recipes(id, title, language, kind, knowledge_type, created_at, updated_at)
             VALUES('rcp-1', '50%_rule', 'swift', 'rule', 'code-standard', '0Z', '0Z')",
            [],
        )
        .expect("seed");
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM recipes WHERE title LIKE ?1 ESCAPE '\\'",
                [contains_pattern("50%_rule")],
                |r| r.get(0),
            )
            .expect("query");
        assert_eq!(count, 1);
        let miss: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM recipes WHERE title LIKE ?1 ESCAPE '\\'",
                [contains_pattern("50X_rule")],
                |r| r.get(0),
            )
            .expect("query");
        assert_eq!(miss, 0);
    }

    #[test]
    fn test_page_math() {
        let page: Page<u8> = Page::new(vec![], 2, 10, 25);
        assert_eq!(page.pages, 3);
        assert_eq!(Page::<u8>::offset(2, 10), 10);
        assert_eq!(Page::<u8>::offset(0, 10), 0);
    }
}
