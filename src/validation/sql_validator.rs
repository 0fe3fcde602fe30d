use std::fmt;

use sqlparser::dialect::{Dialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::keywords::Keyword;
use sqlparser::tokenizer::{Location, Token, TokenWithSpan, Tokenizer, Whitespace};

use crate::api::middleware::AppError;
use crate::models::DatabaseType;

/// Row ceiling appended to queries that carry no LIMIT of their own.
pub const DEFAULT_ROW_LIMIT: u64 = 1000;

/// Statement classification derived from the leading keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Create,
    Drop,
    Alter,
    Unknown,
}

impl StatementKind {
    fn from_keyword(keyword: Keyword) -> Option<Self> {
        match keyword {
            Keyword::SELECT => Some(StatementKind::Select),
            Keyword::INSERT => Some(StatementKind::Insert),
            Keyword::UPDATE => Some(StatementKind::Update),
            Keyword::DELETE => Some(StatementKind::Delete),
            Keyword::CREATE => Some(StatementKind::Create),
            Keyword::DROP => Some(StatementKind::Drop),
            Keyword::ALTER => Some(StatementKind::Alter),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatementKind::Select => "SELECT",
            StatementKind::Insert => "INSERT",
            StatementKind::Update => "UPDATE",
            StatementKind::Delete => "DELETE",
            StatementKind::Create => "CREATE",
            StatementKind::Drop => "DROP",
            StatementKind::Alter => "ALTER",
            StatementKind::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SQL gate: single statement, SELECT only, bounded result size.
///
/// The gate works on tokens rather than a full grammar so that dialect
/// specific syntax (backticks, `::` casts, `ILIKE`, ...) never causes a
/// rejection on its own. Only the statement count, the leading keyword and
/// the presence of the `LIMIT` token matter.
///
/// Tokenizing follows the target's lexical rules. Comment nesting and
/// quoting differ between engines, and the server splits statements by its
/// own rules, not the gate's.
pub struct SqlValidator;

impl SqlValidator {
    /// Validate with the default ceiling of 1000 rows.
    pub fn validate(sql: &str, database_type: DatabaseType) -> Result<String, AppError> {
        Self::validate_with_limit(sql, database_type, DEFAULT_ROW_LIMIT)
    }

    /// Validate a query and append `LIMIT <row_limit>` when it has none.
    ///
    /// The caller's explicit LIMIT is never overridden, even when larger
    /// than `row_limit`.
    pub fn validate_with_limit(
        sql: &str,
        database_type: DatabaseType,
        row_limit: u64,
    ) -> Result<String, AppError> {
        let tokens = Self::tokenize(sql, database_type)?;
        let statements = Self::split_statements(&tokens);

        if statements.is_empty() {
            return Err(AppError::InvalidSql("Empty SQL query".to_string()));
        }
        if statements.len() > 1 {
            return Err(AppError::InvalidSql(format!(
                "Multiple statements are not allowed (found {})",
                statements.len()
            )));
        }

        if database_type == DatabaseType::MySQL && Self::has_executable_comment(&tokens) {
            return Err(AppError::InvalidSql(
                "MySQL executable comments (/*! ... */) are not allowed".to_string(),
            ));
        }

        let kind = Self::classify(statements[0]);
        if kind != StatementKind::Select {
            tracing::warn!("Rejected {} statement at SQL gate", kind);
            return Err(AppError::InvalidSql(format!(
                "Only SELECT statements are allowed, found: {}",
                kind
            )));
        }

        if Self::has_limit(sql) {
            return Ok(sql.to_string());
        }

        Ok(Self::append_limit(sql, &tokens, row_limit))
    }

    /// Textual LIMIT detection over the uppercased statement.
    ///
    /// Matches inside literals, comments and identifiers too (`table_limit`),
    /// in which case no ceiling is appended.
    pub fn has_limit(sql: &str) -> bool {
        sql.to_uppercase().contains("LIMIT")
    }

    /// Classify the leading keyword of a single statement.
    pub fn statement_kind(sql: &str, database_type: DatabaseType) -> Result<StatementKind, AppError> {
        let tokens = Self::tokenize(sql, database_type)?;
        let statements = Self::split_statements(&tokens);
        Ok(statements
            .first()
            .map(|stmt| Self::classify(stmt))
            .unwrap_or(StatementKind::Unknown))
    }

    fn tokenize(sql: &str, database_type: DatabaseType) -> Result<Vec<TokenWithSpan>, AppError> {
        let dialect: Box<dyn Dialect> = match database_type {
            DatabaseType::PostgreSQL => Box::new(PostgreSqlDialect {}),
            DatabaseType::MySQL => Box::new(MySqlDialect {}),
            DatabaseType::Sqlite => Box::new(SQLiteDialect {}),
        };
        Tokenizer::new(dialect.as_ref(), sql)
            .tokenize_with_location()
            .map_err(|e| AppError::InvalidSql(format!("Failed to parse SQL: {}", e)))
    }

    /// `/*! ... */` bodies are executed by MySQL, so they are not comments there.
    fn has_executable_comment(tokens: &[TokenWithSpan]) -> bool {
        tokens.iter().any(|t| {
            matches!(&t.token, Token::Whitespace(Whitespace::MultiLineComment(body)) if body.starts_with('!'))
        })
    }

    fn is_insignificant(token: &Token) -> bool {
        matches!(token, Token::Whitespace(_) | Token::EOF)
    }

    /// Split on `;`, keeping only runs that hold at least one real token.
    fn split_statements(tokens: &[TokenWithSpan]) -> Vec<&[TokenWithSpan]> {
        let mut statements = Vec::new();
        let mut start = 0;
        for (idx, tok) in tokens.iter().enumerate() {
            if tok.token == Token::SemiColon {
                let segment = &tokens[start..idx];
                if segment.iter().any(|t| !Self::is_insignificant(&t.token)) {
                    statements.push(segment);
                }
                start = idx + 1;
            }
        }
        let tail = &tokens[start..];
        if tail.iter().any(|t| !Self::is_insignificant(&t.token)) {
            statements.push(tail);
        }
        statements
    }

    fn classify(statement: &[TokenWithSpan]) -> StatementKind {
        let mut significant = statement
            .iter()
            .map(|t| &t.token)
            .filter(|t| !Self::is_insignificant(t))
            .skip_while(|t| **t == Token::LParen);

        let leading = match significant.next() {
            Some(Token::Word(word)) => word.keyword,
            _ => return StatementKind::Unknown,
        };

        if leading == Keyword::WITH {
            // Kind of a CTE statement is the first DML/DDL keyword at the top level.
            let mut depth: i32 = 0;
            for token in significant {
                match token {
                    Token::LParen => depth += 1,
                    Token::RParen => depth -= 1,
                    Token::Word(word) if depth == 0 => {
                        if let Some(kind) = StatementKind::from_keyword(word.keyword) {
                            return kind;
                        }
                    }
                    _ => {}
                }
            }
            return StatementKind::Unknown;
        }

        StatementKind::from_keyword(leading).unwrap_or(StatementKind::Unknown)
    }

    /// Cut trailing whitespace, comments and semicolons, then append the ceiling.
    fn append_limit(sql: &str, tokens: &[TokenWithSpan], row_limit: u64) -> String {
        let trailing_start = tokens
            .iter()
            .rposition(|t| !Self::is_insignificant(&t.token) && t.token != Token::SemiColon)
            .and_then(|idx| tokens.get(idx + 1))
            .map(|t| Self::byte_offset(sql, &t.span.start))
            .unwrap_or(sql.len());

        let body = sql[..trailing_start].trim();
        format!("{} LIMIT {}", body, row_limit)
    }

    /// Convert a 1-based line/column location into a byte offset in `sql`.
    fn byte_offset(sql: &str, location: &Location) -> usize {
        let mut offset = 0;
        for (line_no, line) in sql.split_inclusive('\n').enumerate() {
            if (line_no as u64) + 1 == location.line {
                let column = location.column.saturating_sub(1) as usize;
                return offset
                    + line
                        .char_indices()
                        .nth(column)
                        .map(|(idx, _)| idx)
                        .unwrap_or(line.len());
            }
            offset += line.len();
        }
        sql.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [DatabaseType; 3] = [DatabaseType::PostgreSQL, DatabaseType::MySQL, DatabaseType::Sqlite];

    fn validate(sql: &str) -> Result<String, AppError> {
        SqlValidator::validate(sql, DatabaseType::PostgreSQL)
    }

    #[test]
    fn test_validate_select_only() {
        for db in ALL {
            assert!(SqlValidator::validate("SELECT * FROM users", db).is_ok());

            for sql in [
                "INSERT INTO users VALUES (1)",
                "UPDATE users SET name = 'test'",
                "DELETE FROM users",
                "DROP TABLE users",
                "CREATE TABLE t (id int)",
                "ALTER TABLE users ADD COLUMN age int",
            ] {
                let err = SqlValidator::validate(sql, db).unwrap_err();
                assert!(matches!(err, AppError::InvalidSql(_)), "{} should be rejected on {}", sql, db);
            }
        }
    }

    #[test]
    fn test_rejection_names_detected_kind() {
        let err = validate("DROP TABLE users").unwrap_err();
        assert_eq!(err.to_string(), "Only SELECT statements are allowed, found: DROP");

        let err = validate("SHOW TABLES").unwrap_err();
        assert!(err.to_string().contains("UNKNOWN"));
    }

    #[test]
    fn test_empty_and_comment_only_input() {
        for db in ALL {
            for sql in ["", "   \n\t", "-- just a comment", "/* block */", ";", " ; ; "] {
                let err = SqlValidator::validate(sql, db).unwrap_err();
                assert_eq!(err.to_string(), "Empty SQL query", "input {:?} on {}", sql, db);
            }
        }
    }

    #[test]
    fn test_multiple_statements_rejected() {
        for db in ALL {
            let err = SqlValidator::validate("SELECT 1; SELECT 2", db).unwrap_err();
            assert!(err.to_string().starts_with("Multiple statements are not allowed"));

            let err = SqlValidator::validate("SELECT * FROM users; DROP TABLE users", db).unwrap_err();
            assert!(err.to_string().starts_with("Multiple statements are not allowed"));
        }
    }

    #[test]
    fn test_comment_nesting_follows_target() {
        let sql = "SELECT 1 LIMIT 1 /* /* */ ; DROP TABLE t; -- */";

        // MySQL and SQLite close the comment at the first `*/`.
        for db in [DatabaseType::MySQL, DatabaseType::Sqlite] {
            let err = SqlValidator::validate(sql, db).unwrap_err();
            assert!(
                err.to_string().starts_with("Multiple statements are not allowed"),
                "{}: {}",
                db,
                err
            );
        }

        // PostgreSQL nests block comments, so the whole tail is one comment.
        assert_eq!(SqlValidator::validate(sql, DatabaseType::PostgreSQL).unwrap(), sql);
    }

    #[test]
    fn test_dollar_quoting_follows_target() {
        let sql = "SELECT $$ ; DROP TABLE t; $$";
        assert!(SqlValidator::validate(sql, DatabaseType::PostgreSQL).is_ok());

        for db in [DatabaseType::MySQL, DatabaseType::Sqlite] {
            let err = SqlValidator::validate(sql, db).unwrap_err();
            assert!(err.to_string().starts_with("Multiple statements are not allowed"));
        }
    }

    #[test]
    fn test_mysql_hash_comment_does_not_swallow_limit() {
        let sql = SqlValidator::validate("SELECT * FROM big # all rows", DatabaseType::MySQL).unwrap();
        assert_eq!(sql, "SELECT * FROM big LIMIT 1000");

        let err = SqlValidator::validate("SELECT 1 # ; DROP TABLE t\n; DELETE FROM t", DatabaseType::MySQL).unwrap_err();
        assert!(err.to_string().starts_with("Multiple statements are not allowed"));
    }

    #[test]
    fn test_mysql_executable_comment_rejected() {
        let err = SqlValidator::validate("SELECT 1 /*!50000 , SLEEP(10) */", DatabaseType::MySQL).unwrap_err();
        assert!(err.to_string().contains("executable comments"));

        // Optimizer hints are ordinary comments.
        assert!(SqlValidator::validate("SELECT /*+ NO_ICP(t) */ * FROM t", DatabaseType::MySQL).is_ok());
    }

    #[test]
    fn test_semicolon_inside_literal_is_not_a_separator() {
        for db in ALL {
            let sql = SqlValidator::validate("SELECT ';' AS sep", db).unwrap();
            assert_eq!(sql, "SELECT ';' AS sep LIMIT 1000");
        }
    }

    #[test]
    fn test_appends_limit_when_missing() {
        assert_eq!(validate("SELECT * FROM users").unwrap(), "SELECT * FROM users LIMIT 1000");
        assert_eq!(validate("SELECT * FROM users;").unwrap(), "SELECT * FROM users LIMIT 1000");
        assert_eq!(
            validate("  SELECT id\nFROM users ;\n").unwrap(),
            "SELECT id\nFROM users LIMIT 1000"
        );
    }

    #[test]
    fn test_trailing_line_comment_does_not_swallow_limit() {
        for db in ALL {
            let sql = SqlValidator::validate("SELECT * FROM users -- all of them", db).unwrap();
            assert_eq!(sql, "SELECT * FROM users LIMIT 1000");
        }
    }

    #[test]
    fn test_explicit_limit_is_kept() {
        let sql = "SELECT * FROM users LIMIT 5000";
        assert_eq!(validate(sql).unwrap(), sql);

        let sql = "select * from users limit 10 offset 5;";
        assert_eq!(validate(sql).unwrap(), sql);
    }

    #[test]
    fn test_limit_substring_counts_as_present() {
        // Textual scan: literals and identifiers containing LIMIT suppress the rewrite.
        let sql = "SELECT 'no limit here' AS note FROM t";
        assert_eq!(validate(sql).unwrap(), sql);

        let sql = "SELECT * FROM table_limit";
        assert_eq!(validate(sql).unwrap(), sql);
    }

    #[test]
    fn test_revalidation_is_idempotent() {
        let once = validate("SELECT name FROM users WHERE id > 3").unwrap();
        let twice = validate(&once).unwrap();
        assert_eq!(once, twice);
        assert_eq!(twice.matches("LIMIT").count(), 1);
    }

    #[test]
    fn test_custom_ceiling() {
        let sql = SqlValidator::validate_with_limit("SELECT 1", DatabaseType::Sqlite, 25).unwrap();
        assert_eq!(sql, "SELECT 1 LIMIT 25");
    }

    #[test]
    fn test_cte_classification() {
        let db = DatabaseType::PostgreSQL;
        assert_eq!(
            SqlValidator::statement_kind("WITH recent AS (SELECT * FROM orders) SELECT * FROM recent", db).unwrap(),
            StatementKind::Select
        );
        assert_eq!(
            SqlValidator::statement_kind(
                "WITH gone AS (SELECT id FROM t) DELETE FROM t WHERE id IN (SELECT id FROM gone)",
                db
            )
            .unwrap(),
            StatementKind::Delete
        );
        assert!(validate("WITH x AS (SELECT 1) SELECT * FROM x").is_ok());
    }

    #[test]
    fn test_parenthesized_and_commented_select() {
        for db in ALL {
            assert_eq!(
                SqlValidator::statement_kind("(SELECT 1) UNION (SELECT 2)", db).unwrap(),
                StatementKind::Select
            );
            assert_eq!(
                SqlValidator::statement_kind("/* report */ -- daily\nSELECT 1", db).unwrap(),
                StatementKind::Select
            );
        }
    }

    #[test]
    fn test_unterminated_literal_is_invalid() {
        let err = validate("SELECT 'oops FROM users").unwrap_err();
        assert!(err.to_string().starts_with("Failed to parse SQL"));
    }
}
