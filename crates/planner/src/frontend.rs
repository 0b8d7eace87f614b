//! SQL frontend: parsing and statement-kind classification.
//!
//! Only plain `SELECT` statements enter the analysis pipeline; everything
//! else is classified here so the control layer can route administrative
//! statements without invoking the planner.

use smq_common::{Result, SmqError};
use sqlparser::ast::{Expr, Query, Select, SetExpr, Statement};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

/// Parse `sql` into exactly one `SELECT` statement.
///
/// Error taxonomy:
/// - `Syntax`: the grammar rejects the text
/// - `Unsupported`: multiple statements, or a statement kind the planner
///   does not analyze
pub fn parse_select(sql: &str) -> Result<Statement> {
    let dialect = GenericDialect {};
    let mut stmts =
        Parser::parse_sql(&dialect, sql).map_err(|e| SmqError::Syntax(e.to_string()))?;
    if stmts.len() != 1 {
        return Err(SmqError::Unsupported(
            "exactly one statement per submission".to_string(),
        ));
    }
    let stmt = stmts.remove(0);
    match &stmt {
        Statement::Query(q) => {
            if !matches!(q.body.as_ref(), SetExpr::Select(_)) {
                return Err(SmqError::Unsupported(
                    "only plain SELECT queries are analyzed".to_string(),
                ));
            }
        }
        _ => {
            return Err(SmqError::Unsupported(
                "only SELECT statements are analyzed".to_string(),
            ))
        }
    }
    Ok(stmt)
}

/// Parse one scalar expression, used when synthesizing rewritten select
/// items and injected predicates.
pub fn parse_expr(sql: &str) -> Result<Expr> {
    let dialect = GenericDialect {};
    Parser::new(&dialect)
        .try_with_sql(sql)
        .map_err(|e| SmqError::Internal(format!("expression synthesis failed: {e}")))?
        .parse_expr()
        .map_err(|e| SmqError::Internal(format!("expression synthesis failed: {e}")))
}

/// Borrow the `Select` body of a statement produced by [`parse_select`].
pub fn select_of(stmt: &Statement) -> Result<&Select> {
    query_of(stmt).and_then(|q| match q.body.as_ref() {
        SetExpr::Select(s) => Ok(s.as_ref()),
        _ => Err(SmqError::Internal("statement lost its SELECT body".to_string())),
    })
}

/// Mutably borrow the `Select` body of a statement.
pub fn select_of_mut(stmt: &mut Statement) -> Result<&mut Select> {
    match stmt {
        Statement::Query(q) => match q.body.as_mut() {
            SetExpr::Select(s) => Ok(s.as_mut()),
            _ => Err(SmqError::Internal("statement lost its SELECT body".to_string())),
        },
        _ => Err(SmqError::Internal("statement is not a query".to_string())),
    }
}

/// Borrow the `Query` node of a statement.
pub fn query_of(stmt: &Statement) -> Result<&Query> {
    match stmt {
        Statement::Query(q) => Ok(q.as_ref()),
        _ => Err(SmqError::Internal("statement is not a query".to_string())),
    }
}

/// Mutably borrow the `Query` node of a statement.
pub fn query_of_mut(stmt: &mut Statement) -> Result<&mut Query> {
    match stmt {
        Statement::Query(q) => Ok(q.as_mut()),
        _ => Err(SmqError::Internal("statement is not a query".to_string())),
    }
}

/// Coarse classification of a submitted statement.
///
/// Detection is token-based on purpose: administrative forms such as
/// `FLUSH CHUNKS CACHE` are not part of the SQL grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    /// A SELECT; goes through the analysis pipeline.
    Select,
    /// `DROP DATABASE <db>` / `DROP SCHEMA <db>`.
    DropDb {
        db: String,
    },
    /// `DROP TABLE [db.]<table>`.
    DropTable {
        db: Option<String>,
        table: String,
    },
    /// `FLUSH CHUNKS CACHE [FOR <db>]`.
    FlushChunksCache {
        db: Option<String>,
    },
    /// Anything else.
    Other,
}

impl StatementKind {
    /// Classify raw statement text.
    pub fn classify(sql: &str) -> StatementKind {
        let tokens: Vec<String> = sql
            .trim()
            .trim_end_matches(';')
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let upper: Vec<String> = tokens.iter().map(|t| t.to_uppercase()).collect();
        match upper.first().map(String::as_str) {
            Some("SELECT") => StatementKind::Select,
            Some("DROP") => match upper.get(1).map(String::as_str) {
                Some("DATABASE") | Some("SCHEMA") => match tokens.get(2) {
                    Some(db) => StatementKind::DropDb { db: db.clone() },
                    None => StatementKind::Other,
                },
                Some("TABLE") => match tokens.get(2) {
                    Some(name) => {
                        let (db, table) = match name.split_once('.') {
                            Some((db, table)) => (Some(db.to_string()), table.to_string()),
                            None => (None, name.clone()),
                        };
                        StatementKind::DropTable { db, table }
                    }
                    None => StatementKind::Other,
                },
                _ => StatementKind::Other,
            },
            Some("FLUSH")
                if upper.get(1).map(String::as_str) == Some("CHUNKS")
                    && upper.get(2).map(String::as_str) == Some("CACHE") =>
            {
                let db = if upper.get(3).map(String::as_str) == Some("FOR") {
                    tokens.get(4).cloned()
                } else {
                    None
                };
                StatementKind::FlushChunksCache { db }
            }
            _ => StatementKind::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_select_parses() {
        assert!(parse_select("SELECT ra, decl FROM Object WHERE objectId=1").is_ok());
    }

    #[test]
    fn garbage_is_a_syntax_error() {
        match parse_select("SELEKT everything") {
            Err(SmqError::Syntax(_)) => {}
            other => panic!("expected syntax error, got {other:?}"),
        }
    }

    #[test]
    fn multiple_statements_rejected() {
        assert!(matches!(
            parse_select("SELECT 1; SELECT 2"),
            Err(SmqError::Unsupported(_))
        ));
    }

    #[test]
    fn non_select_rejected() {
        assert!(matches!(
            parse_select("INSERT INTO t VALUES (1)"),
            Err(SmqError::Unsupported(_))
        ));
    }

    #[test]
    fn classification() {
        assert_eq!(
            StatementKind::classify("select * from Object"),
            StatementKind::Select
        );
        assert_eq!(
            StatementKind::classify("DROP DATABASE Winter2013;"),
            StatementKind::DropDb {
                db: "Winter2013".to_string()
            }
        );
        assert_eq!(
            StatementKind::classify("DROP TABLE LSST.Object"),
            StatementKind::DropTable {
                db: Some("LSST".to_string()),
                table: "Object".to_string()
            }
        );
        assert_eq!(
            StatementKind::classify("FLUSH CHUNKS CACHE FOR LSST"),
            StatementKind::FlushChunksCache {
                db: Some("LSST".to_string())
            }
        );
        assert_eq!(
            StatementKind::classify("FLUSH CHUNKS CACHE"),
            StatementKind::FlushChunksCache { db: None }
        );
        assert_eq!(StatementKind::classify("SHOW TABLES"), StatementKind::Other);
    }
}
