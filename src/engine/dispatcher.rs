//! Query Dispatcher
//!
//! Engine-agnostic half of `execute`: statement classification, script
//! splitting, draining rows into text and the one place where a decoded cell
//! becomes display text. Adapters only supply a [`RowDecoder`] for their
//! engine and hand over their pool.

use std::future::Future;
use std::time::Instant;

use futures::TryStreamExt;
use sqlx::{Column, Database, Executor, Pool, Row};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::engine::error::{Cancelled, DriverError, DriverResult};
use crate::engine::traits::Driver;
use crate::engine::types::{QueryResult, Value};

const ROW_PRODUCING_PREFIXES: [&str; 5] = ["SELECT", "WITH", "EXPLAIN", "DESCRIBE", "SHOW"];

/// Per-engine decoding of raw rows into [`Value`]s.
pub trait RowDecoder: Database {
    fn decode_cell(row: &<Self as Database>::Row, index: usize) -> Value;

    fn rows_affected(done: &<Self as Database>::QueryResult) -> u64;
}

/// True for statements expected to return rows. A prefix check, not a parser.
pub fn is_row_producing(sql: &str) -> bool {
    let head = sql.trim_start().to_uppercase();
    ROW_PRODUCING_PREFIXES
        .iter()
        .any(|prefix| head.starts_with(prefix))
}

/// Splits a script on semicolons that sit outside single or double quotes.
///
/// Inside quotes a backslash keeps the next character verbatim. Blank
/// statements are dropped and a final statement without `;` is kept.
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut escaped = false;

    for ch in sql.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }

        match ch {
            '\\' if in_single || in_double => {
                current.push(ch);
                escaped = true;
            }
            '\'' if !in_double => {
                in_single = !in_single;
                current.push(ch);
            }
            '"' if !in_single => {
                in_double = !in_double;
                current.push(ch);
            }
            ';' if !in_single && !in_double => {
                push_statement(&mut statements, &current);
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    push_statement(&mut statements, &current);

    statements
}

fn push_statement(statements: &mut Vec<String>, raw: &str) {
    let trimmed = raw.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_string());
    }
}

/// Renders a decoded cell for the result grid.
pub fn display_text(value: Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::UInt(u) => u.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Decimal(d) => d.to_string(),
        Value::Text(s) => s,
        Value::Bytes(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Value::Json(json) => json.to_string(),
    }
}

/// Races `work` against the caller's token.
pub async fn with_cancel<F>(cancel: &CancellationToken, work: F) -> Result<F::Output, Cancelled>
where
    F: Future,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Cancelled),
        output = work => Ok(output),
    }
}

/// Runs one statement on `pool` and normalizes the outcome.
pub async fn execute_on<DB>(
    pool: &Pool<DB>,
    cancel: &CancellationToken,
    sql: &str,
) -> DriverResult<QueryResult>
where
    DB: RowDecoder,
    for<'c> &'c mut <DB as Database>::Connection: Executor<'c, Database = DB>,
{
    let start = Instant::now();

    if !is_row_producing(sql) {
        let done = with_cancel(cancel, sqlx::raw_sql(sql).execute(pool))
            .await
            .map_err(DriverError::query)?
            .map_err(DriverError::query)?;

        return Ok(QueryResult::with_affected_rows(
            DB::rows_affected(&done),
            start.elapsed(),
        ));
    }

    let drain = async {
        let mut stream = sqlx::raw_sql(sql).fetch(pool);
        let mut columns: Option<Vec<String>> = None;
        let mut rows = Vec::new();

        while let Some(row) = stream.try_next().await? {
            if columns.is_none() {
                columns = Some(row.columns().iter().map(|c| c.name().to_string()).collect());
            }
            let cells = (0..row.len())
                .map(|idx| display_text(DB::decode_cell(&row, idx)))
                .collect::<Vec<_>>();
            rows.push(cells);
        }

        Ok::<_, sqlx::Error>((columns, rows))
    };

    let (columns, rows) = with_cancel(cancel, drain)
        .await
        .map_err(DriverError::query)?
        .map_err(DriverError::query)?;
    let duration = start.elapsed();

    let columns = match columns {
        Some(columns) => columns,
        None => describe_columns(pool, sql).await,
    };

    Ok(QueryResult::with_rows(columns, rows, duration))
}

/// Column names for a statement that produced no rows. Best effort: some
/// statements cannot be prepared, those report no columns.
async fn describe_columns<DB>(pool: &Pool<DB>, sql: &str) -> Vec<String>
where
    DB: Database,
    for<'c> &'c mut <DB as Database>::Connection: Executor<'c, Database = DB>,
{
    match pool.describe(sql).await {
        Ok(describe) => describe
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect(),
        Err(e) => {
            debug!(error = %e, "could not describe empty result set");
            Vec::new()
        }
    }
}

/// Outcome of running a multi-statement script
#[derive(Debug)]
pub struct ScriptOutcome {
    /// Results of the statements that ran, in order
    pub results: Vec<QueryResult>,
    /// Index of the failing statement and its error, if any
    pub error: Option<(usize, DriverError)>,
}

impl ScriptOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Splits `sql` and executes each statement in order, stopping at the first failure.
#[instrument(skip(driver, cancel, sql), fields(engine = %driver.engine()))]
pub async fn execute_script(
    driver: &dyn Driver,
    cancel: &CancellationToken,
    sql: &str,
) -> ScriptOutcome {
    let statements = split_statements(sql);
    debug!(statements = statements.len(), "executing script");

    let mut results = Vec::with_capacity(statements.len());
    for (index, statement) in statements.iter().enumerate() {
        match driver.execute(cancel, statement).await {
            Ok(result) => results.push(result),
            Err(e) => {
                return ScriptOutcome {
                    results,
                    error: Some((index, e)),
                }
            }
        }
    }

    ScriptOutcome {
        results,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_top_level_semicolons() {
        assert_eq!(
            split_statements("SELECT 1; SELECT 2;"),
            vec!["SELECT 1", "SELECT 2"]
        );
    }

    #[test]
    fn quoted_semicolons_are_not_boundaries() {
        assert_eq!(split_statements("SELECT 'a;b'"), vec!["SELECT 'a;b'"]);
        assert_eq!(
            split_statements(r#"SELECT "x;y" FROM t; SELECT 2"#),
            vec![r#"SELECT "x;y" FROM t"#, "SELECT 2"]
        );
    }

    #[test]
    fn trailing_statement_without_terminator_is_kept() {
        assert_eq!(
            split_statements("INSERT INTO t VALUES (1);\nSELECT * FROM t"),
            vec!["INSERT INTO t VALUES (1)", "SELECT * FROM t"]
        );
    }

    #[test]
    fn blank_statements_are_dropped() {
        assert_eq!(split_statements(" ;  ; \n\t;SELECT 1;;"), vec!["SELECT 1"]);
        assert!(split_statements("   ").is_empty());
    }

    #[test]
    fn backslash_escapes_inside_quotes() {
        assert_eq!(
            split_statements(r"SELECT 'it\'s; fine'; SELECT 2"),
            vec![r"SELECT 'it\'s; fine'", "SELECT 2"]
        );
        assert_eq!(
            split_statements(r#"SELECT "a\";b"; SELECT 3"#),
            vec![r#"SELECT "a\";b""#, "SELECT 3"]
        );
    }

    #[test]
    fn one_quote_kind_hides_the_other() {
        assert_eq!(
            split_statements(r#"SELECT 'say "hi;' ; SELECT "it's;""#),
            vec![r#"SELECT 'say "hi;'"#, r#"SELECT "it's;""#]
        );
    }

    #[test]
    fn classification_uses_prefixes() {
        assert!(is_row_producing("SELECT * FROM t"));
        assert!(is_row_producing("  \n select 1"));
        assert!(is_row_producing("WITH x AS (SELECT 1) SELECT * FROM x"));
        assert!(is_row_producing("EXPLAIN SELECT * FROM t"));
        assert!(is_row_producing("describe t"));
        assert!(is_row_producing("SHOW TABLES"));

        assert!(!is_row_producing("UPDATE t SET x = 1"));
        assert!(!is_row_producing("INSERT INTO t VALUES (1)"));
        assert!(!is_row_producing("CREATE TABLE t (id INT)"));
        assert!(!is_row_producing(""));
    }

    #[test]
    fn display_text_formats_each_value_kind() {
        assert_eq!(display_text(Value::Null), "NULL");
        assert_eq!(display_text(Value::Bool(true)), "true");
        assert_eq!(display_text(Value::Bool(false)), "false");
        assert_eq!(display_text(Value::Bytes(b"abc".to_vec())), "abc");
        assert_eq!(display_text(Value::Int(-7)), "-7");
        assert_eq!(display_text(Value::UInt(u64::MAX)), "18446744073709551615");
        assert_eq!(display_text(Value::Float(1.5)), "1.5");
        assert_eq!(display_text(Value::Text("plain".into())), "plain");
        assert_eq!(
            display_text(Value::Decimal("12.50".parse().expect("decimal"))),
            "12.50"
        );
        assert_eq!(
            display_text(Value::Json(serde_json::json!({"a": 1}))),
            r#"{"a":1}"#
        );
    }

    #[tokio::test]
    async fn with_cancel_prefers_the_token() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = with_cancel(&cancel, std::future::pending::<()>()).await;
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn with_cancel_passes_through_finished_work() {
        let cancel = CancellationToken::new();
        let outcome = with_cancel(&cancel, async { 42 }).await;
        assert_eq!(outcome.ok(), Some(42));
    }
}
