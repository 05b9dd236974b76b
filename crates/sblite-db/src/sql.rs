//! Raw SQL execution: the statement dispatcher shared by the migration
//! runner and the dashboard SQL browser.
//!
//! Every statement takes the same path: function DDL and policy DDL are
//! intercepted into their catalogs, table DDL is observed into `_columns`,
//! and whatever remains is translated and executed against SQLite.

use serde::Serialize;
use serde_json::Value;
use sqlx::{Column, Row, SqliteConnection};

use crate::auth::AuthContext;
use crate::error::DbError;
use crate::rest::row_to_json;
use crate::rls::{parse_policy_ddl, substitute_auth};
use crate::translate::{emit, run_passes, split_statements, tokenize};
use crate::Database;

/// What one dispatched statement did.
#[derive(Debug)]
pub(crate) enum StatementOutcome {
    /// Handled by the function or policy catalogs; nothing ran on SQLite.
    Intercepted,
    Executed {
        rows_affected: u64,
    },
    Rows {
        columns: Vec<String>,
        rows: Vec<Value>,
    },
}

/// Outcome of one dashboard statement, including the translation diagnostics
/// the SQL browser displays.
#[derive(Debug, Serialize)]
pub struct SqlOutcome {
    pub columns: Vec<String>,
    pub rows: Vec<Value>,
    pub rows_affected: u64,
    pub sql_original: String,
    pub sql_translated: String,
}

impl Database {
    /// Dispatches one statement inside the caller's transaction.
    pub(crate) async fn dispatch_statement(
        &self,
        conn: &mut SqliteConnection,
        stmt: &str,
        ctx: &AuthContext,
        want_rows: bool,
    ) -> Result<(StatementOutcome, String), DbError> {
        if self.intercept_function_ddl(conn, stmt).await? {
            return Ok((StatementOutcome::Intercepted, String::new()));
        }
        if let Some(ddl) = parse_policy_ddl(stmt)? {
            self.apply_policy_ddl(conn, ddl).await?;
            return Ok((StatementOutcome::Intercepted, String::new()));
        }
        self.observe_ddl(conn, stmt).await?;

        let pieces = run_passes(tokenize(stmt)?);
        let (pieces, args) = substitute_auth(pieces, ctx);
        let translated = emit(&pieces).trim().to_string();

        let mut query = sqlx::query(&translated);
        for arg in args {
            query = arg.bind(query);
        }

        if want_rows && returns_rows(&translated) {
            let fetched = query.fetch_all(conn).await?;
            let columns = fetched
                .first()
                .map(|row| {
                    row.columns()
                        .iter()
                        .map(|c| c.name().to_string())
                        .collect()
                })
                .unwrap_or_default();
            let mut rows = Vec::with_capacity(fetched.len());
            for row in &fetched {
                rows.push(Value::Object(row_to_json(row, None)?));
            }
            Ok((StatementOutcome::Rows { columns, rows }, translated))
        } else {
            let result = query.execute(conn).await?;
            Ok((
                StatementOutcome::Executed {
                    rows_affected: result.rows_affected(),
                },
                translated,
            ))
        }
    }

    /// Dashboard SQL browser entry point: runs a whole script atomically and
    /// returns per-statement diagnostics. Service-role gating happens at the
    /// HTTP layer; the auth context still drives `auth.*` substitution.
    pub async fn execute_script(
        &self,
        sql: &str,
        ctx: &AuthContext,
    ) -> Result<Vec<SqlOutcome>, DbError> {
        let statements = split_statements(sql)?;
        let mut tx = self.pool.begin().await?;
        let mut outcomes = Vec::with_capacity(statements.len());
        for stmt in &statements {
            let (outcome, translated) = self
                .dispatch_statement(&mut *tx, stmt, ctx, true)
                .await?;
            outcomes.push(match outcome {
                StatementOutcome::Rows { columns, rows } => SqlOutcome {
                    columns,
                    rows,
                    rows_affected: 0,
                    sql_original: stmt.clone(),
                    sql_translated: translated,
                },
                StatementOutcome::Executed { rows_affected } => SqlOutcome {
                    columns: Vec::new(),
                    rows: Vec::new(),
                    rows_affected,
                    sql_original: stmt.clone(),
                    sql_translated: translated,
                },
                StatementOutcome::Intercepted => SqlOutcome {
                    columns: Vec::new(),
                    rows: Vec::new(),
                    rows_affected: 0,
                    sql_original: stmt.clone(),
                    sql_translated: String::new(),
                },
            });
        }
        tx.commit().await?;
        self.invalidate_catalog();
        self.invalidate_policies();
        Ok(outcomes)
    }
}

fn returns_rows(sql: &str) -> bool {
    let head = sql
        .trim_start()
        .split_whitespace()
        .next()
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    matches!(head.as_str(), "select" | "with" | "pragma" | "values" | "explain")
        || sql.to_ascii_lowercase().contains(" returning ")
}
