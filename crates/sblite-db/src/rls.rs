//! Row-Level Security: policy storage, DDL interception, and per-request
//! predicate compilation.
//!
//! Policies are stored as raw PostgreSQL expressions in `_rls_policies` and
//! compiled on demand: `auth.uid()` / `auth.role()` / `auth.jwt()->>'claim'`
//! become bound parameters from the request context, then the expression runs
//! through the standard translation passes.

use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use sqlparser::tokenizer::Token;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::error::DbError;
use crate::translate::{
    emit, emit_pg, matching_close, next_sig, run_passes, tokenize, word_value, Piece,
};
use crate::types::{SqlArg, SqlPredicate};
use crate::Database;

/// Which commands a policy applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyCommand {
    Select,
    Insert,
    Update,
    Delete,
    All,
}

impl PolicyCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyCommand::Select => "SELECT",
            PolicyCommand::Insert => "INSERT",
            PolicyCommand::Update => "UPDATE",
            PolicyCommand::Delete => "DELETE",
            PolicyCommand::All => "ALL",
        }
    }
}

impl FromStr for PolicyCommand {
    type Err = DbError;

    fn from_str(value: &str) -> Result<Self, DbError> {
        match value.to_ascii_uppercase().as_str() {
            "SELECT" => Ok(PolicyCommand::Select),
            "INSERT" => Ok(PolicyCommand::Insert),
            "UPDATE" => Ok(PolicyCommand::Update),
            "DELETE" => Ok(PolicyCommand::Delete),
            "ALL" => Ok(PolicyCommand::All),
            other => Err(DbError::BadRequest(format!(
                "unknown policy command '{other}'"
            ))),
        }
    }
}

/// The operation RLS is being evaluated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RlsAction {
    Select,
    Insert,
    Update,
    Delete,
}

impl RlsAction {
    fn matches(&self, command: PolicyCommand) -> bool {
        matches!(
            (self, command),
            (_, PolicyCommand::All)
                | (RlsAction::Select, PolicyCommand::Select)
                | (RlsAction::Insert, PolicyCommand::Insert)
                | (RlsAction::Update, PolicyCommand::Update)
                | (RlsAction::Delete, PolicyCommand::Delete)
        )
    }
}

/// Persisted RLS policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RlsPolicy {
    pub id: Uuid,
    pub table: String,
    pub name: String,
    pub command: PolicyCommand,
    pub using_expr: Option<String>,
    pub check_expr: Option<String>,
    pub enabled: bool,
}

/// Cached per-table policy state: the RLS flag plus every stored policy.
#[derive(Debug, Clone, Default)]
pub struct TablePolicies {
    pub rls_enabled: bool,
    pub policies: Vec<RlsPolicy>,
}

/// Predicates to inject around one statement. `deny` short-circuits the
/// request: reads return the empty set, writes fail with `42501`.
#[derive(Debug, Clone, Default)]
pub struct StatementGuards {
    pub visible: Option<SqlPredicate>,
    pub check: Option<SqlPredicate>,
    pub deny: bool,
}

impl Database {
    /// Policy state for a table, cache-backed.
    pub async fn table_policies(&self, table: &str) -> Result<Arc<TablePolicies>, DbError> {
        if let Some(hit) = self.policy_cache.read().get(table) {
            return Ok(hit.clone());
        }
        let rls_enabled = self
            .dashboard_get(&format!("rls_enabled:{table}"))
            .await?
            .as_deref()
            == Some("true");
        let rows = sqlx::query(
            "SELECT id, table_name, policy_name, command, using_expr, check_expr, enabled \
             FROM _rls_policies WHERE table_name = ? ORDER BY policy_name",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;
        let mut policies = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id").map_err(DbError::from_sqlx)?;
            let command: String = row.try_get("command").map_err(DbError::from_sqlx)?;
            policies.push(RlsPolicy {
                id: Uuid::parse_str(&id)
                    .map_err(|err| DbError::Internal(format!("bad policy id: {err}")))?,
                table: row.try_get("table_name").map_err(DbError::from_sqlx)?,
                name: row.try_get("policy_name").map_err(DbError::from_sqlx)?,
                command: PolicyCommand::from_str(&command)?,
                using_expr: row.try_get("using_expr").map_err(DbError::from_sqlx)?,
                check_expr: row.try_get("check_expr").map_err(DbError::from_sqlx)?,
                enabled: row.try_get("enabled").map_err(DbError::from_sqlx)?,
            });
        }
        let state = Arc::new(TablePolicies {
            rls_enabled,
            policies,
        });
        self.policy_cache
            .write()
            .insert(table.to_string(), state.clone());
        Ok(state)
    }

    /// Compiles the guards for (table, action, context). This is the single
    /// evaluation entry point for the REST compiler and the RPC executor.
    pub async fn rls_guards(
        &self,
        table: &str,
        action: RlsAction,
        ctx: &AuthContext,
    ) -> Result<StatementGuards, DbError> {
        if ctx.bypass_rls {
            return Ok(StatementGuards::default());
        }
        let state = self.table_policies(table).await?;
        if !state.rls_enabled {
            return Ok(StatementGuards::default());
        }
        let matching: Vec<&RlsPolicy> = state
            .policies
            .iter()
            .filter(|p| p.enabled && action.matches(p.command))
            .collect();
        if matching.is_empty() {
            return Ok(StatementGuards {
                deny: true,
                ..Default::default()
            });
        }

        let visible = match action {
            RlsAction::Insert => None,
            _ => {
                let exprs: Vec<&str> = matching
                    .iter()
                    .filter_map(|p| p.using_expr.as_deref())
                    .collect();
                if exprs.is_empty() {
                    return Ok(StatementGuards {
                        deny: true,
                        ..Default::default()
                    });
                }
                Some(or_join(&exprs, ctx)?)
            }
        };

        let check = match action {
            RlsAction::Insert | RlsAction::Update => {
                let exprs: Vec<&str> = matching
                    .iter()
                    .filter_map(|p| p.check_expr.as_deref().or(p.using_expr.as_deref()))
                    .collect();
                if exprs.is_empty() {
                    return Ok(StatementGuards {
                        deny: true,
                        ..Default::default()
                    });
                }
                Some(or_join(&exprs, ctx)?)
            }
            _ => None,
        };

        Ok(StatementGuards {
            visible,
            check,
            deny: false,
        })
    }

    /// Applies an intercepted policy DDL statement inside the caller's
    /// transaction.
    pub(crate) async fn apply_policy_ddl(
        &self,
        conn: &mut SqliteConnection,
        ddl: PolicyDdl,
    ) -> Result<(), DbError> {
        match ddl {
            PolicyDdl::Create {
                table,
                name,
                command,
                using_expr,
                check_expr,
            } => {
                let now = Utc::now().to_rfc3339();
                sqlx::query(
                    r#"
                    INSERT INTO _rls_policies (
                        id, table_name, policy_name, command, using_expr, check_expr,
                        enabled, created_at, updated_at
                    ) VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)
                    ON CONFLICT (table_name, policy_name) DO UPDATE SET
                        command = excluded.command,
                        using_expr = excluded.using_expr,
                        check_expr = excluded.check_expr,
                        enabled = 1,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(Uuid::new_v4().to_string())
                .bind(&table)
                .bind(&name)
                .bind(command.as_str())
                .bind(&using_expr)
                .bind(&check_expr)
                .bind(&now)
                .bind(&now)
                .execute(conn)
                .await?;
            }
            PolicyDdl::Drop { table, name } => {
                sqlx::query("DELETE FROM _rls_policies WHERE table_name = ? AND policy_name = ?")
                    .bind(&table)
                    .bind(&name)
                    .execute(conn)
                    .await?;
            }
            PolicyDdl::SetRls { table, enabled } => {
                self.dashboard_set_on(
                    conn,
                    &format!("rls_enabled:{table}"),
                    if enabled { "true" } else { "false" },
                )
                .await?;
            }
        }
        self.invalidate_policies();
        Ok(())
    }

    pub(crate) fn invalidate_policies(&self) {
        self.policy_cache.write().clear();
    }
}

fn or_join(exprs: &[&str], ctx: &AuthContext) -> Result<SqlPredicate, DbError> {
    let mut sql = String::new();
    let mut args = Vec::new();
    for (i, expr) in exprs.iter().enumerate() {
        if i > 0 {
            sql.push_str(" OR ");
        }
        let compiled = compile_policy_expr(expr, ctx)?;
        sql.push('(');
        sql.push_str(&compiled.sql);
        sql.push(')');
        args.extend(compiled.args);
    }
    Ok(SqlPredicate::new(sql, args))
}

/// Translates one policy expression and substitutes the auth helpers with
/// bound placeholders, left to right so binds line up with `?` order.
pub(crate) fn compile_policy_expr(
    expr: &str,
    ctx: &AuthContext,
) -> Result<SqlPredicate, DbError> {
    let pieces = run_passes(tokenize(expr)?);
    let (pieces, args) = substitute_auth(pieces, ctx);
    Ok(SqlPredicate::new(emit(&pieces).trim().to_string(), args))
}

/// Replaces `auth.uid()`, `auth.role()` and `auth.jwt()` (optionally followed
/// by `->> 'claim'`) with `?` placeholders, collecting binds in order.
pub(crate) fn substitute_auth(
    pieces: Vec<Piece>,
    ctx: &AuthContext,
) -> (Vec<Piece>, Vec<SqlArg>) {
    let mut out: Vec<Piece> = Vec::with_capacity(pieces.len());
    let mut args: Vec<SqlArg> = Vec::new();
    let mut i = 0;
    while i < pieces.len() {
        if let Some(call) = auth_call_at(&pieces, i) {
            let (func, after_call) = call;
            match func.as_str() {
                "uid" => {
                    out.push(Piece::Raw("?".into()));
                    args.push(text_or_null(ctx.user_id.clone()));
                    i = after_call;
                    continue;
                }
                "role" => {
                    out.push(Piece::Raw("?".into()));
                    args.push(SqlArg::Text(ctx.role.as_str().to_string()));
                    i = after_call;
                    continue;
                }
                "jwt" => {
                    // auth.jwt() ->> 'claim' binds the claim text; a bare
                    // auth.jwt() binds the whole claim object as JSON.
                    if let Some((claim, after_claim)) = claim_selector(&pieces, after_call) {
                        out.push(Piece::Raw("?".into()));
                        args.push(text_or_null(ctx.claim_text(&claim)));
                        i = after_claim;
                    } else {
                        out.push(Piece::Raw("?".into()));
                        args.push(SqlArg::Text(
                            serde_json::Value::Object(ctx.claims.clone()).to_string(),
                        ));
                        i = after_call;
                    }
                    continue;
                }
                _ => {}
            }
        }
        out.push(pieces[i].clone());
        i += 1;
    }
    (out, args)
}

pub(crate) fn text_or_null(value: Option<String>) -> SqlArg {
    match value {
        Some(v) => SqlArg::Text(v),
        None => SqlArg::Null,
    }
}

/// Matches `auth . <func> ( )` starting at `i`; returns the function name and
/// the index just past the closing paren.
pub(crate) fn auth_call_at(pieces: &[Piece], i: usize) -> Option<(String, usize)> {
    if !word_value(&pieces[i]).is_some_and(|w| w.eq_ignore_ascii_case("auth")) {
        return None;
    }
    let dot = next_sig(pieces, i + 1)?;
    if !matches!(&pieces[dot], Piece::Tok(Token::Period)) {
        return None;
    }
    let func_idx = next_sig(pieces, dot + 1)?;
    let func = word_value(&pieces[func_idx])?.to_ascii_lowercase();
    let open = next_sig(pieces, func_idx + 1)?;
    if !matches!(&pieces[open], Piece::Tok(Token::LParen)) {
        return None;
    }
    let close = matching_close(pieces, open)?;
    Some((func, close + 1))
}

/// Matches `->> 'claim'` starting at `from`.
pub(crate) fn claim_selector(pieces: &[Piece], from: usize) -> Option<(String, usize)> {
    let arrow = next_sig(pieces, from)?;
    if !matches!(&pieces[arrow], Piece::Tok(Token::LongArrow)) {
        return None;
    }
    let lit = next_sig(pieces, arrow + 1)?;
    if let Piece::Tok(Token::SingleQuotedString(claim)) = &pieces[lit] {
        Some((claim.clone(), lit + 1))
    } else {
        None
    }
}

/// Intercepted policy-related DDL.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PolicyDdl {
    Create {
        table: String,
        name: String,
        command: PolicyCommand,
        using_expr: Option<String>,
        check_expr: Option<String>,
    },
    Drop {
        table: String,
        name: String,
    },
    SetRls {
        table: String,
        enabled: bool,
    },
}

/// Recognizes `CREATE POLICY`, `DROP POLICY` and the `ALTER TABLE … ROW LEVEL
/// SECURITY` toggles. Returns None for anything else.
pub(crate) fn parse_policy_ddl(stmt: &str) -> Result<Option<PolicyDdl>, DbError> {
    let pieces = tokenize(stmt)?;

    if let Some(after) = expect_words(&pieces, &["create", "policy"], 0) {
        let (name, cursor) = read_ident(&pieces, after)
            .ok_or_else(|| DbError::BadRequest("CREATE POLICY: missing policy name".into()))?;
        let after_on = expect_words(&pieces, &["on"], cursor)
            .ok_or_else(|| DbError::BadRequest("CREATE POLICY: missing ON <table>".into()))?;
        let (table, mut cursor) = read_ident(&pieces, after_on)
            .ok_or_else(|| DbError::BadRequest("CREATE POLICY: missing table name".into()))?;

        let mut command = PolicyCommand::All;
        let mut using_expr = None;
        let mut check_expr = None;
        while let Some(i) = next_sig(&pieces, cursor) {
            match word_value(&pieces[i]).map(str::to_ascii_lowercase).as_deref() {
                Some("as") => {
                    // PERMISSIVE/RESTRICTIVE; only permissive semantics exist here.
                    cursor = next_sig(&pieces, i + 1).map(|j| j + 1).unwrap_or(i + 1);
                }
                Some("for") => {
                    let cmd_idx = next_sig(&pieces, i + 1).ok_or_else(|| {
                        DbError::BadRequest("CREATE POLICY: FOR requires a command".into())
                    })?;
                    let cmd = word_value(&pieces[cmd_idx]).ok_or_else(|| {
                        DbError::BadRequest("CREATE POLICY: FOR requires a command".into())
                    })?;
                    command = PolicyCommand::from_str(cmd)?;
                    cursor = cmd_idx + 1;
                }
                Some("to") => {
                    // Role lists are accepted and ignored; sblite's roles are
                    // fixed and enforced via the auth context.
                    cursor = i + 1;
                    while let Some(j) = next_sig(&pieces, cursor) {
                        match word_value(&pieces[j]).map(str::to_ascii_lowercase).as_deref() {
                            Some("using") | Some("with") => break,
                            Some(_) => cursor = j + 1,
                            None if matches!(&pieces[j], Piece::Tok(Token::Comma)) => {
                                cursor = j + 1
                            }
                            None => break,
                        }
                    }
                }
                Some("using") => {
                    let (expr, next) = read_paren_expr(&pieces, i + 1)?;
                    using_expr = Some(expr);
                    cursor = next;
                }
                Some("with") => {
                    let after_check = expect_words(&pieces, &["with", "check"], i)
                        .ok_or_else(|| {
                            DbError::BadRequest("CREATE POLICY: WITH must be WITH CHECK".into())
                        })?;
                    let (expr, next) = read_paren_expr(&pieces, after_check)?;
                    check_expr = Some(expr);
                    cursor = next;
                }
                _ => cursor = i + 1,
            }
        }

        return Ok(Some(PolicyDdl::Create {
            table,
            name,
            command,
            using_expr,
            check_expr,
        }));
    }

    if let Some(after) = expect_words(&pieces, &["drop", "policy"], 0) {
        let after = expect_words(&pieces, &["if", "exists"], after).unwrap_or(after);
        let (name, cursor) = read_ident(&pieces, after)
            .ok_or_else(|| DbError::BadRequest("DROP POLICY: missing policy name".into()))?;
        let after_on = expect_words(&pieces, &["on"], cursor)
            .ok_or_else(|| DbError::BadRequest("DROP POLICY: missing ON <table>".into()))?;
        let (table, _) = read_ident(&pieces, after_on)
            .ok_or_else(|| DbError::BadRequest("DROP POLICY: missing table name".into()))?;
        return Ok(Some(PolicyDdl::Drop { table, name }));
    }

    if let Some(after) = expect_words(&pieces, &["alter", "table"], 0) {
        if let Some((table, cursor)) = read_ident(&pieces, after) {
            for (words, enabled) in [
                (["enable", "row", "level", "security"], true),
                (["disable", "row", "level", "security"], false),
            ] {
                if expect_words(&pieces, &words, cursor).is_some() {
                    return Ok(Some(PolicyDdl::SetRls { table, enabled }));
                }
            }
        }
    }

    Ok(None)
}

fn expect_words(pieces: &[Piece], words: &[&str], mut at: usize) -> Option<usize> {
    for expect in words {
        let i = next_sig(pieces, at)?;
        if !word_value(&pieces[i]).is_some_and(|w| w.eq_ignore_ascii_case(expect)) {
            return None;
        }
        at = i + 1;
    }
    Some(at)
}

/// Reads a possibly schema-qualified, possibly quoted identifier.
fn read_ident(pieces: &[Piece], at: usize) -> Option<(String, usize)> {
    let i = next_sig(pieces, at)?;
    let mut name = match &pieces[i] {
        Piece::Tok(Token::Word(w)) => w.value.clone(),
        _ => return None,
    };
    let mut cursor = i + 1;
    while let Some(dot) = next_sig(pieces, cursor) {
        if !matches!(&pieces[dot], Piece::Tok(Token::Period)) {
            break;
        }
        let part = next_sig(pieces, dot + 1)?;
        name = match &pieces[part] {
            Piece::Tok(Token::Word(w)) => w.value.clone(),
            _ => return None,
        };
        cursor = part + 1;
    }
    Some((name, cursor))
}

/// Reads a balanced `( … )` group, returning the interior in PostgreSQL
/// spelling and the index past the close paren.
fn read_paren_expr(pieces: &[Piece], at: usize) -> Result<(String, usize), DbError> {
    let open = next_sig(pieces, at)
        .filter(|&i| matches!(&pieces[i], Piece::Tok(Token::LParen)))
        .ok_or_else(|| DbError::BadRequest("expected a parenthesized expression".into()))?;
    let close = matching_close(pieces, open)
        .ok_or_else(|| DbError::BadRequest("unbalanced parens in policy expression".into()))?;
    Ok((
        emit_pg(&pieces[open + 1..close]).trim().to_string(),
        close + 1,
    ))
}
