//! Stored SQL functions: `CREATE FUNCTION` interception, catalog storage and
//! `/rest/v1/rpc/{name}` execution.
//!
//! Only `LANGUAGE sql` bodies are accepted; everything else is rejected up
//! front rather than half-translated. Bodies are translated once at
//! declaration time; argument and auth substitution happen per call.

use std::str::FromStr;

use serde_json::{Map, Value};
use sqlparser::tokenizer::Token;
use sqlx::{Row, SqliteConnection};

use crate::auth::AuthContext;
use crate::catalog::read_type_name;
use crate::error::DbError;
use crate::rest::decode_column_value;
use crate::rls::{auth_call_at, claim_selector, text_or_null};
use crate::translate::{
    emit, is_ws, matching_close, next_sig, run_passes, tokenize, translate_sql, word_value, Piece,
};
use crate::types::{PgType, SqlArg};
use crate::Database;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Volatility {
    Volatile,
    Stable,
    Immutable,
}

impl Volatility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Volatility::Volatile => "volatile",
            Volatility::Stable => "stable",
            Volatility::Immutable => "immutable",
        }
    }
}

impl FromStr for Volatility {
    type Err = DbError;

    fn from_str(value: &str) -> Result<Self, DbError> {
        match value.to_ascii_lowercase().as_str() {
            "volatile" => Ok(Volatility::Volatile),
            "stable" => Ok(Volatility::Stable),
            "immutable" => Ok(Volatility::Immutable),
            other => Err(DbError::BadRequest(format!("unknown volatility '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Security {
    Invoker,
    Definer,
}

impl Security {
    pub fn as_str(&self) -> &'static str {
        match self {
            Security::Invoker => "invoker",
            Security::Definer => "definer",
        }
    }
}

impl FromStr for Security {
    type Err = DbError;

    fn from_str(value: &str) -> Result<Self, DbError> {
        match value.to_ascii_lowercase().as_str() {
            "invoker" => Ok(Security::Invoker),
            "definer" => Ok(Security::Definer),
            other => Err(DbError::BadRequest(format!("unknown security '{other}'"))),
        }
    }
}

/// One declared argument, position-ordered.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionArg {
    pub name: String,
    pub pg_type: PgType,
    pub position: i64,
    pub default_value: Option<String>,
}

/// A stored function definition.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub language: String,
    pub return_type: String,
    pub returns_set: bool,
    pub volatility: Volatility,
    pub security: Security,
    pub source_pg: String,
    pub source_sqlite: String,
    pub args: Vec<FunctionArg>,
}

/// Result of invoking a stored function, shaped per the declared return type.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcResult {
    Scalar(Value),
    Row(Value),
    Set(Vec<Value>),
}

#[derive(Debug)]
pub(crate) struct ParsedFunction {
    pub def: FunctionDef,
    pub or_replace: bool,
}

impl Database {
    pub async fn fetch_function(&self, name: &str) -> Result<Option<FunctionDef>, DbError> {
        let Some(row) = sqlx::query(
            "SELECT name, language, return_type, returns_set, volatility, security, \
             source_pg, source_sqlite FROM _rpc_functions WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let volatility: String = row.try_get("volatility").map_err(DbError::from_sqlx)?;
        let security: String = row.try_get("security").map_err(DbError::from_sqlx)?;
        let mut def = FunctionDef {
            name: row.try_get("name").map_err(DbError::from_sqlx)?,
            language: row.try_get("language").map_err(DbError::from_sqlx)?,
            return_type: row.try_get("return_type").map_err(DbError::from_sqlx)?,
            returns_set: row.try_get("returns_set").map_err(DbError::from_sqlx)?,
            volatility: Volatility::from_str(&volatility)?,
            security: Security::from_str(&security)?,
            source_pg: row.try_get("source_pg").map_err(DbError::from_sqlx)?,
            source_sqlite: row.try_get("source_sqlite").map_err(DbError::from_sqlx)?,
            args: Vec::new(),
        };

        let arg_rows = sqlx::query(
            "SELECT arg_name, pg_type, position, default_value \
             FROM _rpc_function_args WHERE function_name = ? ORDER BY position",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        for row in arg_rows {
            let pg_type: String = row.try_get("pg_type").map_err(DbError::from_sqlx)?;
            def.args.push(FunctionArg {
                name: row.try_get("arg_name").map_err(DbError::from_sqlx)?,
                pg_type: PgType::from_str(&pg_type)?,
                position: row.try_get("position").map_err(DbError::from_sqlx)?,
                default_value: row.try_get("default_value").map_err(DbError::from_sqlx)?,
            });
        }
        Ok(Some(def))
    }

    /// Handles `CREATE [OR REPLACE] FUNCTION` / `DROP FUNCTION` statements on
    /// behalf of the migration runner and the dashboard. Returns false when
    /// the statement is neither.
    pub(crate) async fn intercept_function_ddl(
        &self,
        conn: &mut SqliteConnection,
        stmt: &str,
    ) -> Result<bool, DbError> {
        if let Some(parsed) = parse_create_function(stmt)? {
            let exists: Option<String> =
                sqlx::query_scalar("SELECT name FROM _rpc_functions WHERE name = ?")
                    .bind(&parsed.def.name)
                    .fetch_optional(&mut *conn)
                    .await?;
            if exists.is_some() && !parsed.or_replace {
                return Err(DbError::DuplicateFunction(parsed.def.name));
            }
            self.store_function(conn, &parsed.def).await?;
            return Ok(true);
        }
        if let Some((name, if_exists)) = parse_drop_function(stmt)? {
            let removed = sqlx::query("DELETE FROM _rpc_functions WHERE name = ?")
                .bind(&name)
                .execute(&mut *conn)
                .await?
                .rows_affected();
            sqlx::query("DELETE FROM _rpc_function_args WHERE function_name = ?")
                .bind(&name)
                .execute(&mut *conn)
                .await?;
            if removed == 0 && !if_exists {
                return Err(DbError::UndefinedFunction(name));
            }
            return Ok(true);
        }
        Ok(false)
    }

    async fn store_function(
        &self,
        conn: &mut SqliteConnection,
        def: &FunctionDef,
    ) -> Result<(), DbError> {
        let now = chrono::Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO _rpc_functions (
                name, language, return_type, returns_set, volatility, security,
                source_pg, source_sqlite, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (name) DO UPDATE SET
                language = excluded.language,
                return_type = excluded.return_type,
                returns_set = excluded.returns_set,
                volatility = excluded.volatility,
                security = excluded.security,
                source_pg = excluded.source_pg,
                source_sqlite = excluded.source_sqlite,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&def.name)
        .bind(&def.language)
        .bind(&def.return_type)
        .bind(def.returns_set)
        .bind(def.volatility.as_str())
        .bind(def.security.as_str())
        .bind(&def.source_pg)
        .bind(&def.source_sqlite)
        .bind(&now)
        .bind(&now)
        .execute(&mut *conn)
        .await?;

        sqlx::query("DELETE FROM _rpc_function_args WHERE function_name = ?")
            .bind(&def.name)
            .execute(&mut *conn)
            .await?;
        for arg in &def.args {
            sqlx::query(
                "INSERT INTO _rpc_function_args \
                 (function_name, position, arg_name, pg_type, default_value) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&def.name)
            .bind(arg.position)
            .bind(&arg.name)
            .bind(arg.pg_type.as_str())
            .bind(&arg.default_value)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    /// Invokes a stored function with JSON-named arguments.
    pub async fn call_function(
        &self,
        name: &str,
        provided: &Map<String, Value>,
        ctx: &AuthContext,
    ) -> Result<RpcResult, DbError> {
        let def = self
            .fetch_function(name)
            .await?
            .ok_or_else(|| DbError::UndefinedFunction(name.to_string()))?;

        for key in provided.keys() {
            if !def.args.iter().any(|a| a.name.eq_ignore_ascii_case(key)) {
                return Err(DbError::UndefinedFunction(format!(
                    "{name}({})",
                    provided.keys().cloned().collect::<Vec<_>>().join(", ")
                )));
            }
        }

        let mut exec_ctx = ctx.clone();
        if def.security == Security::Definer {
            exec_ctx.bypass_rls = true;
        }

        let statements = prepare_statements(&def, provided, &exec_ctx)?;
        let mut tx = self.pool.begin().await?;
        let mut rows = Vec::new();
        let last = statements.len().saturating_sub(1);
        for (i, (sql, args)) in statements.into_iter().enumerate() {
            let mut query = sqlx::query(&sql);
            for arg in args {
                query = arg.bind(query);
            }
            if i == last {
                rows = query.fetch_all(&mut *tx).await?;
            } else {
                query.execute(&mut *tx).await?;
            }
        }
        tx.commit().await?;

        shape_result(&def, &rows)
    }
}

/// Expands `:name` placeholders and auth helpers into positional binds, per
/// statement of the stored body. Both substitutions happen in one
/// left-to-right scan so binds line up with `?` order.
fn prepare_statements(
    def: &FunctionDef,
    provided: &Map<String, Value>,
    ctx: &AuthContext,
) -> Result<Vec<(String, Vec<SqlArg>)>, DbError> {
    let pieces = tokenize(&def.source_sqlite)?;
    let mut statements = Vec::new();
    let mut current: Vec<Piece> = Vec::new();
    for piece in pieces {
        if matches!(piece, Piece::Tok(Token::SemiColon)) {
            if current.iter().any(|p| !is_ws(p)) {
                statements.push(std::mem::take(&mut current));
            } else {
                current.clear();
            }
        } else {
            current.push(piece);
        }
    }
    if current.iter().any(|p| !is_ws(p)) {
        statements.push(current);
    }

    let mut prepared = Vec::with_capacity(statements.len());
    for stmt_pieces in statements {
        let (pieces, args) = bind_statement(def, provided, ctx, stmt_pieces)?;
        prepared.push((emit(&pieces).trim().to_string(), args));
    }
    Ok(prepared)
}

/// Replaces `:arg` occurrences (validated against the declared types, with
/// translated defaults inlined for omitted args) and `auth.*` helpers.
fn bind_statement(
    def: &FunctionDef,
    provided: &Map<String, Value>,
    ctx: &AuthContext,
    pieces: Vec<Piece>,
) -> Result<(Vec<Piece>, Vec<SqlArg>), DbError> {
    let mut out: Vec<Piece> = Vec::with_capacity(pieces.len());
    let mut args: Vec<SqlArg> = Vec::new();
    let mut i = 0;
    while i < pieces.len() {
        if let Some((func, after_call)) = auth_call_at(&pieces, i) {
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
                    if let Some((claim, after_claim)) = claim_selector(&pieces, after_call) {
                        out.push(Piece::Raw("?".into()));
                        args.push(text_or_null(ctx.claim_text(&claim)));
                        i = after_claim;
                    } else {
                        out.push(Piece::Raw("?".into()));
                        args.push(SqlArg::Text(
                            Value::Object(ctx.claims.clone()).to_string(),
                        ));
                        i = after_call;
                    }
                    continue;
                }
                _ => {}
            }
        }
        if matches!(&pieces[i], Piece::Tok(Token::Colon)) {
            if let Some(word_idx) = next_sig(&pieces, i + 1) {
                if let Some(word) = word_value(&pieces[word_idx]) {
                    if let Some(arg) = def
                        .args
                        .iter()
                        .find(|a| a.name.eq_ignore_ascii_case(word))
                    {
                        match provided.iter().find(|(k, _)| k.eq_ignore_ascii_case(&arg.name)) {
                            Some((_, value)) => {
                                args.push(arg.pg_type.validate(&arg.name, value)?);
                                out.push(Piece::Raw("?".into()));
                            }
                            None => match &arg.default_value {
                                Some(default) => {
                                    let translated = translate_sql(default)?;
                                    out.push(Piece::Raw(format!("({translated})")));
                                }
                                None => {
                                    return Err(DbError::MissingArgument {
                                        function: def.name.clone(),
                                        arg: arg.name.clone(),
                                    });
                                }
                            },
                        }
                        i = word_idx + 1;
                        continue;
                    }
                }
            }
        }
        out.push(pieces[i].clone());
        i += 1;
    }
    Ok((out, args))
}

fn shape_result(def: &FunctionDef, rows: &[sqlx::sqlite::SqliteRow]) -> Result<RpcResult, DbError> {
    if def.returns_set {
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(Value::Object(crate::rest::row_to_json(row, None)?));
        }
        return Ok(RpcResult::Set(out));
    }
    if def.return_type == "void" {
        return Ok(RpcResult::Scalar(Value::Null));
    }
    if PgType::is_scalar(&def.return_type) {
        let Some(row) = rows.first() else {
            return Ok(RpcResult::Scalar(Value::Null));
        };
        let pg = PgType::from_str(&def.return_type).ok();
        let value = decode_column_value(row, 0, pg)?;
        return Ok(RpcResult::Scalar(value));
    }
    let Some(row) = rows.first() else {
        return Ok(RpcResult::Row(Value::Null));
    };
    Ok(RpcResult::Row(Value::Object(crate::rest::row_to_json(
        row, None,
    )?)))
}

/// Parses a `CREATE [OR REPLACE] FUNCTION` statement. Returns None when the
/// statement is something else entirely; rejection of unsupported function
/// forms is an error, not a pass-through.
pub(crate) fn parse_create_function(stmt: &str) -> Result<Option<ParsedFunction>, DbError> {
    let pieces = tokenize(stmt)?;
    let Some(after_create) = expect(&pieces, &["create"], 0) else {
        return Ok(None);
    };
    let (or_replace, after_head) = match expect(&pieces, &["or", "replace"], after_create) {
        Some(at) => (true, at),
        None => (false, after_create),
    };
    let Some(after_fn) = expect(&pieces, &["function"], after_head) else {
        return Ok(None);
    };

    let (name, cursor) = read_qualified_ident(&pieces, after_fn)
        .ok_or_else(|| DbError::BadRequest("CREATE FUNCTION: missing function name".into()))?;
    let open = next_sig(&pieces, cursor)
        .filter(|&i| matches!(&pieces[i], Piece::Tok(Token::LParen)))
        .ok_or_else(|| DbError::BadRequest("CREATE FUNCTION: missing argument list".into()))?;
    let close = matching_close(&pieces, open)
        .ok_or_else(|| DbError::BadRequest("CREATE FUNCTION: unbalanced argument list".into()))?;
    let args = parse_args(&pieces[open + 1..close])?;

    let after_returns = expect(&pieces, &["returns"], close + 1).ok_or_else(|| {
        DbError::BadRequest("CREATE FUNCTION: RETURNS clause is required".into())
    })?;
    let (return_type, returns_set, mut cursor) = parse_return_spec(&pieces, after_returns)?;

    let mut language: Option<String> = None;
    let mut volatility = Volatility::Volatile;
    let mut security = Security::Invoker;
    let mut body: Option<String> = None;

    while let Some(i) = next_sig(&pieces, cursor) {
        match word_value(&pieces[i])
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("language") => {
                let lang_idx = next_sig(&pieces, i + 1).ok_or_else(|| {
                    DbError::BadRequest("CREATE FUNCTION: LANGUAGE requires a name".into())
                })?;
                let lang = word_value(&pieces[lang_idx])
                    .ok_or_else(|| {
                        DbError::BadRequest("CREATE FUNCTION: LANGUAGE requires a name".into())
                    })?
                    .to_ascii_lowercase();
                language = Some(lang);
                cursor = lang_idx + 1;
            }
            Some("volatile") | Some("stable") | Some("immutable") => {
                volatility = Volatility::from_str(word_value(&pieces[i]).unwrap())?;
                cursor = i + 1;
            }
            Some("security") => {
                let kind_idx = next_sig(&pieces, i + 1).ok_or_else(|| {
                    DbError::BadRequest("CREATE FUNCTION: SECURITY requires INVOKER or DEFINER".into())
                })?;
                let kind = word_value(&pieces[kind_idx]).ok_or_else(|| {
                    DbError::BadRequest("CREATE FUNCTION: SECURITY requires INVOKER or DEFINER".into())
                })?;
                security = Security::from_str(kind)?;
                cursor = kind_idx + 1;
            }
            Some("as") => {
                let body_idx = next_sig(&pieces, i + 1).ok_or_else(|| {
                    DbError::BadRequest("CREATE FUNCTION: AS requires a body".into())
                })?;
                body = Some(match &pieces[body_idx] {
                    Piece::Tok(Token::DollarQuotedString(d)) => d.value.clone(),
                    Piece::Tok(Token::SingleQuotedString(s)) => s.clone(),
                    _ => {
                        return Err(DbError::BadRequest(
                            "CREATE FUNCTION: body must be a quoted string".into(),
                        ))
                    }
                });
                cursor = body_idx + 1;
            }
            _ => cursor = i + 1,
        }
    }

    let language = language.unwrap_or_else(|| "sql".to_string());
    if language != "sql" {
        return Err(DbError::UnsupportedLanguage(language));
    }
    let body = body
        .ok_or_else(|| DbError::BadRequest("CREATE FUNCTION: missing AS body".into()))?
        .trim()
        .to_string();

    let source_sqlite = parameterize_body(&body, &args)?;

    Ok(Some(ParsedFunction {
        def: FunctionDef {
            name,
            language,
            return_type,
            returns_set,
            volatility,
            security,
            source_pg: body,
            source_sqlite,
            args,
        },
        or_replace,
    }))
}

/// Translates the body and replaces bare argument identifiers with `:name`
/// placeholders. The stored text is deterministic for a given body + args.
fn parameterize_body(body: &str, args: &[FunctionArg]) -> Result<String, DbError> {
    let pieces = run_passes(tokenize(body)?);
    let mut out: Vec<Piece> = Vec::with_capacity(pieces.len());
    let mut i = 0;
    while i < pieces.len() {
        if let Some(word) = word_value(&pieces[i]) {
            let is_arg = args.iter().any(|a| a.name.eq_ignore_ascii_case(word));
            let qualified = i > 0 && matches!(&pieces[i - 1], Piece::Tok(Token::Period));
            let called = next_sig(&pieces, i + 1)
                .is_some_and(|j| matches!(&pieces[j], Piece::Tok(Token::LParen)));
            if is_arg && !qualified && !called {
                let canonical = args
                    .iter()
                    .find(|a| a.name.eq_ignore_ascii_case(word))
                    .unwrap()
                    .name
                    .clone();
                out.push(Piece::Raw(format!(":{canonical}")));
                i += 1;
                continue;
            }
        }
        out.push(pieces[i].clone());
        i += 1;
    }
    Ok(emit(&out).trim().to_string())
}

fn parse_args(pieces: &[Piece]) -> Result<Vec<FunctionArg>, DbError> {
    let mut args = Vec::new();
    let mut depth = 0usize;
    let mut current: Vec<Piece> = Vec::new();
    let mut defs: Vec<Vec<Piece>> = Vec::new();
    for piece in pieces {
        match piece {
            Piece::Tok(Token::LParen) => {
                depth += 1;
                current.push(piece.clone());
            }
            Piece::Tok(Token::RParen) => {
                depth = depth.saturating_sub(1);
                current.push(piece.clone());
            }
            Piece::Tok(Token::Comma) if depth == 0 => defs.push(std::mem::take(&mut current)),
            _ => current.push(piece.clone()),
        }
    }
    if current.iter().any(|p| !is_ws(p)) {
        defs.push(current);
    }

    for (position, def) in defs.into_iter().enumerate() {
        let mut at = next_sig(&def, 0)
            .ok_or_else(|| DbError::BadRequest("CREATE FUNCTION: empty argument".into()))?;
        // Skip an IN/OUT/INOUT mode prefix.
        if word_value(&def[at])
            .is_some_and(|w| matches!(w.to_ascii_lowercase().as_str(), "in" | "out" | "inout"))
        {
            at = next_sig(&def, at + 1)
                .ok_or_else(|| DbError::BadRequest("CREATE FUNCTION: incomplete argument".into()))?;
        }
        let name = match &def[at] {
            Piece::Tok(Token::Word(w)) => w.value.clone(),
            _ => {
                return Err(DbError::BadRequest(
                    "CREATE FUNCTION: argument name expected".into(),
                ))
            }
        };
        let type_at = next_sig(&def, at + 1).ok_or_else(|| {
            DbError::BadRequest(format!("CREATE FUNCTION: argument '{name}' has no type"))
        })?;
        let (type_name, after_type) = read_type_name(&def, type_at).ok_or_else(|| {
            DbError::BadRequest(format!("CREATE FUNCTION: argument '{name}' has no type"))
        })?;
        let pg_type = PgType::from_str(&type_name)?;

        // DEFAULT expr or = expr.
        let mut default_value = None;
        if let Some(i) = next_sig(&def, after_type) {
            let is_default_kw = word_value(&def[i])
                .is_some_and(|w| w.eq_ignore_ascii_case("default"));
            let is_eq = matches!(&def[i], Piece::Tok(Token::Eq));
            if is_default_kw || is_eq {
                let expr = crate::translate::emit_pg(&def[i + 1..]).trim().to_string();
                if expr.is_empty() {
                    return Err(DbError::BadRequest(format!(
                        "CREATE FUNCTION: argument '{name}' has an empty default"
                    )));
                }
                default_value = Some(expr);
            }
        }

        args.push(FunctionArg {
            name,
            pg_type,
            position: position as i64,
            default_value,
        });
    }
    Ok(args)
}

/// `RETURNS integer | SETOF type | TABLE(col type, …) | void`.
fn parse_return_spec(pieces: &[Piece], at: usize) -> Result<(String, bool, usize), DbError> {
    let first = next_sig(pieces, at)
        .ok_or_else(|| DbError::BadRequest("CREATE FUNCTION: empty RETURNS clause".into()))?;
    let word = word_value(&pieces[first])
        .map(str::to_ascii_lowercase)
        .ok_or_else(|| DbError::BadRequest("CREATE FUNCTION: invalid RETURNS clause".into()))?;
    match word.as_str() {
        "setof" => {
            let type_idx = next_sig(pieces, first + 1).ok_or_else(|| {
                DbError::BadRequest("CREATE FUNCTION: SETOF requires a type".into())
            })?;
            let inner = word_value(&pieces[type_idx])
                .map(str::to_ascii_lowercase)
                .ok_or_else(|| {
                    DbError::BadRequest("CREATE FUNCTION: SETOF requires a type".into())
                })?;
            Ok((inner, true, type_idx + 1))
        }
        "table" => {
            let open = next_sig(pieces, first + 1)
                .filter(|&i| matches!(&pieces[i], Piece::Tok(Token::LParen)))
                .ok_or_else(|| {
                    DbError::BadRequest("CREATE FUNCTION: TABLE requires a column list".into())
                })?;
            let close = matching_close(pieces, open).ok_or_else(|| {
                DbError::BadRequest("CREATE FUNCTION: unbalanced TABLE column list".into())
            })?;
            Ok(("table".into(), true, close + 1))
        }
        _ => Ok((word, false, first + 1)),
    }
}

/// `DROP FUNCTION [IF EXISTS] name[(args)]` → (name, if_exists).
pub(crate) fn parse_drop_function(stmt: &str) -> Result<Option<(String, bool)>, DbError> {
    let pieces = tokenize(stmt)?;
    let Some(after) = expect(&pieces, &["drop", "function"], 0) else {
        return Ok(None);
    };
    let (if_exists, after) = match expect(&pieces, &["if", "exists"], after) {
        Some(at) => (true, at),
        None => (false, after),
    };
    let (name, _) = read_qualified_ident(&pieces, after)
        .ok_or_else(|| DbError::BadRequest("DROP FUNCTION: missing function name".into()))?;
    Ok(Some((name, if_exists)))
}

fn expect(pieces: &[Piece], words: &[&str], mut at: usize) -> Option<usize> {
    for expected in words {
        let i = next_sig(pieces, at)?;
        if !word_value(&pieces[i]).is_some_and(|w| w.eq_ignore_ascii_case(expected)) {
            return None;
        }
        at = i + 1;
    }
    Some(at)
}

fn read_qualified_ident(pieces: &[Piece], at: usize) -> Option<(String, usize)> {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_function_parses_the_acceptance_grammar() {
        let parsed = parse_create_function(
            "CREATE FUNCTION add(a integer, b integer) RETURNS integer LANGUAGE sql \
             AS $$ SELECT a + b $$",
        )
        .unwrap()
        .unwrap();
        assert!(!parsed.or_replace);
        let def = parsed.def;
        assert_eq!(def.name, "add");
        assert_eq!(def.return_type, "integer");
        assert!(!def.returns_set);
        assert_eq!(def.args.len(), 2);
        assert_eq!(def.args[0].name, "a");
        assert_eq!(def.args[1].pg_type, PgType::Integer);
        assert_eq!(def.source_sqlite, "SELECT :a + :b");
        assert_eq!(def.source_pg, "SELECT a + b");
    }

    #[test]
    fn or_replace_and_attributes_parse() {
        let parsed = parse_create_function(
            "CREATE OR REPLACE FUNCTION who() RETURNS text LANGUAGE sql STABLE \
             SECURITY DEFINER AS $fn$ SELECT auth.uid() $fn$",
        )
        .unwrap()
        .unwrap();
        assert!(parsed.or_replace);
        assert_eq!(parsed.def.volatility, Volatility::Stable);
        assert_eq!(parsed.def.security, Security::Definer);
    }

    #[test]
    fn setof_and_table_return_specs_mark_sets() {
        let parsed = parse_create_function(
            "CREATE FUNCTION list_all() RETURNS SETOF notes LANGUAGE sql AS $$ SELECT * FROM notes $$",
        )
        .unwrap()
        .unwrap();
        assert!(parsed.def.returns_set);
        assert_eq!(parsed.def.return_type, "notes");

        let parsed = parse_create_function(
            "CREATE FUNCTION pairs() RETURNS TABLE(a text, b integer) LANGUAGE sql AS $$ SELECT 'x', 1 $$",
        )
        .unwrap()
        .unwrap();
        assert!(parsed.def.returns_set);
    }

    #[test]
    fn non_sql_languages_are_rejected() {
        let err = parse_create_function(
            "CREATE FUNCTION f() RETURNS integer LANGUAGE plpgsql AS $$ BEGIN END $$",
        )
        .unwrap_err();
        assert!(matches!(err, DbError::UnsupportedLanguage(lang) if lang == "plpgsql"));
    }

    #[test]
    fn argument_defaults_are_kept() {
        let parsed = parse_create_function(
            "CREATE FUNCTION greet(name text DEFAULT 'world') RETURNS text LANGUAGE sql \
             AS $$ SELECT 'hi ' || name $$",
        )
        .unwrap()
        .unwrap();
        assert_eq!(parsed.def.args[0].default_value.as_deref(), Some("'world'"));
        assert_eq!(parsed.def.source_sqlite, "SELECT 'hi ' || :name");
    }

    #[test]
    fn arg_names_inside_strings_are_not_parameterized() {
        let parsed = parse_create_function(
            "CREATE FUNCTION f(a text) RETURNS text LANGUAGE sql AS $$ SELECT 'a' || a $$",
        )
        .unwrap()
        .unwrap();
        assert_eq!(parsed.def.source_sqlite, "SELECT 'a' || :a");
    }

    #[test]
    fn drop_function_parses() {
        assert_eq!(
            parse_drop_function("DROP FUNCTION add").unwrap(),
            Some(("add".into(), false))
        );
        assert_eq!(
            parse_drop_function("DROP FUNCTION IF EXISTS public.add").unwrap(),
            Some(("add".into(), true))
        );
        assert_eq!(parse_drop_function("DROP TABLE x").unwrap(), None);
    }

    #[test]
    fn other_statements_are_not_function_ddl() {
        assert!(parse_create_function("CREATE TABLE t (x text)")
            .unwrap()
            .is_none());
    }
}
