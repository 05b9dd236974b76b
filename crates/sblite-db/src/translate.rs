//! PostgreSQL → SQLite translation passes.
//!
//! Everything here operates on the `sqlparser` PostgreSQL token stream, never
//! on raw strings, so quoted literals and dollar-quoted bodies are opaque to
//! every rewrite. Unrecognized constructs pass through unchanged; SQLite
//! reports anything that is still not executable.

use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::keywords::Keyword;
use sqlparser::tokenizer::{Token, Tokenizer, Word};

use crate::error::DbError;

/// SQLite expression producing a v4-shaped UUID string. Parenthesized so it
/// stays legal in `DEFAULT` position.
const UUID_V4_SQL: &str = "(lower(hex(randomblob(4))) || '-' || lower(hex(randomblob(2))) \
|| '-4' || substr(lower(hex(randomblob(2))),2) || '-' \
|| substr('89ab', abs(random()) % 4 + 1, 1) || substr(lower(hex(randomblob(2))),2) \
|| '-' || lower(hex(randomblob(6))))";

/// A translation unit: either an untouched source token or already-rewritten
/// SQLite text that later passes treat as an opaque primary expression.
#[derive(Debug, Clone)]
pub(crate) enum Piece {
    Tok(Token),
    Raw(String),
}

pub(crate) fn tokenize(sql: &str) -> Result<Vec<Piece>, DbError> {
    let dialect = PostgreSqlDialect {};
    let tokens = Tokenizer::new(&dialect, sql)
        .tokenize()
        .map_err(|err| DbError::BadRequest(format!("unparseable SQL: {err}")))?;
    Ok(tokens.into_iter().map(Piece::Tok).collect())
}

/// Re-emits pieces as SQLite-executable text. Dollar-quoted literals become
/// standard single-quoted literals since SQLite has no dollar quoting.
pub(crate) fn emit(pieces: &[Piece]) -> String {
    let mut out = String::new();
    for piece in pieces {
        match piece {
            Piece::Raw(s) => out.push_str(s),
            Piece::Tok(t) => emit_token(&mut out, t, true),
        }
    }
    out
}

/// Re-emits pieces preserving PostgreSQL spelling (dollar quotes intact).
/// Used by the statement splitter, which must hand original statements to the
/// function/policy interceptors.
pub(crate) fn emit_pg(pieces: &[Piece]) -> String {
    let mut out = String::new();
    for piece in pieces {
        match piece {
            Piece::Raw(s) => out.push_str(s),
            Piece::Tok(t) => emit_token(&mut out, t, false),
        }
    }
    out
}

fn emit_token(out: &mut String, token: &Token, sqlite: bool) {
    match token {
        Token::SingleQuotedString(s) => {
            out.push('\'');
            out.push_str(&s.replace('\'', "''"));
            out.push('\'');
        }
        Token::DollarQuotedString(d) => {
            if sqlite {
                out.push('\'');
                out.push_str(&d.value.replace('\'', "''"));
                out.push('\'');
            } else {
                let tag = d.tag.as_deref().unwrap_or("");
                out.push('$');
                out.push_str(tag);
                out.push('$');
                out.push_str(&d.value);
                out.push('$');
                out.push_str(tag);
                out.push('$');
            }
        }
        Token::Number(n, _) => out.push_str(n),
        other => out.push_str(&other.to_string()),
    }
}

pub(crate) fn is_ws(piece: &Piece) -> bool {
    matches!(piece, Piece::Tok(Token::Whitespace(_)))
}

pub(crate) fn word_value(piece: &Piece) -> Option<&str> {
    match piece {
        Piece::Tok(Token::Word(Word {
            value,
            quote_style: None,
            ..
        })) => Some(value.as_str()),
        _ => None,
    }
}

pub(crate) fn next_sig(pieces: &[Piece], mut i: usize) -> Option<usize> {
    while i < pieces.len() {
        if !is_ws(&pieces[i]) {
            return Some(i);
        }
        i += 1;
    }
    None
}

/// Index where the primary expression ending at the tail of `out` begins:
/// a single literal/identifier/raw chunk, a qualified `a.b` name, or a
/// balanced `f(...)`/`(...)` group.
fn primary_expr_start(out: &[Piece]) -> usize {
    let mut j = out.len();
    while j > 0 && is_ws(&out[j - 1]) {
        j -= 1;
    }
    if j == 0 {
        return out.len();
    }
    let mut k = j - 1;
    match &out[k] {
        Piece::Raw(_) => k,
        Piece::Tok(Token::RParen) => {
            let mut depth = 1usize;
            while k > 0 && depth > 0 {
                k -= 1;
                match &out[k] {
                    Piece::Tok(Token::RParen) => depth += 1,
                    Piece::Tok(Token::LParen) => depth -= 1,
                    _ => {}
                }
            }
            // Pull in a leading function name: only a word directly adjacent
            // to the open paren (a keyword before `(...)` is separated by
            // whitespace and is not part of the expression).
            if k > 0 && word_value(&out[k - 1]).is_some() {
                k -= 1;
            }
            k
        }
        Piece::Tok(
            Token::Word(_)
            | Token::Number(_, _)
            | Token::SingleQuotedString(_)
            | Token::DollarQuotedString(_),
        ) => {
            // Extend over qualified names: a.b.c
            while k >= 2
                && matches!(&out[k - 1], Piece::Tok(Token::Period))
                && matches!(&out[k - 2], Piece::Tok(Token::Word(_)))
            {
                k -= 2;
            }
            k
        }
        _ => k,
    }
}

fn cast_target(type_name: &str) -> Option<&'static str> {
    match type_name {
        "int" | "integer" | "smallint" | "bigint" | "int2" | "int4" | "int8" | "serial"
        | "bigserial" => Some("INTEGER"),
        "real" | "float" | "float4" | "float8" | "double precision" => Some("REAL"),
        _ => None,
    }
}

/// Reads the type name following a `::` cast. Returns the lowercased name and
/// the index just past the consumed tokens (type arguments like `varchar(30)`
/// are swallowed).
fn read_cast_type(pieces: &[Piece], from: usize) -> Option<(String, usize)> {
    let first = next_sig(pieces, from)?;
    let mut name = word_value(&pieces[first])?.to_ascii_lowercase();
    let mut end = first + 1;
    if name == "double" {
        if let Some(next) = next_sig(pieces, end) {
            if word_value(&pieces[next]).is_some_and(|w| w.eq_ignore_ascii_case("precision")) {
                name = "double precision".into();
                end = next + 1;
            }
        }
    }
    if let Some(next) = next_sig(pieces, end) {
        if matches!(&pieces[next], Piece::Tok(Token::LParen)) {
            let mut depth = 0usize;
            let mut i = next;
            while i < pieces.len() {
                match &pieces[i] {
                    Piece::Tok(Token::LParen) => depth += 1,
                    Piece::Tok(Token::RParen) => {
                        depth -= 1;
                        if depth == 0 {
                            end = i + 1;
                            break;
                        }
                    }
                    _ => {}
                }
                i += 1;
            }
        }
    }
    Some((name, end))
}

/// `expr::TYPE` — re-emitted as `CAST(expr AS …)` where the target has a
/// useful SQLite affinity, stripped otherwise.
fn pass_casts(pieces: Vec<Piece>) -> Vec<Piece> {
    let mut out: Vec<Piece> = Vec::with_capacity(pieces.len());
    let mut i = 0;
    while i < pieces.len() {
        if matches!(&pieces[i], Piece::Tok(Token::DoubleColon)) {
            if let Some((type_name, end)) = read_cast_type(&pieces, i + 1) {
                let start = primary_expr_start(&out);
                let expr: Vec<Piece> = out.split_off(start);
                match cast_target(&type_name) {
                    Some(target) => {
                        out.push(Piece::Raw(format!("CAST({} AS {target})", emit(&expr))));
                    }
                    None => out.extend(expr),
                }
                i = end;
                continue;
            }
        }
        out.push(pieces[i].clone());
        i += 1;
    }
    out
}

/// Returns the lowercased call name when `pieces[i]` is an unquoted word
/// directly followed (modulo whitespace) by `(`.
fn call_at(pieces: &[Piece], i: usize) -> Option<(String, usize)> {
    let name = word_value(&pieces[i])?;
    let open = next_sig(pieces, i + 1)?;
    if matches!(&pieces[open], Piece::Tok(Token::LParen)) {
        Some((name.to_ascii_lowercase(), open))
    } else {
        None
    }
}

/// Finds the matching close paren for the group opening at `open`.
pub(crate) fn matching_close(pieces: &[Piece], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, piece) in pieces.iter().enumerate().skip(open) {
        match piece {
            Piece::Tok(Token::LParen) => depth += 1,
            Piece::Tok(Token::RParen) => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn is_empty_call(pieces: &[Piece], open: usize) -> bool {
    next_sig(pieces, open + 1).is_some_and(|i| matches!(&pieces[i], Piece::Tok(Token::RParen)))
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ArgRewrite {
    Left,
    Right,
}

struct PendingCall {
    kind: ArgRewrite,
    open_depth: usize,
    comma_seen: bool,
}

/// Function rewrites: `NOW()`, `CURRENT_TIMESTAMP`, `gen_random_uuid()`,
/// `LEFT`, `RIGHT`, `POSITION(a IN b)`.
fn pass_functions(pieces: Vec<Piece>) -> Vec<Piece> {
    let mut out: Vec<Piece> = Vec::with_capacity(pieces.len());
    let mut pending: Vec<PendingCall> = Vec::new();
    let mut depth = 0usize;
    // Text queued for insertion immediately before the next significant piece
    // (keeps injected SQL adjacent to the argument it decorates).
    let mut defer: Option<String> = None;
    let mut i = 0;
    while i < pieces.len() {
        if !is_ws(&pieces[i]) {
            if let Some(text) = defer.take() {
                out.push(Piece::Raw(text));
            }
        }
        if let Some((name, open)) = call_at(&pieces, i) {
            match name.as_str() {
                "now" if is_empty_call(&pieces, open) => {
                    let close = matching_close(&pieces, open).unwrap_or(open);
                    out.push(Piece::Raw("(datetime('now'))".into()));
                    i = close + 1;
                    continue;
                }
                "gen_random_uuid" if is_empty_call(&pieces, open) => {
                    let close = matching_close(&pieces, open).unwrap_or(open);
                    out.push(Piece::Raw(UUID_V4_SQL.into()));
                    i = close + 1;
                    continue;
                }
                "left" | "right" => {
                    let kind = if name == "left" {
                        ArgRewrite::Left
                    } else {
                        ArgRewrite::Right
                    };
                    out.push(Piece::Raw("substr".into()));
                    pending.push(PendingCall {
                        kind,
                        open_depth: depth,
                        comma_seen: false,
                    });
                    i += 1;
                    continue;
                }
                "position" => {
                    if let Some(close) = matching_close(&pieces, open) {
                        let interior = &pieces[open + 1..close];
                        if let Some(split) = top_level_in(interior) {
                            let needle = pass_functions(interior[..split].to_vec());
                            let haystack = pass_functions(interior[split + 1..].to_vec());
                            out.push(Piece::Raw(format!(
                                "instr({}, {})",
                                emit(&haystack).trim(),
                                emit(&needle).trim()
                            )));
                            i = close + 1;
                            continue;
                        }
                    }
                }
                _ => {}
            }
        }
        if word_value(&pieces[i]).is_some_and(|w| w.eq_ignore_ascii_case("current_timestamp")) {
            out.push(Piece::Raw("(datetime('now'))".into()));
            i += 1;
            continue;
        }
        match &pieces[i] {
            Piece::Tok(Token::LParen) => {
                depth += 1;
                out.push(pieces[i].clone());
            }
            Piece::Tok(Token::RParen) => {
                depth -= 1;
                if pending.last().is_some_and(|p| {
                    p.open_depth == depth && p.kind == ArgRewrite::Right && p.comma_seen
                }) {
                    out.push(Piece::Raw(")".into()));
                }
                if pending.last().is_some_and(|p| p.open_depth == depth) {
                    pending.pop();
                }
                out.push(pieces[i].clone());
            }
            Piece::Tok(Token::Comma) => {
                out.push(pieces[i].clone());
                if let Some(p) = pending.last_mut() {
                    if p.open_depth + 1 == depth && !p.comma_seen {
                        p.comma_seen = true;
                        match p.kind {
                            ArgRewrite::Left => out.push(Piece::Raw(" 1,".into())),
                            ArgRewrite::Right => defer = Some("-(".into()),
                        }
                    }
                }
            }
            _ => out.push(pieces[i].clone()),
        }
        i += 1;
    }
    out
}

/// Index of the top-level `IN` keyword inside a `POSITION(...)` interior.
fn top_level_in(pieces: &[Piece]) -> Option<usize> {
    let mut depth = 0usize;
    for (i, piece) in pieces.iter().enumerate() {
        match piece {
            Piece::Tok(Token::LParen) => depth += 1,
            Piece::Tok(Token::RParen) => depth -= 1,
            Piece::Tok(Token::Word(w)) if depth == 0 && w.keyword == Keyword::IN => {
                return Some(i);
            }
            _ => {}
        }
    }
    None
}

/// `base ± INTERVAL 'N units'` → `datetime(base, '±N units')`.
fn pass_intervals(pieces: Vec<Piece>) -> Vec<Piece> {
    let mut out: Vec<Piece> = Vec::with_capacity(pieces.len());
    let mut i = 0;
    while i < pieces.len() {
        let is_interval =
            word_value(&pieces[i]).is_some_and(|w| w.eq_ignore_ascii_case("interval"));
        if is_interval {
            if let Some(lit_idx) = next_sig(&pieces, i + 1) {
                if let Piece::Tok(Token::SingleQuotedString(lit)) = &pieces[lit_idx] {
                    // Look back for the +/- operator and its left operand.
                    let mut j = out.len();
                    while j > 0 && is_ws(&out[j - 1]) {
                        j -= 1;
                    }
                    let sign = match (j > 0).then(|| &out[j - 1]) {
                        Some(Piece::Tok(Token::Plus)) => Some('+'),
                        Some(Piece::Tok(Token::Minus)) => Some('-'),
                        _ => None,
                    };
                    if let Some(sign) = sign {
                        let op_idx = j - 1;
                        let start = primary_expr_start(&out[..op_idx]);
                        let op_pos = op_idx - start;
                        let base: Vec<Piece> = out.drain(start..).collect();
                        let base_sql = emit(&base[..op_pos]).trim().to_string();
                        let modifier = if lit.starts_with('+') || lit.starts_with('-') {
                            lit.clone()
                        } else {
                            format!("{sign}{lit}")
                        };
                        out.push(Piece::Raw(format!("datetime({base_sql}, '{modifier}')")));
                        i = lit_idx + 1;
                        continue;
                    }
                }
            }
        }
        out.push(pieces[i].clone());
        i += 1;
    }
    out
}

/// Bare `TRUE`/`FALSE` keywords → `1`/`0`. Word tokens never occur inside
/// string literals, so value position is the only place these appear.
fn pass_bool_literals(pieces: Vec<Piece>) -> Vec<Piece> {
    pieces
        .into_iter()
        .map(|piece| match word_value(&piece) {
            Some(w) if w.eq_ignore_ascii_case("true") => Piece::Raw("1".into()),
            Some(w) if w.eq_ignore_ascii_case("false") => Piece::Raw("0".into()),
            _ => piece,
        })
        .collect()
}

fn ddl_type_replacement(name: &str) -> Option<&'static str> {
    match name {
        "uuid" | "text" | "varchar" | "char" | "character" | "citext" | "jsonb" | "json"
        | "timestamptz" | "timestamp" | "date" | "time" | "numeric" | "decimal" => Some("TEXT"),
        "integer" | "int" | "int2" | "int4" | "int8" | "smallint" | "bigint" | "serial"
        | "bigserial" | "boolean" | "bool" => Some("INTEGER"),
        "real" | "float4" | "float8" | "double" => Some("REAL"),
        "bytea" => Some("BLOB"),
        _ => None,
    }
}

const CONSTRAINT_STARTERS: &[&str] = &["primary", "unique", "check", "foreign", "constraint"];

fn statement_starts_with(pieces: &[Piece], words: &[&str]) -> bool {
    let mut at = 0usize;
    for expect in words {
        match next_sig(pieces, at) {
            Some(i) if word_value(&pieces[i]).is_some_and(|w| w.eq_ignore_ascii_case(expect)) => {
                at = i + 1;
            }
            _ => return false,
        }
    }
    true
}

/// Maps PostgreSQL column types to SQLite storage types in `CREATE TABLE` /
/// `ALTER TABLE … ADD COLUMN` definitions. Type arguments like `varchar(30)`
/// and `with/without time zone` tails are swallowed.
fn pass_ddl_types(pieces: Vec<Piece>) -> Vec<Piece> {
    let create = statement_starts_with(&pieces, &["create", "table"]);
    let alter = statement_starts_with(&pieces, &["alter", "table"]);
    if !create && !alter {
        return pieces;
    }

    #[derive(PartialEq)]
    enum St {
        Seeking,
        ExpectName,
        ExpectType,
        InDef,
    }

    let mut out: Vec<Piece> = Vec::with_capacity(pieces.len());
    let mut depth = 0usize;
    let mut st = St::Seeking;
    let mut i = 0;
    while i < pieces.len() {
        match &pieces[i] {
            Piece::Tok(Token::LParen) => {
                depth += 1;
                if create && depth == 1 && st == St::Seeking {
                    st = St::ExpectName;
                }
                out.push(pieces[i].clone());
            }
            Piece::Tok(Token::RParen) => {
                depth -= 1;
                if depth == 0 {
                    st = St::Seeking;
                }
                out.push(pieces[i].clone());
            }
            Piece::Tok(Token::Comma) if depth == 1 => {
                if create {
                    st = St::ExpectName;
                }
                out.push(pieces[i].clone());
            }
            Piece::Tok(Token::Word(_)) => {
                let value = word_value(&pieces[i]).map(str::to_ascii_lowercase);
                match st {
                    St::ExpectName => {
                        if value
                            .as_deref()
                            .is_some_and(|v| CONSTRAINT_STARTERS.contains(&v))
                        {
                            st = St::InDef;
                        } else {
                            st = St::ExpectType;
                        }
                        out.push(pieces[i].clone());
                    }
                    St::ExpectType => {
                        i = emit_mapped_type(&pieces, i, &mut out);
                        st = St::InDef;
                        continue;
                    }
                    St::Seeking if alter && value.as_deref() == Some("column") => {
                        out.push(pieces[i].clone());
                        // ALTER TABLE t ADD COLUMN <name> <type>
                        if let Some(name_idx) = next_sig(&pieces, i + 1) {
                            if matches!(&pieces[name_idx], Piece::Tok(Token::Word(_))) {
                                for p in &pieces[i + 1..=name_idx] {
                                    out.push(p.clone());
                                }
                                if let Some(type_idx) = next_sig(&pieces, name_idx + 1) {
                                    for p in &pieces[name_idx + 1..type_idx] {
                                        out.push(p.clone());
                                    }
                                    i = emit_mapped_type(&pieces, type_idx, &mut out);
                                    st = St::InDef;
                                    continue;
                                }
                                i = name_idx + 1;
                                continue;
                            }
                        }
                    }
                    _ => out.push(pieces[i].clone()),
                }
            }
            _ => out.push(pieces[i].clone()),
        }
        i += 1;
    }
    out
}

/// Emits the SQLite replacement for the type starting at `i`, returning the
/// index just past the consumed tokens. Unknown types pass through.
fn emit_mapped_type(pieces: &[Piece], i: usize, out: &mut Vec<Piece>) -> usize {
    let Some(name) = word_value(&pieces[i]).map(str::to_ascii_lowercase) else {
        out.push(pieces[i].clone());
        return i + 1;
    };
    let mut end = i + 1;
    let mut mapped = ddl_type_replacement(&name);

    if name == "double" {
        if let Some(n) = next_sig(pieces, end) {
            if word_value(&pieces[n]).is_some_and(|w| w.eq_ignore_ascii_case("precision")) {
                end = n + 1;
            }
        }
    } else if name == "character" {
        if let Some(n) = next_sig(pieces, end) {
            if word_value(&pieces[n]).is_some_and(|w| w.eq_ignore_ascii_case("varying")) {
                end = n + 1;
            }
        }
    } else if name == "timestamp" || name == "time" {
        // timestamp [with|without] time zone
        if let Some(n) = next_sig(pieces, end) {
            if word_value(&pieces[n])
                .is_some_and(|w| w.eq_ignore_ascii_case("with") || w.eq_ignore_ascii_case("without"))
            {
                let mut cursor = n + 1;
                for _ in 0..2 {
                    if let Some(m) = next_sig(pieces, cursor) {
                        cursor = m + 1;
                    }
                }
                end = cursor;
                mapped = Some("TEXT");
            }
        }
    }

    // Swallow type arguments: varchar(30), numeric(10,2).
    if let Some(n) = next_sig(pieces, end) {
        if matches!(&pieces[n], Piece::Tok(Token::LParen)) {
            if let Some(close) = matching_close(pieces, n) {
                if mapped.is_some() {
                    end = close + 1;
                }
            }
        }
    }

    match mapped {
        Some(replacement) => {
            out.push(Piece::Raw(replacement.into()));
            end
        }
        None => {
            out.push(pieces[i].clone());
            i + 1
        }
    }
}

pub(crate) fn run_passes(pieces: Vec<Piece>) -> Vec<Piece> {
    let pieces = pass_casts(pieces);
    let pieces = pass_functions(pieces);
    let pieces = pass_intervals(pieces);
    let pieces = pass_bool_literals(pieces);
    pass_ddl_types(pieces)
}

/// Translates one PostgreSQL statement into SQLite-executable form.
pub fn translate_sql(sql: &str) -> Result<String, DbError> {
    let pieces = tokenize(sql)?;
    Ok(emit(&run_passes(pieces)))
}

/// Splits a script into statements at top-level `;`, preserving original
/// (untranslated) spelling. String and dollar-quoted bodies are single
/// tokens, so embedded semicolons never split.
pub fn split_statements(sql: &str) -> Result<Vec<String>, DbError> {
    let pieces = tokenize(sql)?;
    let mut statements = Vec::new();
    let mut current: Vec<Piece> = Vec::new();
    for piece in pieces {
        if matches!(piece, Piece::Tok(Token::SemiColon)) {
            flush_statement(&mut current, &mut statements);
        } else {
            current.push(piece);
        }
    }
    flush_statement(&mut current, &mut statements);
    Ok(statements)
}

fn flush_statement(current: &mut Vec<Piece>, statements: &mut Vec<String>) {
    if current.iter().any(|p| !is_ws(p)) {
        let text = emit_pg(current).trim().to_string();
        if !text.is_empty() {
            statements.push(text);
        }
    }
    current.clear();
}

/// Quotes an identifier for interpolation into generated SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
