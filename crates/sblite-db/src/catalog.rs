//! The `_columns` type catalog: the authoritative PostgreSQL type for every
//! user column, populated by observing DDL as it flows through the migration
//! runner and the dashboard SQL path.

use std::str::FromStr;
use std::sync::Arc;

use sqlparser::tokenizer::Token;
use sqlx::{Row, SqliteConnection};
use tracing::debug;

use crate::error::DbError;
use crate::translate::{
    is_ws, matching_close, next_sig, tokenize, word_value, Piece,
};
use crate::types::PgType;
use crate::Database;

/// One `_columns` row.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDescriptor {
    pub table: String,
    pub name: String,
    pub pg_type: PgType,
    pub nullable: bool,
    pub default_value: Option<String>,
    pub is_primary: bool,
}

impl Database {
    /// Idempotent upsert of a column descriptor.
    pub async fn declare_column(
        &self,
        conn: &mut SqliteConnection,
        desc: &ColumnDescriptor,
    ) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO _columns (table_name, column_name, pg_type, nullable, default_value, is_primary)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (table_name, column_name) DO UPDATE SET
                pg_type = excluded.pg_type,
                nullable = excluded.nullable,
                default_value = excluded.default_value,
                is_primary = excluded.is_primary
            "#,
        )
        .bind(&desc.table)
        .bind(&desc.name)
        .bind(desc.pg_type.as_str())
        .bind(desc.nullable)
        .bind(&desc.default_value)
        .bind(desc.is_primary)
        .execute(conn)
        .await?;
        self.invalidate_catalog();
        Ok(())
    }

    /// Columns of `table` in declaration order, or None when the table has
    /// never been declared. Served from the in-memory cache when possible.
    pub async fn table_columns(
        &self,
        table: &str,
    ) -> Result<Option<Arc<Vec<ColumnDescriptor>>>, DbError> {
        if let Some(hit) = self.catalog_cache.read().get(table) {
            return Ok(Some(hit.clone()));
        }
        let rows = sqlx::query(
            "SELECT table_name, column_name, pg_type, nullable, default_value, is_primary \
             FROM _columns WHERE table_name = ? ORDER BY rowid",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;
        if rows.is_empty() {
            return Ok(None);
        }
        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let pg_type: String = row.try_get("pg_type").map_err(DbError::from_sqlx)?;
            columns.push(ColumnDescriptor {
                table: row.try_get("table_name").map_err(DbError::from_sqlx)?,
                name: row.try_get("column_name").map_err(DbError::from_sqlx)?,
                pg_type: PgType::from_str(&pg_type)?,
                nullable: row.try_get("nullable").map_err(DbError::from_sqlx)?,
                default_value: row.try_get("default_value").map_err(DbError::from_sqlx)?,
                is_primary: row.try_get("is_primary").map_err(DbError::from_sqlx)?,
            });
        }
        let columns = Arc::new(columns);
        self.catalog_cache
            .write()
            .insert(table.to_string(), columns.clone());
        Ok(Some(columns))
    }

    pub(crate) fn invalidate_catalog(&self) {
        self.catalog_cache.write().clear();
    }

    /// Records the catalog consequences of a DDL statement before it is
    /// translated and executed. Unknown column types are rejected here, which
    /// aborts the surrounding migration transaction.
    pub async fn observe_ddl(
        &self,
        conn: &mut SqliteConnection,
        stmt: &str,
    ) -> Result<(), DbError> {
        match parse_ddl(stmt)? {
            Some(DdlEffect::CreateTable { table, columns }) => {
                debug!(table = %table, columns = columns.len(), "declaring table columns");
                for desc in &columns {
                    self.declare_column(conn, desc).await?;
                }
            }
            Some(DdlEffect::AddColumn(desc)) => {
                self.declare_column(conn, &desc).await?;
            }
            Some(DdlEffect::DropColumn { table, column }) => {
                sqlx::query("DELETE FROM _columns WHERE table_name = ? AND column_name = ?")
                    .bind(&table)
                    .bind(&column)
                    .execute(conn)
                    .await?;
                self.invalidate_catalog();
            }
            Some(DdlEffect::DropTable { table }) => {
                sqlx::query("DELETE FROM _columns WHERE table_name = ?")
                    .bind(&table)
                    .execute(conn)
                    .await?;
                self.invalidate_catalog();
            }
            None => {}
        }
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) enum DdlEffect {
    CreateTable {
        table: String,
        columns: Vec<ColumnDescriptor>,
    },
    AddColumn(ColumnDescriptor),
    DropColumn {
        table: String,
        column: String,
    },
    DropTable {
        table: String,
    },
}

fn ident_value(piece: &Piece) -> Option<String> {
    match piece {
        Piece::Tok(Token::Word(w)) => Some(w.value.clone()),
        _ => None,
    }
}

/// Walks a word sequence at the head of the statement, case-insensitively.
/// Returns the index just past the last matched word.
fn match_words(pieces: &[Piece], words: &[&str], mut at: usize) -> Option<usize> {
    for expect in words {
        let i = next_sig(pieces, at)?;
        if !word_value(&pieces[i]).is_some_and(|w| w.eq_ignore_ascii_case(expect)) {
            return None;
        }
        at = i + 1;
    }
    Some(at)
}

/// Skips an optional word sequence, returning the cursor after it (or the
/// original cursor when it does not match).
fn skip_words(pieces: &[Piece], words: &[&str], at: usize) -> usize {
    match_words(pieces, words, at).unwrap_or(at)
}

/// Reads a possibly schema-qualified identifier, returning its unqualified
/// name and the cursor past it.
fn read_table_name(pieces: &[Piece], at: usize) -> Option<(String, usize)> {
    let i = next_sig(pieces, at)?;
    let mut name = ident_value(&pieces[i])?;
    let mut cursor = i + 1;
    while let Some(dot) = next_sig(pieces, cursor) {
        if !matches!(&pieces[dot], Piece::Tok(Token::Period)) {
            break;
        }
        let part = next_sig(pieces, dot + 1)?;
        name = ident_value(&pieces[part])?;
        cursor = part + 1;
    }
    Some((name, cursor))
}

pub(crate) fn parse_ddl(stmt: &str) -> Result<Option<DdlEffect>, DbError> {
    let pieces = tokenize(stmt)?;
    if let Some(after) = match_words(&pieces, &["create", "table"], 0) {
        let after = skip_words(&pieces, &["if", "not", "exists"], after);
        let Some((table, cursor)) = read_table_name(&pieces, after) else {
            return Ok(None);
        };
        let Some(open) = next_sig(&pieces, cursor) else {
            return Ok(None);
        };
        if !matches!(&pieces[open], Piece::Tok(Token::LParen)) {
            return Ok(None);
        }
        let close = matching_close(&pieces, open)
            .ok_or_else(|| DbError::BadRequest("unbalanced parens in CREATE TABLE".into()))?;
        let columns = parse_column_defs(&table, &pieces[open + 1..close])?;
        return Ok(Some(DdlEffect::CreateTable { table, columns }));
    }
    if let Some(after) = match_words(&pieces, &["alter", "table"], 0) {
        let after = skip_words(&pieces, &["if", "exists"], after);
        let Some((table, cursor)) = read_table_name(&pieces, after) else {
            return Ok(None);
        };
        if let Some(after_add) = match_words(&pieces, &["add"], cursor) {
            let after_add = skip_words(&pieces, &["column"], after_add);
            let after_add = skip_words(&pieces, &["if", "not", "exists"], after_add);
            let tail: Vec<Piece> = pieces[after_add..].to_vec();
            let mut defs = parse_column_defs(&table, &tail)?;
            if let Some(desc) = defs.pop() {
                return Ok(Some(DdlEffect::AddColumn(desc)));
            }
            return Ok(None);
        }
        if let Some(after_drop) = match_words(&pieces, &["drop"], cursor) {
            let after_drop = skip_words(&pieces, &["column"], after_drop);
            let after_drop = skip_words(&pieces, &["if", "exists"], after_drop);
            if let Some(i) = next_sig(&pieces, after_drop) {
                if let Some(column) = ident_value(&pieces[i]) {
                    return Ok(Some(DdlEffect::DropColumn { table, column }));
                }
            }
        }
        return Ok(None);
    }
    if let Some(after) = match_words(&pieces, &["drop", "table"], 0) {
        let after = skip_words(&pieces, &["if", "exists"], after);
        if let Some((table, _)) = read_table_name(&pieces, after) {
            return Ok(Some(DdlEffect::DropTable { table }));
        }
    }
    Ok(None)
}

const CONSTRAINT_STARTERS: &[&str] = &["primary", "unique", "check", "foreign", "constraint"];
const FLAG_STARTERS: &[&str] = &[
    "not", "null", "primary", "unique", "check", "references", "default", "constraint",
    "generated", "collate",
];

/// Parses the interior of a `CREATE TABLE (...)` — or a single trailing
/// `ADD COLUMN` definition — into descriptors. Table-level `PRIMARY KEY (…)`
/// constraints mark the named columns.
fn parse_column_defs(table: &str, pieces: &[Piece]) -> Result<Vec<ColumnDescriptor>, DbError> {
    let mut columns: Vec<ColumnDescriptor> = Vec::new();
    let mut primary_from_constraint: Vec<String> = Vec::new();

    for def in split_top_level(pieces) {
        let Some(first) = next_sig(&def, 0) else {
            continue;
        };
        let Some(head) = ident_value(&def[first]) else {
            continue;
        };
        let head_lower = head.to_ascii_lowercase();
        if CONSTRAINT_STARTERS.contains(&head_lower.as_str()) {
            if head_lower == "primary" {
                primary_from_constraint.extend(idents_in_parens(&def));
            }
            continue;
        }

        let Some(type_at) = next_sig(&def, first + 1) else {
            continue;
        };
        let Some((type_name, after_type)) = read_type_name(&def, type_at) else {
            continue;
        };
        let pg_type = PgType::from_str(&type_name)?;

        let mut nullable = true;
        let mut is_primary = false;
        let mut default_value: Option<String> = None;
        let mut i = after_type;
        while let Some(at) = next_sig(&def, i) {
            let word = word_value(&def[at]).map(str::to_ascii_lowercase);
            match word.as_deref() {
                Some("not") => {
                    if match_words(&def, &["not", "null"], at).is_some() {
                        nullable = false;
                    }
                    i = at + 1;
                }
                Some("primary") => {
                    is_primary = true;
                    nullable = false;
                    i = at + 1;
                }
                Some("default") => {
                    let (expr, next) = capture_default(&def, at + 1);
                    default_value = Some(expr);
                    i = next;
                }
                _ => i = at + 1,
            }
        }

        columns.push(ColumnDescriptor {
            table: table.to_string(),
            name: head,
            pg_type,
            nullable,
            default_value,
            is_primary,
        });
    }

    for name in primary_from_constraint {
        if let Some(col) = columns.iter_mut().find(|c| c.name == name) {
            col.is_primary = true;
            col.nullable = false;
        }
    }
    Ok(columns)
}

/// Splits pieces on top-level commas.
fn split_top_level(pieces: &[Piece]) -> Vec<Vec<Piece>> {
    let mut out = Vec::new();
    let mut current = Vec::new();
    let mut depth = 0usize;
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
            Piece::Tok(Token::Comma) if depth == 0 => {
                out.push(std::mem::take(&mut current));
            }
            _ => current.push(piece.clone()),
        }
    }
    if current.iter().any(|p| !is_ws(p)) {
        out.push(current);
    }
    out
}

/// Reads a (possibly multi-word) type name, normalizing the multi-word
/// PostgreSQL spellings to their single-word aliases.
pub(crate) fn read_type_name(pieces: &[Piece], at: usize) -> Option<(String, usize)> {
    let first = word_value(&pieces[at])?.to_ascii_lowercase();
    let mut end = at + 1;
    let mut name = first.clone();
    match first.as_str() {
        "double" => {
            if let Some(next) = match_words(pieces, &["precision"], end) {
                name = "float8".into();
                end = next;
            }
        }
        "character" => {
            if let Some(next) = match_words(pieces, &["varying"], end) {
                name = "varchar".into();
                end = next;
            }
        }
        "timestamp" | "time" => {
            for prefix in [["with", "time", "zone"], ["without", "time", "zone"]] {
                if let Some(next) = match_words(pieces, &prefix, end) {
                    name = "timestamptz".into();
                    end = next;
                    break;
                }
            }
        }
        _ => {}
    }
    // Swallow type arguments: varchar(30), numeric(10,2).
    if let Some(open) = next_sig(pieces, end) {
        if matches!(&pieces[open], Piece::Tok(Token::LParen)) {
            if let Some(close) = matching_close(pieces, open) {
                end = close + 1;
            }
        }
    }
    Some((name, end))
}

/// Captures a DEFAULT expression: everything up to the next top-level flag
/// keyword or the end of the definition.
fn capture_default(pieces: &[Piece], from: usize) -> (String, usize) {
    let mut depth = 0usize;
    let mut end = from;
    let mut i = from;
    while i < pieces.len() {
        match &pieces[i] {
            Piece::Tok(Token::LParen) => depth += 1,
            Piece::Tok(Token::RParen) => depth = depth.saturating_sub(1),
            piece if depth == 0 => {
                if let Some(word) = word_value(piece) {
                    let lower = word.to_ascii_lowercase();
                    if FLAG_STARTERS.contains(&lower.as_str()) && end > from {
                        break;
                    }
                }
            }
            _ => {}
        }
        if !is_ws(&pieces[i]) {
            end = i + 1;
        }
        i += 1;
    }
    (crate::translate::emit_pg(&pieces[from..end]).trim().to_string(), end)
}

/// Identifiers inside the first paren group of a constraint definition.
fn idents_in_parens(pieces: &[Piece]) -> Vec<String> {
    let Some(open) = pieces
        .iter()
        .position(|p| matches!(p, Piece::Tok(Token::LParen)))
    else {
        return Vec::new();
    };
    let Some(close) = matching_close(pieces, open) else {
        return Vec::new();
    };
    pieces[open + 1..close]
        .iter()
        .filter_map(ident_value)
        .collect()
}
