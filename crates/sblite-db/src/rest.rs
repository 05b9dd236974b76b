//! PostgREST-style query compilation and execution.
//!
//! URL queries are parsed into a canonical [`RestQuery`], compiled to SQLite
//! SQL with the RLS guards wrapped in, executed, and the rows JSON-encoded
//! using the type catalog. Embedded resources run one inner query per
//! relation and are stitched in memory.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Number, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, TypeInfo, ValueRef};

use crate::auth::{AuthContext, Role};
use crate::catalog::ColumnDescriptor;
use crate::error::DbError;
use crate::rls::RlsAction;
use crate::translate::quote_ident;
use crate::types::{PgType, SqlArg, SqlPredicate};
use crate::Database;

const ROWID_ALIAS: &str = "__sblite_rowid";

/// The PostgREST filter operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    Ilike,
    In,
    Is,
}

impl FilterOp {
    pub fn parse(s: &str) -> Option<FilterOp> {
        match s {
            "eq" => Some(FilterOp::Eq),
            "neq" => Some(FilterOp::Neq),
            "gt" => Some(FilterOp::Gt),
            "gte" => Some(FilterOp::Gte),
            "lt" => Some(FilterOp::Lt),
            "lte" => Some(FilterOp::Lte),
            "like" => Some(FilterOp::Like),
            "ilike" => Some(FilterOp::Ilike),
            "in" => Some(FilterOp::In),
            "is" => Some(FilterOp::Is),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterNode {
    Cond {
        column: String,
        negated: bool,
        op: FilterOp,
        value: String,
    },
    Group {
        op: LogicalOp,
        negated: bool,
        children: Vec<FilterNode>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    Column(String),
    Embed {
        relation: String,
        columns: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderTerm {
    pub column: String,
    pub descending: bool,
    pub nulls_first: Option<bool>,
}

/// Canonical parsed form of a PostgREST URL query.
#[derive(Debug, Clone, PartialEq)]
pub struct RestQuery {
    pub table: String,
    pub select: Vec<SelectItem>,
    pub filters: Vec<FilterNode>,
    pub order: Vec<OrderTerm>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug)]
pub struct SelectResult {
    pub rows: Vec<Value>,
    pub total: i64,
}

/// A committed row change, handed to the realtime hub after the transaction
/// commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl ChangeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Insert => "INSERT",
            ChangeOp::Update => "UPDATE",
            ChangeOp::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangeEvent {
    pub schema: String,
    pub table: String,
    pub op: ChangeOp,
    pub old: Option<Value>,
    pub new: Option<Value>,
    pub commit_timestamp: DateTime<Utc>,
}

#[derive(Debug)]
pub struct WriteResult {
    pub rows: Vec<Value>,
    pub events: Vec<ChangeEvent>,
}

const RESERVED_KEYS: &[&str] = &["select", "order", "limit", "offset", "on_conflict"];

/// Parses the URL query pairs for `table` into canonical form.
pub fn parse_rest_query(table: &str, pairs: &[(String, String)]) -> Result<RestQuery, DbError> {
    let mut query = RestQuery {
        table: table.to_string(),
        select: Vec::new(),
        filters: Vec::new(),
        order: Vec::new(),
        limit: None,
        offset: None,
    };
    for (key, value) in pairs {
        match key.as_str() {
            "select" => query.select = parse_select(value)?,
            "order" => query.order = parse_order(value)?,
            "limit" => {
                query.limit = Some(value.parse().map_err(|_| {
                    DbError::BadRequest(format!("invalid limit '{value}'"))
                })?)
            }
            "offset" => {
                query.offset = Some(value.parse().map_err(|_| {
                    DbError::BadRequest(format!("invalid offset '{value}'"))
                })?)
            }
            "and" => query.filters.push(parse_group(LogicalOp::And, false, value)?),
            "or" => query.filters.push(parse_group(LogicalOp::Or, false, value)?),
            "not.and" => query.filters.push(parse_group(LogicalOp::And, true, value)?),
            "not.or" => query.filters.push(parse_group(LogicalOp::Or, true, value)?),
            key if RESERVED_KEYS.contains(&key) => {}
            column => query.filters.push(parse_column_filter(column, value)?),
        }
    }
    Ok(query)
}

/// `col=op.value`, `col=not.op.value`, `col=in.(a,b)`.
fn parse_column_filter(column: &str, value: &str) -> Result<FilterNode, DbError> {
    let (negated, rest) = match value.strip_prefix("not.") {
        Some(rest) => (true, rest),
        None => (false, value),
    };
    let (op_str, operand) = rest.split_once('.').ok_or_else(|| {
        DbError::BadRequest(format!("malformed filter '{column}={value}'"))
    })?;
    let op = FilterOp::parse(op_str).ok_or_else(|| {
        DbError::BadRequest(format!("unknown filter operator '{op_str}'"))
    })?;
    Ok(FilterNode::Cond {
        column: column.to_string(),
        negated,
        op,
        value: operand.to_string(),
    })
}

/// `or=(a.gte.1,and(b.eq.2,c.eq.3))`.
fn parse_group(op: LogicalOp, negated: bool, value: &str) -> Result<FilterNode, DbError> {
    let interior = value
        .strip_prefix('(')
        .and_then(|v| v.strip_suffix(')'))
        .ok_or_else(|| DbError::BadRequest(format!("malformed logical group '{value}'")))?;
    let mut children = Vec::new();
    for item in split_top_level(interior) {
        children.push(parse_group_item(item.trim())?);
    }
    if children.is_empty() {
        return Err(DbError::BadRequest("empty logical group".into()));
    }
    Ok(FilterNode::Group {
        op,
        negated,
        children,
    })
}

fn parse_group_item(item: &str) -> Result<FilterNode, DbError> {
    let (negated, rest) = match item.strip_prefix("not.") {
        Some(rest) => (true, rest),
        None => (false, item),
    };
    for (prefix, op) in [("and(", LogicalOp::And), ("or(", LogicalOp::Or)] {
        if let Some(inner) = rest.strip_prefix(prefix) {
            let inner = inner.strip_suffix(')').ok_or_else(|| {
                DbError::BadRequest(format!("malformed nested group '{item}'"))
            })?;
            let mut children = Vec::new();
            for sub in split_top_level(inner) {
                children.push(parse_group_item(sub.trim())?);
            }
            return Ok(FilterNode::Group {
                op,
                negated,
                children,
            });
        }
    }
    // col.op.value
    let (column, rest2) = rest.split_once('.').ok_or_else(|| {
        DbError::BadRequest(format!("malformed group condition '{item}'"))
    })?;
    let (op_str, operand) = match rest2.split_once('.') {
        Some((op_str, operand)) => (op_str, operand),
        None => (rest2, ""),
    };
    let op = FilterOp::parse(op_str).ok_or_else(|| {
        DbError::BadRequest(format!("unknown filter operator '{op_str}'"))
    })?;
    Ok(FilterNode::Cond {
        column: column.to_string(),
        negated,
        op,
        value: operand.to_string(),
    })
}

/// Splits on top-level commas, respecting parens and double quotes.
fn split_top_level(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '(' if !in_quotes => depth += 1,
            ')' if !in_quotes => depth = depth.saturating_sub(1),
            ',' if !in_quotes && depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if start < s.len() || out.is_empty() {
        out.push(&s[start..]);
    }
    out.retain(|item| !item.trim().is_empty());
    out
}

fn parse_select(value: &str) -> Result<Vec<SelectItem>, DbError> {
    let mut items = Vec::new();
    for item in split_top_level(value) {
        let item = item.trim();
        if let Some(open) = item.find('(') {
            let relation = item[..open].trim();
            let inner = item[open + 1..]
                .strip_suffix(')')
                .ok_or_else(|| DbError::BadRequest(format!("malformed embed '{item}'")))?;
            let columns = split_top_level(inner)
                .into_iter()
                .map(|c| c.trim().to_string())
                .collect();
            items.push(SelectItem::Embed {
                relation: relation.to_string(),
                columns,
            });
        } else {
            items.push(SelectItem::Column(item.to_string()));
        }
    }
    Ok(items)
}

/// `order=col.asc,col2.desc.nullsfirst`.
fn parse_order(value: &str) -> Result<Vec<OrderTerm>, DbError> {
    let mut terms = Vec::new();
    for item in split_top_level(value) {
        let mut parts = item.trim().split('.');
        let column = parts
            .next()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| DbError::BadRequest("empty order term".into()))?
            .to_string();
        let mut term = OrderTerm {
            column,
            descending: false,
            nulls_first: None,
        };
        for part in parts {
            match part {
                "asc" => term.descending = false,
                "desc" => term.descending = true,
                "nullsfirst" => term.nulls_first = Some(true),
                "nullslast" => term.nulls_first = Some(false),
                other => {
                    return Err(DbError::BadRequest(format!(
                        "unknown order modifier '{other}'"
                    )))
                }
            }
        }
        terms.push(term);
    }
    Ok(terms)
}

fn find_column<'a>(
    columns: Option<&'a [ColumnDescriptor]>,
    name: &str,
) -> Result<Option<&'a ColumnDescriptor>, DbError> {
    match columns {
        None => Ok(None),
        Some(cols) => cols
            .iter()
            .find(|c| c.name == name)
            .map(Some)
            .ok_or_else(|| DbError::UnknownColumn(name.to_string())),
    }
}

/// Coerces a URL filter operand to a bind value, guided by the column type
/// when the catalog knows it.
fn coerce_operand(pg: Option<PgType>, raw: &str) -> SqlArg {
    match pg {
        Some(PgType::Integer) => raw
            .parse::<i64>()
            .map(SqlArg::Int)
            .unwrap_or_else(|_| SqlArg::Text(raw.to_string())),
        Some(PgType::Boolean) => match raw {
            "true" | "1" => SqlArg::Int(1),
            "false" | "0" => SqlArg::Int(0),
            _ => SqlArg::Text(raw.to_string()),
        },
        Some(PgType::Numeric) => raw
            .parse::<f64>()
            .map(SqlArg::Real)
            .unwrap_or_else(|_| SqlArg::Text(raw.to_string())),
        Some(_) => SqlArg::Text(raw.to_string()),
        None => {
            if let Ok(n) = raw.parse::<i64>() {
                SqlArg::Int(n)
            } else if let Ok(f) = raw.parse::<f64>() {
                SqlArg::Real(f)
            } else {
                SqlArg::Text(raw.to_string())
            }
        }
    }
}

/// Compiles one filter node to SQL. `columns` enables name validation and
/// type-aware coercion when the table is in the catalog.
pub(crate) fn filter_predicate(
    node: &FilterNode,
    columns: Option<&[ColumnDescriptor]>,
) -> Result<SqlPredicate, DbError> {
    match node {
        FilterNode::Group {
            op,
            negated,
            children,
        } => {
            let joiner = match op {
                LogicalOp::And => " AND ",
                LogicalOp::Or => " OR ",
            };
            let mut sql = String::new();
            let mut args = Vec::new();
            for (i, child) in children.iter().enumerate() {
                if i > 0 {
                    sql.push_str(joiner);
                }
                let pred = filter_predicate(child, columns)?;
                sql.push('(');
                sql.push_str(&pred.sql);
                sql.push(')');
                args.extend(pred.args);
            }
            let sql = if *negated {
                format!("NOT ({sql})")
            } else {
                format!("({sql})")
            };
            Ok(SqlPredicate::new(sql, args))
        }
        FilterNode::Cond {
            column,
            negated,
            op,
            value,
        } => {
            let descriptor = find_column(columns, column)?;
            let pg = descriptor.map(|d| d.pg_type);
            let col_sql = quote_ident(column);
            // Numeric columns are stored as text; compare numerically.
            let (lhs, cast_rhs) = match pg {
                Some(PgType::Numeric) => (format!("CAST({col_sql} AS REAL)"), true),
                _ => (col_sql, false),
            };
            let rhs = |arg: SqlArg| -> (String, Vec<SqlArg>) {
                if cast_rhs {
                    ("CAST(? AS REAL)".to_string(), vec![arg])
                } else {
                    ("?".to_string(), vec![arg])
                }
            };
            let (sql, args) = match op {
                FilterOp::Eq => {
                    let (r, a) = rhs(coerce_operand(pg, value));
                    (format!("{lhs} = {r}"), a)
                }
                FilterOp::Neq => {
                    let (r, a) = rhs(coerce_operand(pg, value));
                    (format!("{lhs} != {r}"), a)
                }
                FilterOp::Gt => {
                    let (r, a) = rhs(coerce_operand(pg, value));
                    (format!("{lhs} > {r}"), a)
                }
                FilterOp::Gte => {
                    let (r, a) = rhs(coerce_operand(pg, value));
                    (format!("{lhs} >= {r}"), a)
                }
                FilterOp::Lt => {
                    let (r, a) = rhs(coerce_operand(pg, value));
                    (format!("{lhs} < {r}"), a)
                }
                FilterOp::Lte => {
                    let (r, a) = rhs(coerce_operand(pg, value));
                    (format!("{lhs} <= {r}"), a)
                }
                FilterOp::Like => (
                    format!("{lhs} LIKE ?"),
                    vec![SqlArg::Text(value.replace('*', "%"))],
                ),
                FilterOp::Ilike => (
                    format!("LOWER({lhs}) LIKE LOWER(?)"),
                    vec![SqlArg::Text(value.replace('*', "%"))],
                ),
                FilterOp::In => {
                    let interior = value
                        .strip_prefix('(')
                        .and_then(|v| v.strip_suffix(')'))
                        .ok_or_else(|| {
                            DbError::BadRequest(format!("malformed in list '{value}'"))
                        })?;
                    let items = split_top_level(interior);
                    if items.is_empty() {
                        ("1 = 0".to_string(), Vec::new())
                    } else {
                        let placeholders = vec!["?"; items.len()].join(", ");
                        let args = items
                            .iter()
                            .map(|item| {
                                let item = item.trim().trim_matches('"');
                                coerce_operand(pg, item)
                            })
                            .collect();
                        (format!("{lhs} IN ({placeholders})"), args)
                    }
                }
                FilterOp::Is => match value.to_ascii_lowercase().as_str() {
                    "null" => (format!("{lhs} IS NULL"), Vec::new()),
                    "true" => (format!("{lhs} IS 1"), Vec::new()),
                    "false" => (format!("{lhs} IS 0"), Vec::new()),
                    other => {
                        return Err(DbError::BadRequest(format!(
                            "is operator accepts null, true or false, got '{other}'"
                        )))
                    }
                },
            };
            let sql = if *negated { format!("NOT ({sql})") } else { sql };
            Ok(SqlPredicate::new(sql, args))
        }
    }
}

/// ANDs filters and the RLS visibility guard into one WHERE clause.
fn where_clause(
    filters: &[FilterNode],
    columns: Option<&[ColumnDescriptor]>,
    guard: Option<&SqlPredicate>,
) -> Result<SqlPredicate, DbError> {
    let mut parts = Vec::new();
    let mut args = Vec::new();
    for node in filters {
        let pred = filter_predicate(node, columns)?;
        parts.push(format!("({})", pred.sql));
        args.extend(pred.args);
    }
    if let Some(guard) = guard {
        parts.push(format!("({})", guard.sql));
        args.extend(guard.args.clone());
    }
    Ok(SqlPredicate::new(parts.join(" AND "), args))
}

fn run_query<'q>(
    sql: &'q str,
    args: Vec<SqlArg>,
) -> sqlx::query::Query<'q, sqlx::sqlite::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    let mut query = sqlx::query(sql);
    for arg in args {
        query = arg.bind(query);
    }
    query
}

/// How a table resolves for a request: present, absent-and-hidden (anon gets
/// the empty set rather than an existence oracle), or absent-and-reportable.
enum TableResolution {
    Known(Option<std::sync::Arc<Vec<ColumnDescriptor>>>),
    Hidden,
    Missing,
}

impl Database {
    async fn resolve_table(
        &self,
        table: &str,
        ctx: &AuthContext,
    ) -> Result<TableResolution, DbError> {
        // System tables are never served over REST.
        if table.starts_with('_') || table == "auth_users" || table == "sqlite_master" {
            return Ok(if ctx.role == Role::ServiceRole {
                TableResolution::Missing
            } else {
                TableResolution::Hidden
            });
        }
        if let Some(columns) = self.table_columns(table).await? {
            return Ok(TableResolution::Known(Some(columns)));
        }
        let exists: Option<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(table)
        .fetch_optional(&self.pool)
        .await?;
        if exists.is_some() {
            // Created outside the catalog; serve it with dynamic typing.
            return Ok(TableResolution::Known(None));
        }
        Ok(if ctx.role == Role::ServiceRole {
            TableResolution::Missing
        } else {
            TableResolution::Hidden
        })
    }

    /// GET /rest/v1/{table}
    pub async fn rest_select(
        &self,
        query: &RestQuery,
        ctx: &AuthContext,
    ) -> Result<SelectResult, DbError> {
        let columns = match self.resolve_table(&query.table, ctx).await? {
            TableResolution::Known(columns) => columns,
            TableResolution::Hidden => {
                return Ok(SelectResult {
                    rows: Vec::new(),
                    total: 0,
                })
            }
            TableResolution::Missing => {
                return Err(DbError::UnknownTable(query.table.clone()))
            }
        };
        let columns_ref = columns.as_deref().map(|v| v.as_slice());

        let guards = self.rls_guards(&query.table, RlsAction::Select, ctx).await?;
        if guards.deny {
            return Ok(SelectResult {
                rows: Vec::new(),
                total: 0,
            });
        }

        let has_embeds = query
            .select
            .iter()
            .any(|item| matches!(item, SelectItem::Embed { .. }));
        // Embeds stitch on join keys the client may not have asked for; fetch
        // everything and trim to the requested shape afterwards.
        let select_list = if has_embeds {
            build_select_list(&query.select, columns_ref)?;
            "*".to_string()
        } else {
            build_select_list(&query.select, columns_ref)?
        };
        let clause = where_clause(&query.filters, columns_ref, guards.visible.as_ref())?;
        let table_sql = quote_ident(&query.table);

        let mut count_sql = format!("SELECT COUNT(*) FROM {table_sql}");
        if !clause.sql.is_empty() {
            count_sql.push_str(" WHERE ");
            count_sql.push_str(&clause.sql);
        }
        let total: i64 = run_query(&count_sql, clause.args.clone())
            .fetch_one(&self.pool)
            .await?
            .try_get(0)
            .map_err(DbError::from_sqlx)?;

        let mut sql = format!("SELECT {select_list} FROM {table_sql}");
        if !clause.sql.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clause.sql);
        }
        if !query.order.is_empty() {
            let terms: Vec<String> = query
                .order
                .iter()
                .map(|t| {
                    find_column(columns_ref, &t.column).map(|_| {
                        let mut term =
                            format!("{} {}", quote_ident(&t.column), if t.descending { "DESC" } else { "ASC" });
                        match t.nulls_first {
                            Some(true) => term.push_str(" NULLS FIRST"),
                            Some(false) => term.push_str(" NULLS LAST"),
                            None => {}
                        }
                        term
                    })
                })
                .collect::<Result<_, _>>()?;
            sql.push_str(" ORDER BY ");
            sql.push_str(&terms.join(", "));
        }
        let mut args = clause.args;
        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            args.push(SqlArg::Int(limit));
            if let Some(offset) = query.offset {
                sql.push_str(" OFFSET ?");
                args.push(SqlArg::Int(offset));
            }
        } else if let Some(offset) = query.offset {
            sql.push_str(" LIMIT -1 OFFSET ?");
            args.push(SqlArg::Int(offset));
        }

        let fetched = run_query(&sql, args).fetch_all(&self.pool).await?;
        let mut rows = Vec::with_capacity(fetched.len());
        for row in &fetched {
            rows.push(row_to_json(row, columns_ref)?);
        }

        let mut rows: Vec<Map<String, Value>> = rows;
        self.resolve_embeds(query, ctx, &mut rows).await?;

        if has_embeds {
            let keep: Vec<&str> = query
                .select
                .iter()
                .map(|item| match item {
                    SelectItem::Column(name) => name.as_str(),
                    SelectItem::Embed { relation, .. } => relation.as_str(),
                })
                .collect();
            if !keep.contains(&"*") {
                for row in rows.iter_mut() {
                    row.retain(|key, _| keep.contains(&key.as_str()));
                }
            }
        }

        Ok(SelectResult {
            rows: rows.into_iter().map(Value::Object).collect(),
            total,
        })
    }

    /// POST /rest/v1/{table} — single object or array; `merge` selects the
    /// `Prefer: resolution=merge-duplicates` UPSERT path.
    pub async fn rest_insert(
        &self,
        table: &str,
        payload: &Value,
        merge: bool,
        ctx: &AuthContext,
    ) -> Result<WriteResult, DbError> {
        let columns = self.writable_table(table, ctx).await?;
        let columns_ref = columns.as_deref().map(|v| v.as_slice());

        let objects: Vec<&Map<String, Value>> = match payload {
            Value::Object(obj) => vec![obj],
            Value::Array(items) => {
                let mut objects = Vec::with_capacity(items.len());
                for item in items {
                    objects.push(item.as_object().ok_or_else(|| {
                        DbError::BadRequest("array elements must be objects".into())
                    })?);
                }
                objects
            }
            _ => return Err(DbError::BadRequest("body must be an object or array".into())),
        };
        if objects.is_empty() {
            return Ok(WriteResult {
                rows: Vec::new(),
                events: Vec::new(),
            });
        }

        let keys: Vec<String> = objects[0].keys().cloned().collect();
        if keys.is_empty() {
            return Err(DbError::BadRequest("empty insert object".into()));
        }
        for obj in &objects {
            if obj.len() != keys.len() || !keys.iter().all(|k| obj.contains_key(k)) {
                return Err(DbError::BadRequest(
                    "all objects must have the same keys".into(),
                ));
            }
        }

        let mut validated: Vec<Vec<SqlArg>> = Vec::with_capacity(objects.len());
        for obj in &objects {
            let mut row_args = Vec::with_capacity(keys.len());
            for key in &keys {
                let value = &obj[key];
                let arg = self.validate_body_value(columns_ref, key, value)?;
                row_args.push(arg);
            }
            validated.push(row_args);
        }

        let guards = self.rls_guards(table, RlsAction::Insert, ctx).await?;
        if guards.deny {
            return Err(DbError::RlsDenied(table.to_string()));
        }

        let table_sql = quote_ident(table);
        let col_list: Vec<String> = keys.iter().map(|k| quote_ident(k)).collect();
        let row_placeholders = format!("({})", vec!["?"; keys.len()].join(", "));
        let all_placeholders = vec![row_placeholders; objects.len()].join(", ");
        let mut sql = format!(
            "INSERT INTO {table_sql} ({}) VALUES {all_placeholders}",
            col_list.join(", ")
        );
        if merge {
            let pk: Vec<String> = columns_ref
                .map(|cols| {
                    cols.iter()
                        .filter(|c| c.is_primary)
                        .map(|c| quote_ident(&c.name))
                        .collect()
                })
                .unwrap_or_default();
            if pk.is_empty() {
                return Err(DbError::BadRequest(
                    "merge-duplicates requires a declared primary key".into(),
                ));
            }
            let updates: Vec<String> = keys
                .iter()
                .map(|k| format!("{} = excluded.{}", quote_ident(k), quote_ident(k)))
                .collect();
            sql.push_str(&format!(
                " ON CONFLICT ({}) DO UPDATE SET {}",
                pk.join(", "),
                updates.join(", ")
            ));
        }
        sql.push_str(&format!(" RETURNING rowid AS {ROWID_ALIAS}, *"));

        let args: Vec<SqlArg> = validated.into_iter().flatten().collect();
        let mut tx = self.pool.begin().await?;
        let returned = run_query(&sql, args).fetch_all(&mut *tx).await?;

        self.enforce_check(&mut tx, table, guards.check.as_ref(), &returned)
            .await?;

        let now = Utc::now();
        let mut rows = Vec::with_capacity(returned.len());
        let mut events = Vec::with_capacity(returned.len());
        for row in &returned {
            let json = row_to_json(row, columns_ref)?;
            events.push(ChangeEvent {
                schema: "public".into(),
                table: table.to_string(),
                op: ChangeOp::Insert,
                old: None,
                new: Some(Value::Object(json.clone())),
                commit_timestamp: now,
            });
            rows.push(Value::Object(json));
        }
        tx.commit().await?;

        Ok(WriteResult { rows, events })
    }

    /// PATCH /rest/v1/{table}
    pub async fn rest_update(
        &self,
        query: &RestQuery,
        assignments: &Value,
        ctx: &AuthContext,
    ) -> Result<WriteResult, DbError> {
        let columns = self.writable_table(&query.table, ctx).await?;
        let columns_ref = columns.as_deref().map(|v| v.as_slice());

        let obj = assignments
            .as_object()
            .ok_or_else(|| DbError::BadRequest("body must be an object".into()))?;
        if obj.is_empty() {
            return Err(DbError::BadRequest("empty update object".into()));
        }
        let mut set_parts = Vec::with_capacity(obj.len());
        let mut set_args = Vec::with_capacity(obj.len());
        for (key, value) in obj {
            let arg = self.validate_body_value(columns_ref, key, value)?;
            set_parts.push(format!("{} = ?", quote_ident(key)));
            set_args.push(arg);
        }

        let guards = self.rls_guards(&query.table, RlsAction::Update, ctx).await?;
        if guards.deny {
            return Err(DbError::RlsDenied(query.table.clone()));
        }
        let clause = where_clause(&query.filters, columns_ref, guards.visible.as_ref())?;
        let table_sql = quote_ident(&query.table);

        let mut tx = self.pool.begin().await?;

        let mut old_sql = format!("SELECT rowid AS {ROWID_ALIAS}, * FROM {table_sql}");
        if !clause.sql.is_empty() {
            old_sql.push_str(" WHERE ");
            old_sql.push_str(&clause.sql);
        }
        let old_rows = run_query(&old_sql, clause.args.clone())
            .fetch_all(&mut *tx)
            .await?;
        let mut old_by_rowid: HashMap<i64, Map<String, Value>> = HashMap::new();
        for row in &old_rows {
            let rowid: i64 = row.try_get(ROWID_ALIAS).map_err(DbError::from_sqlx)?;
            old_by_rowid.insert(rowid, row_to_json(row, columns_ref)?);
        }

        let mut sql = format!("UPDATE {table_sql} SET {}", set_parts.join(", "));
        if !clause.sql.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clause.sql);
        }
        sql.push_str(&format!(" RETURNING rowid AS {ROWID_ALIAS}, *"));
        let mut args = set_args;
        args.extend(clause.args);
        let returned = run_query(&sql, args).fetch_all(&mut *tx).await?;

        self.enforce_check(&mut tx, &query.table, guards.check.as_ref(), &returned)
            .await?;

        let now = Utc::now();
        let mut rows = Vec::with_capacity(returned.len());
        let mut events = Vec::with_capacity(returned.len());
        for row in &returned {
            let rowid: i64 = row.try_get(ROWID_ALIAS).map_err(DbError::from_sqlx)?;
            let json = row_to_json(row, columns_ref)?;
            events.push(ChangeEvent {
                schema: "public".into(),
                table: query.table.clone(),
                op: ChangeOp::Update,
                old: old_by_rowid.remove(&rowid).map(Value::Object),
                new: Some(Value::Object(json.clone())),
                commit_timestamp: now,
            });
            rows.push(Value::Object(json));
        }
        tx.commit().await?;

        Ok(WriteResult { rows, events })
    }

    /// DELETE /rest/v1/{table}
    pub async fn rest_delete(
        &self,
        query: &RestQuery,
        ctx: &AuthContext,
    ) -> Result<WriteResult, DbError> {
        let columns = self.writable_table(&query.table, ctx).await?;
        let columns_ref = columns.as_deref().map(|v| v.as_slice());

        let guards = self.rls_guards(&query.table, RlsAction::Delete, ctx).await?;
        if guards.deny {
            return Err(DbError::RlsDenied(query.table.clone()));
        }
        let clause = where_clause(&query.filters, columns_ref, guards.visible.as_ref())?;
        let table_sql = quote_ident(&query.table);

        let mut sql = format!("DELETE FROM {table_sql}");
        if !clause.sql.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clause.sql);
        }
        sql.push_str(" RETURNING *");

        let mut tx = self.pool.begin().await?;
        let returned = run_query(&sql, clause.args).fetch_all(&mut *tx).await?;
        let now = Utc::now();
        let mut rows = Vec::with_capacity(returned.len());
        let mut events = Vec::with_capacity(returned.len());
        for row in &returned {
            let json = row_to_json(row, columns_ref)?;
            events.push(ChangeEvent {
                schema: "public".into(),
                table: query.table.clone(),
                op: ChangeOp::Delete,
                old: Some(Value::Object(json.clone())),
                new: None,
                commit_timestamp: now,
            });
            rows.push(Value::Object(json));
        }
        tx.commit().await?;

        Ok(WriteResult { rows, events })
    }

    /// Write-path table resolution: unknown tables are a 404; hidden-for-anon
    /// semantics only apply to reads.
    async fn writable_table(
        &self,
        table: &str,
        ctx: &AuthContext,
    ) -> Result<Option<std::sync::Arc<Vec<ColumnDescriptor>>>, DbError> {
        match self.resolve_table(table, ctx).await? {
            TableResolution::Known(columns) => Ok(columns),
            TableResolution::Hidden | TableResolution::Missing => {
                Err(DbError::UnknownTable(table.to_string()))
            }
        }
    }

    fn validate_body_value(
        &self,
        columns: Option<&[ColumnDescriptor]>,
        key: &str,
        value: &Value,
    ) -> Result<SqlArg, DbError> {
        match columns {
            Some(cols) => {
                let descriptor = cols
                    .iter()
                    .find(|c| c.name == key)
                    .ok_or_else(|| DbError::UnknownBodyColumn(key.to_string()))?;
                if value.is_null() && !descriptor.nullable && descriptor.default_value.is_none() {
                    return Err(DbError::NotNull(key.to_string()));
                }
                descriptor.pg_type.validate(key, value)
            }
            // No catalog entry (table created outside migrations): best-effort
            // dynamic binding.
            None => Ok(match value {
                Value::Null => SqlArg::Null,
                Value::Bool(b) => SqlArg::Int(i64::from(*b)),
                Value::Number(n) => n
                    .as_i64()
                    .map(SqlArg::Int)
                    .or_else(|| n.as_f64().map(SqlArg::Real))
                    .unwrap_or(SqlArg::Null),
                Value::String(s) => SqlArg::Text(s.clone()),
                other => SqlArg::Text(other.to_string()),
            }),
        }
    }

    /// Validates the RLS `WITH CHECK` predicate against every written row,
    /// aborting the transaction on the first violation.
    async fn enforce_check(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::sqlite::Sqlite>,
        table: &str,
        check: Option<&SqlPredicate>,
        returned: &[SqliteRow],
    ) -> Result<(), DbError> {
        let Some(check) = check else {
            return Ok(());
        };
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE rowid = ? AND ({})",
            quote_ident(table),
            check.sql
        );
        for row in returned {
            let rowid: i64 = row.try_get(ROWID_ALIAS).map_err(DbError::from_sqlx)?;
            let mut args = vec![SqlArg::Int(rowid)];
            args.extend(check.args.clone());
            let passes: i64 = run_query(&sql, args)
                .fetch_one(&mut **tx)
                .await?
                .try_get(0)
                .map_err(DbError::from_sqlx)?;
            if passes == 0 {
                return Err(DbError::RlsDenied(table.to_string()));
            }
        }
        Ok(())
    }

    /// Runs one inner query per embedded relation and stitches the results
    /// onto the parent rows.
    async fn resolve_embeds(
        &self,
        query: &RestQuery,
        ctx: &AuthContext,
        rows: &mut [Map<String, Value>],
    ) -> Result<(), DbError> {
        for item in &query.select {
            let SelectItem::Embed { relation, columns } = item else {
                continue;
            };
            self.resolve_one_embed(&query.table, relation, columns, ctx, rows)
                .await?;
        }
        Ok(())
    }

    async fn resolve_one_embed(
        &self,
        parent: &str,
        relation: &str,
        embed_columns: &[String],
        ctx: &AuthContext,
        rows: &mut [Map<String, Value>],
    ) -> Result<(), DbError> {
        // Child→parent FK means one-to-many (array); parent→child means
        // many-to-one (object).
        let link = match self.fk_between(relation, parent).await? {
            Some((child_col, parent_col)) => Some((true, child_col, parent_col)),
            None => self
                .fk_between(parent, relation)
                .await?
                .map(|(parent_fk, child_key)| (false, parent_fk, child_key)),
        };
        let Some((one_to_many, near_col, far_col)) = link else {
            // Unknown relation: empty result, not an error.
            for row in rows.iter_mut() {
                row.insert(relation.to_string(), Value::Array(Vec::new()));
            }
            return Ok(());
        };

        let guards = self.rls_guards(relation, RlsAction::Select, ctx).await?;
        if guards.deny {
            for row in rows.iter_mut() {
                let empty = if one_to_many {
                    Value::Array(Vec::new())
                } else {
                    Value::Null
                };
                row.insert(relation.to_string(), empty);
            }
            return Ok(());
        }

        // Key column on the parent side.
        let (parent_key, child_key) = if one_to_many {
            (far_col, near_col)
        } else {
            (near_col, far_col)
        };

        let mut keys = Vec::new();
        for row in rows.iter() {
            if let Some(v) = row.get(&parent_key) {
                if !v.is_null() && !keys.contains(v) {
                    keys.push(v.clone());
                }
            }
        }
        if keys.is_empty() {
            for row in rows.iter_mut() {
                let empty = if one_to_many {
                    Value::Array(Vec::new())
                } else {
                    Value::Null
                };
                row.insert(relation.to_string(), empty);
            }
            return Ok(());
        }

        let embed_catalog = self.table_columns(relation).await?;
        let embed_ref = embed_catalog.as_deref().map(|v| v.as_slice());

        let select_list = if embed_columns.is_empty()
            || embed_columns.iter().any(|c| c == "*")
        {
            "*".to_string()
        } else {
            let mut list: Vec<String> = Vec::new();
            for col in embed_columns {
                find_column(embed_ref, col)?;
                list.push(quote_ident(col));
            }
            // The join key is needed for stitching even when not requested.
            if !embed_columns.contains(&child_key) {
                list.push(quote_ident(&child_key));
            }
            list.join(", ")
        };

        let placeholders = vec!["?"; keys.len()].join(", ");
        let mut sql = format!(
            "SELECT {select_list} FROM {} WHERE {} IN ({placeholders})",
            quote_ident(relation),
            quote_ident(&child_key)
        );
        let mut args: Vec<SqlArg> = keys
            .iter()
            .map(|v| match v {
                Value::Number(n) => n
                    .as_i64()
                    .map(SqlArg::Int)
                    .or_else(|| n.as_f64().map(SqlArg::Real))
                    .unwrap_or(SqlArg::Null),
                Value::String(s) => SqlArg::Text(s.clone()),
                other => SqlArg::Text(other.to_string()),
            })
            .collect();
        if let Some(guard) = &guards.visible {
            sql.push_str(&format!(" AND ({})", guard.sql));
            args.extend(guard.args.clone());
        }

        let fetched = run_query(&sql, args).fetch_all(&self.pool).await?;
        let mut grouped: HashMap<String, Vec<Map<String, Value>>> = HashMap::new();
        for row in &fetched {
            let mut json = row_to_json(row, embed_ref)?;
            let key = json
                .get(&child_key)
                .map(value_key)
                .unwrap_or_default();
            if !embed_columns.is_empty()
                && !embed_columns.iter().any(|c| c == "*")
                && !embed_columns.contains(&child_key)
            {
                json.remove(&child_key);
            }
            grouped.entry(key).or_default().push(json);
        }

        for row in rows.iter_mut() {
            let key = row.get(&parent_key).map(value_key).unwrap_or_default();
            let matched = grouped.get(&key);
            let value = if one_to_many {
                Value::Array(
                    matched
                        .map(|items| items.iter().cloned().map(Value::Object).collect())
                        .unwrap_or_default(),
                )
            } else {
                matched
                    .and_then(|items| items.first())
                    .map(|obj| Value::Object(obj.clone()))
                    .unwrap_or(Value::Null)
            };
            row.insert(relation.to_string(), value);
        }
        Ok(())
    }

    /// The first FK on `from_table` referencing `to_table`, as
    /// (from_column, to_column).
    async fn fk_between(
        &self,
        from_table: &str,
        to_table: &str,
    ) -> Result<Option<(String, String)>, DbError> {
        let sql = format!("PRAGMA foreign_key_list({})", quote_ident(from_table));
        let rows = match sqlx::query(&sql).fetch_all(&self.pool).await {
            Ok(rows) => rows,
            // Pragma on a missing table errors; treat as no relation.
            Err(_) => return Ok(None),
        };
        for row in rows {
            let target: String = row.try_get("table").map_err(DbError::from_sqlx)?;
            if target == to_table {
                let from: String = row.try_get("from").map_err(DbError::from_sqlx)?;
                let to: Option<String> = row.try_get("to").map_err(DbError::from_sqlx)?;
                let to = match to {
                    Some(to) => to,
                    // An implicit reference targets the primary key.
                    None => match self.table_columns(to_table).await? {
                        Some(cols) => cols
                            .iter()
                            .find(|c| c.is_primary)
                            .map(|c| c.name.clone())
                            .unwrap_or_else(|| "id".to_string()),
                        None => "id".to_string(),
                    },
                };
                return Ok(Some((from, to)));
            }
        }
        Ok(None)
    }
}

/// Stable string key for grouping embed rows by join value.
fn value_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn build_select_list(
    select: &[SelectItem],
    columns: Option<&[ColumnDescriptor]>,
) -> Result<String, DbError> {
    let explicit: Vec<&String> = select
        .iter()
        .filter_map(|item| match item {
            SelectItem::Column(name) => Some(name),
            SelectItem::Embed { .. } => None,
        })
        .collect();
    if explicit.is_empty() || explicit.iter().any(|c| c.as_str() == "*") {
        return Ok("*".to_string());
    }
    let mut list = Vec::with_capacity(explicit.len());
    for name in explicit {
        find_column(columns, name)?;
        list.push(quote_ident(name));
    }
    Ok(list.join(", "))
}

/// Decodes one result row into a JSON object, using the catalog types where
/// known and SQLite's runtime types otherwise. Internal helper columns are
/// skipped.
pub(crate) fn row_to_json(
    row: &SqliteRow,
    columns: Option<&[ColumnDescriptor]>,
) -> Result<Map<String, Value>, DbError> {
    let mut out = Map::new();
    for (idx, col) in row.columns().iter().enumerate() {
        let name = col.name();
        if name.starts_with("__sblite") {
            continue;
        }
        let pg = columns.and_then(|cols| {
            cols.iter().find(|c| c.name == name).map(|c| c.pg_type)
        });
        out.insert(name.to_string(), decode_column_value(row, idx, pg)?);
    }
    Ok(out)
}

/// Decodes a single column value to JSON.
pub(crate) fn decode_column_value(
    row: &SqliteRow,
    idx: usize,
    pg: Option<PgType>,
) -> Result<Value, DbError> {
    let raw = row.try_get_raw(idx).map_err(DbError::from_sqlx)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let runtime_type = raw.type_info().name().to_string();
    drop(raw);

    match pg {
        Some(PgType::Integer) => {
            let v: i64 = row.try_get(idx).map_err(DbError::from_sqlx)?;
            Ok(Value::Number(Number::from(v)))
        }
        Some(PgType::Boolean) => {
            let v: i64 = row.try_get(idx).map_err(DbError::from_sqlx)?;
            Ok(Value::Bool(v != 0))
        }
        Some(PgType::Jsonb) => {
            let s: String = row.try_get(idx).map_err(DbError::from_sqlx)?;
            Ok(serde_json::from_str(&s).unwrap_or(Value::String(s)))
        }
        Some(PgType::Numeric) => {
            let s: String = match runtime_type.as_str() {
                "TEXT" => row.try_get(idx).map_err(DbError::from_sqlx)?,
                _ => {
                    let v: f64 = row.try_get(idx).map_err(DbError::from_sqlx)?;
                    v.to_string()
                }
            };
            if let Ok(n) = s.parse::<i64>() {
                Ok(Value::Number(Number::from(n)))
            } else if let Some(n) = s.parse::<f64>().ok().and_then(Number::from_f64) {
                Ok(Value::Number(n))
            } else {
                Ok(Value::String(s))
            }
        }
        Some(PgType::Bytea) => {
            use base64::{engine::general_purpose::STANDARD, Engine as _};
            let v: Vec<u8> = row.try_get(idx).map_err(DbError::from_sqlx)?;
            Ok(Value::String(STANDARD.encode(v)))
        }
        Some(PgType::Uuid) | Some(PgType::Text) | Some(PgType::Timestamptz) => {
            let v: String = row.try_get(idx).map_err(DbError::from_sqlx)?;
            Ok(Value::String(v))
        }
        None => match runtime_type.as_str() {
            "INTEGER" => {
                let v: i64 = row.try_get(idx).map_err(DbError::from_sqlx)?;
                Ok(Value::Number(Number::from(v)))
            }
            "REAL" => {
                let v: f64 = row.try_get(idx).map_err(DbError::from_sqlx)?;
                Ok(Number::from_f64(v)
                    .map(Value::Number)
                    .unwrap_or(Value::Null))
            }
            "BLOB" => {
                use base64::{engine::general_purpose::STANDARD, Engine as _};
                let v: Vec<u8> = row.try_get(idx).map_err(DbError::from_sqlx)?;
                Ok(Value::String(STANDARD.encode(v)))
            }
            _ => {
                let v: String = row.try_get(idx).map_err(DbError::from_sqlx)?;
                Ok(Value::String(v))
            }
        },
    }
}
