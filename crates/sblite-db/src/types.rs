//! PostgreSQL-facing column types and value validation.
//!
//! Validation is a total function per variant: it either produces the
//! normalized SQLite storage value or a type error. It runs before any SQL is
//! generated, so rejected payloads never touch the database.

use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::DateTime;
use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments};
use uuid::Uuid;

use crate::error::DbError;

/// The closed set of PostgreSQL types sblite tracks per column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgType {
    Uuid,
    Text,
    Integer,
    Numeric,
    Boolean,
    Timestamptz,
    Jsonb,
    Bytea,
}

impl PgType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PgType::Uuid => "uuid",
            PgType::Text => "text",
            PgType::Integer => "integer",
            PgType::Numeric => "numeric",
            PgType::Boolean => "boolean",
            PgType::Timestamptz => "timestamptz",
            PgType::Jsonb => "jsonb",
            PgType::Bytea => "bytea",
        }
    }

    /// Whether the name denotes a scalar type (used by the RPC layer to pick
    /// scalar vs object result shaping).
    pub fn is_scalar(name: &str) -> bool {
        PgType::from_str(name).is_ok()
    }
}

impl FromStr for PgType {
    type Err = DbError;

    /// Accepts the canonical names plus the common PostgreSQL aliases seen in
    /// DDL. Anything else is a declaration error.
    fn from_str(value: &str) -> Result<Self, DbError> {
        match value.to_ascii_lowercase().as_str() {
            "uuid" => Ok(PgType::Uuid),
            "text" | "varchar" | "char" | "character" | "citext" => Ok(PgType::Text),
            "integer" | "int" | "int2" | "int4" | "int8" | "smallint" | "bigint" | "serial"
            | "bigserial" => Ok(PgType::Integer),
            "numeric" | "decimal" | "real" | "float4" | "float8" => Ok(PgType::Numeric),
            "boolean" | "bool" => Ok(PgType::Boolean),
            "timestamptz" | "timestamp" => Ok(PgType::Timestamptz),
            "jsonb" | "json" => Ok(PgType::Jsonb),
            "bytea" => Ok(PgType::Bytea),
            other => Err(DbError::BadRequest(format!(
                "unrecognized column type '{other}'"
            ))),
        }
    }
}

/// A value ready to be bound into generated SQL.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlArg {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlArg {
    pub fn bind<'q>(
        self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Query<'q, Sqlite, SqliteArguments<'q>> {
        match self {
            SqlArg::Null => query.bind(None::<String>),
            SqlArg::Int(v) => query.bind(v),
            SqlArg::Real(v) => query.bind(v),
            SqlArg::Text(v) => query.bind(v),
            SqlArg::Blob(v) => query.bind(v),
        }
    }
}

/// A piece of SQL plus the arguments bound into its placeholders, in order.
#[derive(Debug, Clone, Default)]
pub struct SqlPredicate {
    pub sql: String,
    pub args: Vec<SqlArg>,
}

impl SqlPredicate {
    pub fn new(sql: impl Into<String>, args: Vec<SqlArg>) -> Self {
        Self {
            sql: sql.into(),
            args,
        }
    }
}

impl PgType {
    /// Validates a JSON value against this type and returns the normalized
    /// storage representation. `Null` passes here; nullability is the
    /// catalog's concern.
    pub fn validate(&self, column: &str, value: &Value) -> Result<SqlArg, DbError> {
        if value.is_null() {
            return Ok(SqlArg::Null);
        }
        let fail = |message: String| DbError::Type {
            column: column.to_string(),
            message,
        };
        match self {
            PgType::Uuid => {
                let s = value
                    .as_str()
                    .ok_or_else(|| fail("expected a uuid string".into()))?;
                // Canonical hyphenated form only; case is preserved as sent.
                if s.len() == 36 && Uuid::parse_str(s).is_ok() {
                    Ok(SqlArg::Text(s.to_string()))
                } else {
                    Err(fail(format!("'{s}' is not a valid uuid")))
                }
            }
            PgType::Text => {
                let s = value
                    .as_str()
                    .ok_or_else(|| fail("expected a string".into()))?;
                Ok(SqlArg::Text(s.to_string()))
            }
            PgType::Integer => {
                let n = value
                    .as_i64()
                    .ok_or_else(|| fail("expected an integer".into()))?;
                if n < i32::MIN as i64 || n > i32::MAX as i64 {
                    Err(fail(format!("{n} is out of range for type integer")))
                } else {
                    Ok(SqlArg::Int(n))
                }
            }
            PgType::Numeric => match value {
                Value::Number(n) => Ok(SqlArg::Text(n.to_string())),
                Value::String(s) if is_decimal_string(s) => Ok(SqlArg::Text(s.clone())),
                _ => Err(fail("expected a number or decimal string".into())),
            },
            PgType::Boolean => match value {
                Value::Bool(b) => Ok(SqlArg::Int(i64::from(*b))),
                Value::Number(n) if n.as_i64() == Some(0) => Ok(SqlArg::Int(0)),
                Value::Number(n) if n.as_i64() == Some(1) => Ok(SqlArg::Int(1)),
                Value::String(s) if s == "true" || s == "1" => Ok(SqlArg::Int(1)),
                Value::String(s) if s == "false" || s == "0" => Ok(SqlArg::Int(0)),
                other => Err(fail(format!("'{other}' is not a valid boolean"))),
            },
            PgType::Timestamptz => {
                let s = value
                    .as_str()
                    .ok_or_else(|| fail("expected an ISO-8601 timestamp".into()))?;
                DateTime::parse_from_rfc3339(s)
                    .map_err(|err| fail(format!("'{s}' is not a valid timestamptz: {err}")))?;
                Ok(SqlArg::Text(s.to_string()))
            }
            PgType::Jsonb => Ok(SqlArg::Text(value.to_string())),
            PgType::Bytea => {
                let s = value
                    .as_str()
                    .ok_or_else(|| fail("expected a base64 string".into()))?;
                let bytes = STANDARD
                    .decode(s)
                    .map_err(|err| fail(format!("invalid base64: {err}")))?;
                Ok(SqlArg::Blob(bytes))
            }
        }
    }
}

fn is_decimal_string(s: &str) -> bool {
    let mut chars = s.chars().peekable();
    if matches!(chars.peek(), Some('+' | '-')) {
        chars.next();
    }
    let mut digits = 0usize;
    let mut dots = 0usize;
    for c in chars {
        match c {
            '0'..='9' => digits += 1,
            '.' => dots += 1,
            _ => return false,
        }
    }
    digits > 0 && dots <= 1
}
