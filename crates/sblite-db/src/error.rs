//! Error taxonomy shared by the REST, RPC and dashboard paths.
//!
//! Every client-visible failure renders as the PostgREST envelope
//! `{code, message, details, hint}` with SQLSTATE-style codes where one is
//! meaningful.

use serde::Serialize;
use thiserror::Error;

/// Wire shape of every error body the daemon emits.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("invalid value for column '{column}': {message}")]
    Type { column: String, message: String },

    #[error("column '{0}' does not exist")]
    UnknownColumn(String),

    #[error("column '{0}' is not allowed in the request body")]
    UnknownBodyColumn(String),

    #[error("null value in column '{0}' violates not-null constraint")]
    NotNull(String),

    #[error("relation '{0}' does not exist")]
    UnknownTable(String),

    #[error("function {0} does not exist")]
    UndefinedFunction(String),

    #[error("missing required argument '{arg}' for function {function}")]
    MissingArgument { function: String, arg: String },

    #[error("language '{0}' is not supported; only LANGUAGE sql functions are accepted")]
    UnsupportedLanguage(String),

    #[error("function '{0}' already exists")]
    DuplicateFunction(String),

    #[error("new row violates row-level security policy for table '{0}'")]
    RlsDenied(String),

    #[error("duplicate key value violates unique constraint")]
    UniqueViolation { details: String },

    #[error("insert or update violates foreign key constraint")]
    ForeignKeyViolation { details: String },

    #[error("JSON object requested, multiple (or no) rows returned")]
    SingularityViolation { rows: usize },

    #[error("{0}")]
    BadRequest(String),

    #[error("database error")]
    Sqlite { message: String },

    #[error("{0}")]
    Internal(String),
}

impl DbError {
    /// HTTP status the daemon should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            DbError::Type { .. }
            | DbError::UnknownColumn(_)
            | DbError::UnknownBodyColumn(_)
            | DbError::NotNull(_)
            | DbError::BadRequest(_)
            | DbError::UnsupportedLanguage(_)
            | DbError::MissingArgument { .. } => 400,
            DbError::RlsDenied(_) => 403,
            DbError::UnknownTable(_) | DbError::UndefinedFunction(_) => 404,
            DbError::SingularityViolation { .. } => 406,
            DbError::UniqueViolation { .. }
            | DbError::DuplicateFunction(_)
            | DbError::ForeignKeyViolation { .. } => 409,
            DbError::Sqlite { .. } | DbError::Internal(_) => 500,
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        let (code, details, hint) = match self {
            DbError::Type { message, .. } => ("22P02", Some(message.clone()), None),
            DbError::UnknownColumn(_) => ("42703", None, None),
            DbError::UnknownBodyColumn(_) => ("PGRST204", None, None),
            DbError::NotNull(_) => ("23502", None, None),
            DbError::UnknownTable(_) => ("42P01", None, None),
            DbError::UndefinedFunction(_) | DbError::MissingArgument { .. } => {
                ("42883", None, None)
            }
            DbError::UnsupportedLanguage(_) => ("0A000", None, None),
            DbError::DuplicateFunction(_) => ("42723", None, None),
            DbError::RlsDenied(_) => ("42501", None, None),
            DbError::UniqueViolation { details } => ("23505", Some(details.clone()), None),
            DbError::ForeignKeyViolation { details } => ("23503", Some(details.clone()), None),
            DbError::SingularityViolation { rows } => (
                "PGRST116",
                Some(format!("{rows} rows returned")),
                Some("use Accept: application/json for multi-row results".to_string()),
            ),
            DbError::BadRequest(_) => ("PGRST100", None, None),
            DbError::Sqlite { message } => ("PGRST500", Some(message.clone()), None),
            DbError::Internal(_) => ("PGRST500", None, None),
        };
        ErrorEnvelope {
            code: code.to_string(),
            message: self.to_string(),
            details,
            hint,
        }
    }

    /// Maps a sqlx error to the taxonomy, recognizing the SQLite unique and
    /// foreign-key violation codes the same way PostgREST maps SQLSTATEs.
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => {
                let message = db_err.message().to_string();
                let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
                if code == "2067" || code == "1555" || message.contains("UNIQUE constraint") {
                    DbError::UniqueViolation { details: message }
                } else if code == "787" || message.contains("FOREIGN KEY constraint") {
                    DbError::ForeignKeyViolation { details: message }
                } else {
                    DbError::Sqlite { message }
                }
            }
            _ => DbError::Sqlite {
                message: err.to_string(),
            },
        }
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        DbError::from_sqlx(err)
    }
}
