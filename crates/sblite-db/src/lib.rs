//! sblite persistence and query engine: a PostgreSQL-flavored surface over a
//! single SQLite file.
//!
//! This crate owns the type catalog, the PG→SQLite translator, the migration
//! runner, the RLS engine, the PostgREST-style query compiler and the stored
//! function (RPC) subsystem. The daemon crate wires it to HTTP.

pub mod auth;
pub mod catalog;
pub mod error;
pub mod migrate;
pub mod rest;
pub mod rls;
pub mod rpc;
pub mod sql;
pub mod translate;
pub mod types;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::SqliteConnection;
use sqlx::SqlitePool;
use tracing::debug;

use crate::catalog::ColumnDescriptor;
use crate::error::DbError;
use crate::rls::TablePolicies;

pub use crate::auth::{AuthContext, AuthError, JwtKeys, Role};
pub use crate::catalog::ColumnDescriptor as Column;
pub use crate::error::ErrorEnvelope;
pub use crate::migrate::{ApplyOutcome, MigrateError, MigrationRecord, MigrationRunner};
pub use crate::rest::{ChangeEvent, ChangeOp, RestQuery, SelectResult, WriteResult};
pub use crate::rpc::{FunctionDef, RpcResult};
pub use crate::sql::SqlOutcome;
pub use crate::types::PgType;

/// SQLite busy timeout when the database is under write load.
const SQLITE_BUSY_TIMEOUT_MS: u64 = 5_000;

/// DDL for the reserved system tables, executed idempotently at connect.
/// `auth_users` is schema-only here; the auth collaborator owns its rows.
const SYSTEM_TABLES_SQL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS _columns (
        table_name TEXT NOT NULL,
        column_name TEXT NOT NULL,
        pg_type TEXT NOT NULL,
        nullable INTEGER NOT NULL DEFAULT 1,
        default_value TEXT,
        is_primary INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (table_name, column_name)
    )",
    "CREATE TABLE IF NOT EXISTS _schema_migrations (
        version TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        applied_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS _rls_policies (
        id TEXT PRIMARY KEY,
        table_name TEXT NOT NULL,
        policy_name TEXT NOT NULL,
        command TEXT NOT NULL DEFAULT 'ALL',
        using_expr TEXT,
        check_expr TEXT,
        enabled INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (table_name, policy_name)
    )",
    "CREATE TABLE IF NOT EXISTS _rpc_functions (
        name TEXT PRIMARY KEY,
        language TEXT NOT NULL DEFAULT 'sql',
        return_type TEXT NOT NULL,
        returns_set INTEGER NOT NULL DEFAULT 0,
        volatility TEXT NOT NULL DEFAULT 'volatile',
        security TEXT NOT NULL DEFAULT 'invoker',
        source_pg TEXT NOT NULL,
        source_sqlite TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS _rpc_function_args (
        function_name TEXT NOT NULL,
        position INTEGER NOT NULL,
        arg_name TEXT NOT NULL,
        pg_type TEXT NOT NULL,
        default_value TEXT,
        PRIMARY KEY (function_name, position)
    )",
    "CREATE TABLE IF NOT EXISTS _dashboard (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS auth_users (
        id TEXT PRIMARY KEY,
        email TEXT UNIQUE,
        encrypted_password TEXT,
        raw_app_meta_data TEXT,
        raw_user_meta_data TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
];

/// Primary entry point to the persistence layer. Cheap to clone; all clones
/// share the pool and the metadata caches.
#[derive(Clone, Debug)]
pub struct Database {
    pub(crate) pool: SqlitePool,
    pub(crate) catalog_cache: Arc<RwLock<HashMap<String, Arc<Vec<ColumnDescriptor>>>>>,
    pub(crate) policy_cache: Arc<RwLock<HashMap<String, Arc<TablePolicies>>>>,
}

impl Database {
    /// Opens (or creates) the database, configures WAL mode, and bootstraps
    /// the system tables.
    pub async fn connect(url: &str) -> Result<Self, DbError> {
        let in_memory = url.contains(":memory:");
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|err| DbError::Internal(format!("invalid database url '{url}': {err}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(SQLITE_BUSY_TIMEOUT_MS))
            .foreign_keys(true);

        // A :memory: database exists once per connection; cap the pool so
        // every query sees the same data.
        let max_connections = if in_memory { 1 } else { 8 };
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(DbError::from_sqlx)?;

        let db = Self {
            pool,
            catalog_cache: Arc::new(RwLock::new(HashMap::new())),
            policy_cache: Arc::new(RwLock::new(HashMap::new())),
        };
        db.bootstrap().await?;
        Ok(db)
    }

    /// Opens a database file by path.
    pub async fn connect_file(path: &std::path::Path) -> Result<Self, DbError> {
        let url = format!("sqlite://{}", path.display());
        Self::connect(&url).await
    }

    async fn bootstrap(&self) -> Result<(), DbError> {
        for ddl in SYSTEM_TABLES_SQL {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        debug!("system tables ready");
        Ok(())
    }

    /// The underlying pool, for callers composing their own queries.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Reads a `_dashboard` key-value entry.
    pub async fn dashboard_get(&self, key: &str) -> Result<Option<String>, DbError> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM _dashboard WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value)
    }

    /// Writes a `_dashboard` entry via the shared pool.
    pub async fn dashboard_set(&self, key: &str, value: &str) -> Result<(), DbError> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from_sqlx)?;
        self.dashboard_set_on(&mut conn, key, value).await
    }

    /// Writes a `_dashboard` entry inside the caller's transaction.
    pub(crate) async fn dashboard_set_on(
        &self,
        conn: &mut SqliteConnection,
        key: &str,
        value: &str,
    ) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO _dashboard (key, value) VALUES (?, ?) \
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(conn)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_db() -> Database {
        Database::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn connect_bootstraps_system_tables() {
        let db = setup_db().await;
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(db.pool())
        .await
        .unwrap();
        for expected in [
            "_columns",
            "_dashboard",
            "_rls_policies",
            "_rpc_function_args",
            "_rpc_functions",
            "_schema_migrations",
            "auth_users",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }

    #[tokio::test]
    async fn bootstrap_is_idempotent() {
        let db = setup_db().await;
        db.bootstrap().await.unwrap();
    }

    #[tokio::test]
    async fn dashboard_kv_round_trips() {
        let db = setup_db().await;
        assert_eq!(db.dashboard_get("missing").await.unwrap(), None);
        db.dashboard_set("rls_enabled:notes", "true").await.unwrap();
        assert_eq!(
            db.dashboard_get("rls_enabled:notes").await.unwrap().as_deref(),
            Some("true")
        );
        db.dashboard_set("rls_enabled:notes", "false").await.unwrap();
        assert_eq!(
            db.dashboard_get("rls_enabled:notes").await.unwrap().as_deref(),
            Some("false")
        );
    }
}
