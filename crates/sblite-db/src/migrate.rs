//! Filesystem migration runner.
//!
//! Discovers `<14-digit-timestamp>_<name>.sql` files, applies the pending set
//! in ascending version order, and keeps `_schema_migrations` in lock-step:
//! each migration commits atomically with its record, or not at all.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use sqlx::Row;
use thiserror::Error;
use tracing::{info, warn};

use crate::auth::AuthContext;
use crate::error::DbError;
use crate::translate::split_statements;
use crate::Database;

lazy_static! {
    static ref MIGRATION_FILENAME: Regex =
        Regex::new(r"^(\d{14})_([A-Za-z0-9_]+)\.sql$").expect("migration filename regex");
}

/// A `_schema_migrations` row.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationRecord {
    pub version: String,
    pub name: String,
    pub applied_at: DateTime<Utc>,
}

/// A migration file waiting on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMigration {
    pub version: String,
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("migration {version} failed at statement {index}: {source}")]
    Statement {
        version: String,
        index: usize,
        statement: String,
        #[source]
        source: DbError,
    },
    #[error("failed to read migration {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Db(#[from] DbError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    AlreadyApplied,
}

/// Runner over a migrations directory. Apply is serialized by construction:
/// the daemon runs it once at startup before serving requests.
#[derive(Debug)]
pub struct MigrationRunner<'a> {
    db: &'a Database,
    dir: PathBuf,
}

impl<'a> MigrationRunner<'a> {
    pub fn new(db: &'a Database, dir: impl Into<PathBuf>) -> Self {
        Self {
            db,
            dir: dir.into(),
        }
    }

    /// Migration files on disk, ascending by version. A missing directory is
    /// an empty list, not an error; non-matching filenames are skipped.
    pub async fn discover(&self) -> Result<Vec<PendingMigration>, MigrateError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(MigrateError::Io {
                    path: self.dir.clone(),
                    source: err,
                })
            }
        };
        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|err| MigrateError::Io {
            path: self.dir.clone(),
            source: err,
        })? {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let Some(captures) = MIGRATION_FILENAME.captures(file_name) else {
                continue;
            };
            found.push(PendingMigration {
                version: captures[1].to_string(),
                name: captures[2].to_string(),
                path: entry.path(),
            });
        }
        found.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(found)
    }

    /// Versions already recorded in `_schema_migrations`.
    pub async fn applied(&self) -> Result<Vec<MigrationRecord>, MigrateError> {
        let rows = sqlx::query(
            "SELECT version, name, applied_at FROM _schema_migrations ORDER BY version",
        )
        .fetch_all(self.db.pool())
        .await
        .map_err(DbError::from_sqlx)?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let applied_at: String = row.try_get("applied_at").map_err(DbError::from_sqlx)?;
            records.push(MigrationRecord {
                version: row.try_get("version").map_err(DbError::from_sqlx)?,
                name: row.try_get("name").map_err(DbError::from_sqlx)?,
                applied_at: DateTime::parse_from_rfc3339(&applied_at)
                    .map_err(|err| DbError::Internal(format!("bad applied_at: {err}")))?
                    .with_timezone(&Utc),
            });
        }
        Ok(records)
    }

    /// Discovered migrations not yet applied, ascending by version. A pending
    /// version older than the highest applied one is still included: apply is
    /// forward-only with no gap detection.
    pub async fn pending(&self) -> Result<Vec<PendingMigration>, MigrateError> {
        let applied: Vec<String> = self
            .applied()
            .await?
            .into_iter()
            .map(|r| r.version)
            .collect();
        Ok(self
            .discover()
            .await?
            .into_iter()
            .filter(|m| !applied.contains(&m.version))
            .collect())
    }

    /// Applies every pending migration, stopping at the first failure.
    pub async fn apply_all(&self) -> Result<Vec<MigrationRecord>, MigrateError> {
        let mut applied = Vec::new();
        for migration in self.pending().await? {
            match self.apply(&migration).await? {
                ApplyOutcome::Applied => {
                    info!(version = %migration.version, name = %migration.name, "applied migration");
                    applied.push(MigrationRecord {
                        version: migration.version,
                        name: migration.name,
                        applied_at: Utc::now(),
                    });
                }
                ApplyOutcome::AlreadyApplied => {}
            }
        }
        Ok(applied)
    }

    /// Applies one migration inside a single transaction. Function and policy
    /// DDL is intercepted into the catalogs; everything commits together with
    /// the `_schema_migrations` row, or rolls back together.
    pub async fn apply(&self, migration: &PendingMigration) -> Result<ApplyOutcome, MigrateError> {
        let already: Option<String> =
            sqlx::query_scalar("SELECT version FROM _schema_migrations WHERE version = ?")
                .bind(&migration.version)
                .fetch_optional(self.db.pool())
                .await
                .map_err(DbError::from_sqlx)?;
        if already.is_some() {
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        let source =
            tokio::fs::read_to_string(&migration.path)
                .await
                .map_err(|err| MigrateError::Io {
                    path: migration.path.clone(),
                    source: err,
                })?;
        let statements = split_statements(&source)?;
        let ctx = AuthContext::service_role();

        let mut tx = self.db.pool().begin().await.map_err(DbError::from_sqlx)?;
        for (index, stmt) in statements.iter().enumerate() {
            if let Err(source) = self
                .db
                .dispatch_statement(&mut *tx, stmt, &ctx, false)
                .await
            {
                warn!(
                    version = %migration.version,
                    statement = index + 1,
                    "migration failed; rolling back"
                );
                return Err(MigrateError::Statement {
                    version: migration.version.clone(),
                    index: index + 1,
                    statement: snippet(stmt),
                    source,
                });
            }
        }
        sqlx::query("INSERT INTO _schema_migrations (version, name, applied_at) VALUES (?, ?, ?)")
            .bind(&migration.version)
            .bind(&migration.name)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(DbError::from_sqlx)?;
        tx.commit().await.map_err(DbError::from_sqlx)?;

        self.db.invalidate_catalog();
        self.db.invalidate_policies();
        Ok(ApplyOutcome::Applied)
    }
}

pub fn is_migration_filename(name: &str) -> bool {
    MIGRATION_FILENAME.is_match(name)
}

fn snippet(stmt: &str) -> String {
    let flat = stmt.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() > 120 {
        let capped: String = flat.chars().take(120).collect();
        format!("{capped}…")
    } else {
        flat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_contract_is_strict() {
        assert!(is_migration_filename("20240601120000_create_users.sql"));
        assert!(is_migration_filename("20240601120000_v2.sql"));
        assert!(!is_migration_filename("20240601_create_users.sql"));
        assert!(!is_migration_filename("create_users.sql"));
        assert!(!is_migration_filename("20240601120000_create-users.sql"));
        assert!(!is_migration_filename("20240601120000_create_users.sql.bak"));
    }

    #[test]
    fn snippets_are_flattened_and_capped() {
        let long = format!("SELECT {}", "x, ".repeat(100));
        assert!(snippet(&long).len() <= 124);
        assert_eq!(snippet("SELECT\n  1"), "SELECT 1");
    }
}
