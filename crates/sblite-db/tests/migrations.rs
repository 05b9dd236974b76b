//! Migration runner flows against temp directories and an in-memory database.

use sblite_db::migrate::{ApplyOutcome, MigrateError, MigrationRunner};
use sblite_db::Database;
use tempfile::TempDir;

async fn setup() -> (Database, TempDir) {
    let db = Database::connect("sqlite::memory:").await.unwrap();
    let dir = TempDir::new().unwrap();
    (db, dir)
}

fn write_migration(dir: &TempDir, name: &str, body: &str) {
    std::fs::write(dir.path().join(name), body).unwrap();
}

#[tokio::test]
async fn missing_directory_yields_zero_pending() {
    let db = Database::connect("sqlite::memory:").await.unwrap();
    let runner = MigrationRunner::new(&db, "/nonexistent/migrations");
    assert!(runner.discover().await.unwrap().is_empty());
    assert!(runner.apply_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn non_matching_filenames_are_ignored() {
    let (db, dir) = setup().await;
    write_migration(&dir, "README.md", "not sql");
    write_migration(&dir, "20240101000000_ok.sql", "CREATE TABLE ok (id text);");
    write_migration(&dir, "20240101_short.sql", "CREATE TABLE nope (id text);");

    let runner = MigrationRunner::new(&db, dir.path());
    let discovered = runner.discover().await.unwrap();
    assert_eq!(discovered.len(), 1);
    assert_eq!(discovered[0].version, "20240101000000");
    assert_eq!(discovered[0].name, "ok");
}

#[tokio::test]
async fn apply_records_exactly_one_row_per_migration() {
    let (db, dir) = setup().await;
    write_migration(
        &dir,
        "20240101000000_users.sql",
        "CREATE TABLE users (id text PRIMARY KEY, score integer);",
    );
    write_migration(
        &dir,
        "20240102000000_seed.sql",
        "INSERT INTO users (id, score) VALUES ('u1', 1);",
    );

    let runner = MigrationRunner::new(&db, dir.path());
    let applied = runner.apply_all().await.unwrap();
    assert_eq!(applied.len(), 2);

    let records = runner.applied().await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].version, "20240101000000");
    assert_eq!(records[1].version, "20240102000000");

    // The catalog observed the DDL.
    let columns = db.table_columns("users").await.unwrap().unwrap();
    assert_eq!(columns.len(), 2);
}

#[tokio::test]
async fn reapplying_is_a_no_op() {
    let (db, dir) = setup().await;
    write_migration(
        &dir,
        "20240101000000_users.sql",
        "CREATE TABLE users (id text PRIMARY KEY);",
    );
    let runner = MigrationRunner::new(&db, dir.path());
    runner.apply_all().await.unwrap();

    let pending = runner.pending().await.unwrap();
    assert!(pending.is_empty());
    let second = runner.apply_all().await.unwrap();
    assert!(second.is_empty());

    let discovered = runner.discover().await.unwrap();
    assert_eq!(
        runner.apply(&discovered[0]).await.unwrap(),
        ApplyOutcome::AlreadyApplied
    );
}

#[tokio::test]
async fn failed_migration_rolls_back_entirely() {
    let (db, dir) = setup().await;
    write_migration(
        &dir,
        "20240101000000_broken.sql",
        "CREATE TABLE ok (id TEXT); CREATE TABLE bad (id INVALID_TYPE);",
    );

    let runner = MigrationRunner::new(&db, dir.path());
    let err = runner.apply_all().await.unwrap_err();
    let MigrateError::Statement { version, index, .. } = err else {
        panic!("expected a statement error, got {err}");
    };
    assert_eq!(version, "20240101000000");
    assert_eq!(index, 2);

    // No side effects survive: neither the ok table nor the record.
    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('ok', 'bad')",
    )
    .fetch_all(db.pool())
    .await
    .unwrap();
    assert!(tables.is_empty());
    assert!(runner.applied().await.unwrap().is_empty());
}

#[tokio::test]
async fn out_of_order_pending_versions_still_apply() {
    let (db, dir) = setup().await;
    write_migration(
        &dir,
        "20240201000000_later.sql",
        "CREATE TABLE later_t (id text);",
    );
    let runner = MigrationRunner::new(&db, dir.path());
    runner.apply_all().await.unwrap();

    // An older version arriving after a newer one was applied is not an error.
    write_migration(
        &dir,
        "20240101000000_earlier.sql",
        "CREATE TABLE earlier_t (id text);",
    );
    let applied = runner.apply_all().await.unwrap();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].version, "20240101000000");
}

#[tokio::test]
async fn function_ddl_in_migrations_lands_in_the_catalog() {
    let (db, dir) = setup().await;
    write_migration(
        &dir,
        "20240101000000_fn.sql",
        "CREATE FUNCTION add(a integer, b integer) RETURNS integer LANGUAGE sql \
         AS $$ SELECT a + b $$;",
    );
    let runner = MigrationRunner::new(&db, dir.path());
    runner.apply_all().await.unwrap();

    let def = db.fetch_function("add").await.unwrap().unwrap();
    assert_eq!(def.args.len(), 2);
    assert_eq!(def.source_sqlite, "SELECT :a + :b");
}

#[tokio::test]
async fn policy_ddl_in_migrations_lands_in_the_policy_table() {
    let (db, dir) = setup().await;
    write_migration(
        &dir,
        "20240101000000_notes.sql",
        "CREATE TABLE notes (id text PRIMARY KEY, user_id text);\n\
         ALTER TABLE notes ENABLE ROW LEVEL SECURITY;\n\
         CREATE POLICY own ON notes FOR SELECT USING (auth.uid() = user_id);",
    );
    let runner = MigrationRunner::new(&db, dir.path());
    runner.apply_all().await.unwrap();

    let state = db.table_policies("notes").await.unwrap();
    assert!(state.rls_enabled);
    assert_eq!(state.policies.len(), 1);
    assert_eq!(state.policies[0].name, "own");
}
