//! End-to-end REST compiler flows against an in-memory database.

use serde_json::{json, Value};
use sblite_db::auth::{AuthContext, Role};
use sblite_db::error::DbError;
use sblite_db::rest::parse_rest_query;
use sblite_db::Database;

async fn setup(script: &str) -> Database {
    let db = Database::connect("sqlite::memory:").await.unwrap();
    db.execute_script(script, &AuthContext::service_role())
        .await
        .unwrap();
    db
}

fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
    items
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn user_ctx(uid: &str) -> AuthContext {
    let mut ctx = AuthContext::anon();
    ctx.user_id = Some(uid.to_string());
    ctx.role = Role::Authenticated;
    ctx
}

#[tokio::test]
async fn filter_translation_selects_matching_rows() {
    let db = setup(
        "CREATE TABLE users (id text PRIMARY KEY, score integer);
         INSERT INTO users (id, score) VALUES ('u1', 100);
         INSERT INTO users (id, score) VALUES ('u2', 200);",
    )
    .await;

    let query = parse_rest_query("users", &pairs(&[("score", "gt.150"), ("select", "id")])).unwrap();
    let result = db.rest_select(&query, &AuthContext::service_role()).await.unwrap();
    assert_eq!(result.rows, vec![json!({"id": "u2"})]);
    assert_eq!(result.total, 1);
}

#[tokio::test]
async fn rls_denies_anonymous_and_scopes_authenticated_reads() {
    let db = setup(
        "CREATE TABLE notes (id text PRIMARY KEY, user_id text);
         INSERT INTO notes (id, user_id) VALUES ('n1', 'userA');
         INSERT INTO notes (id, user_id) VALUES ('n2', 'userB');
         ALTER TABLE notes ENABLE ROW LEVEL SECURITY;
         CREATE POLICY own_rows ON notes FOR SELECT USING ((select auth.uid()) = user_id);",
    )
    .await;

    let query = parse_rest_query("notes", &[]).unwrap();

    let anon = db.rest_select(&query, &AuthContext::anon()).await.unwrap();
    assert!(anon.rows.is_empty());
    assert_eq!(anon.total, 0);

    let as_b = db.rest_select(&query, &user_ctx("userB")).await.unwrap();
    assert_eq!(as_b.rows, vec![json!({"id": "n2", "user_id": "userB"})]);

    let service = db
        .rest_select(&query, &AuthContext::service_role())
        .await
        .unwrap();
    assert_eq!(service.rows.len(), 2);
}

#[tokio::test]
async fn rls_enabled_with_no_policies_denies_everything() {
    let db = setup(
        "CREATE TABLE secrets (id text PRIMARY KEY, body text);
         INSERT INTO secrets (id, body) VALUES ('s1', 'x');
         ALTER TABLE secrets ENABLE ROW LEVEL SECURITY;",
    )
    .await;

    let query = parse_rest_query("secrets", &[]).unwrap();
    let read = db.rest_select(&query, &AuthContext::anon()).await.unwrap();
    assert!(read.rows.is_empty());

    let err = db
        .rest_insert("secrets", &json!({"id": "s2", "body": "y"}), false, &AuthContext::anon())
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::RlsDenied(_)));
    assert_eq!(err.http_status(), 403);
}

#[tokio::test]
async fn with_check_rejects_rows_written_for_someone_else() {
    let db = setup(
        "CREATE TABLE notes (id text PRIMARY KEY, user_id text);
         ALTER TABLE notes ENABLE ROW LEVEL SECURITY;
         CREATE POLICY own ON notes FOR ALL USING (auth.uid() = user_id) \
            WITH CHECK (auth.uid() = user_id);",
    )
    .await;

    let ok = db
        .rest_insert(
            "notes",
            &json!({"id": "n1", "user_id": "me"}),
            false,
            &user_ctx("me"),
        )
        .await
        .unwrap();
    assert_eq!(ok.rows.len(), 1);

    let err = db
        .rest_insert(
            "notes",
            &json!({"id": "n2", "user_id": "someone_else"}),
            false,
            &user_ctx("me"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::RlsDenied(_)));

    // The rejected insert rolled back entirely.
    let query = parse_rest_query("notes", &[]).unwrap();
    let all = db
        .rest_select(&query, &AuthContext::service_role())
        .await
        .unwrap();
    assert_eq!(all.rows.len(), 1);
}

#[tokio::test]
async fn insert_validates_every_column_and_writes_nothing_on_failure() {
    let db = setup("CREATE TABLE items (id uuid PRIMARY KEY, qty integer);").await;
    let ctx = AuthContext::service_role();

    let err = db
        .rest_insert(
            "items",
            &json!([
                {"id": "0b0f7a0e-9f4a-4cde-8cde-31a523a58c3f", "qty": 1},
                {"id": "not-a-uuid", "qty": 2}
            ]),
            false,
            &ctx,
        )
        .await
        .unwrap_err();
    assert_eq!(err.envelope().code, "22P02");

    let query = parse_rest_query("items", &[]).unwrap();
    assert_eq!(db.rest_select(&query, &ctx).await.unwrap().total, 0);
}

#[tokio::test]
async fn unknown_body_columns_are_rejected() {
    let db = setup("CREATE TABLE items (id text PRIMARY KEY);").await;
    let err = db
        .rest_insert(
            "items",
            &json!({"id": "a", "bogus": 1}),
            false,
            &AuthContext::service_role(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.envelope().code, "PGRST204");
}

#[tokio::test]
async fn upsert_merges_on_the_declared_primary_key() {
    let db = setup(
        "CREATE TABLE counters (id text PRIMARY KEY, n integer);
         INSERT INTO counters (id, n) VALUES ('a', 1);",
    )
    .await;
    let ctx = AuthContext::service_role();

    let result = db
        .rest_insert("counters", &json!({"id": "a", "n": 5}), true, &ctx)
        .await
        .unwrap();
    assert_eq!(result.rows, vec![json!({"id": "a", "n": 5})]);

    // Without merge the same write is a unique violation.
    let err = db
        .rest_insert("counters", &json!({"id": "a", "n": 9}), false, &ctx)
        .await
        .unwrap_err();
    assert_eq!(err.envelope().code, "23505");
    assert_eq!(err.http_status(), 409);
}

#[tokio::test]
async fn update_and_delete_emit_change_events_with_old_and_new() {
    let db = setup(
        "CREATE TABLE t (id text PRIMARY KEY, v integer);
         INSERT INTO t (id, v) VALUES ('x', 1);",
    )
    .await;
    let ctx = AuthContext::service_role();

    let query = parse_rest_query("t", &pairs(&[("id", "eq.x")])).unwrap();
    let updated = db.rest_update(&query, &json!({"v": 2}), &ctx).await.unwrap();
    assert_eq!(updated.rows, vec![json!({"id": "x", "v": 2})]);
    assert_eq!(updated.events.len(), 1);
    assert_eq!(updated.events[0].op.as_str(), "UPDATE");
    assert_eq!(updated.events[0].old, Some(json!({"id": "x", "v": 1})));
    assert_eq!(updated.events[0].new, Some(json!({"id": "x", "v": 2})));

    let deleted = db.rest_delete(&query, &ctx).await.unwrap();
    assert_eq!(deleted.events.len(), 1);
    assert_eq!(deleted.events[0].op.as_str(), "DELETE");
    assert_eq!(deleted.events[0].old, Some(json!({"id": "x", "v": 2})));
    assert!(deleted.events[0].new.is_none());
}

#[tokio::test]
async fn unknown_table_is_hidden_from_non_service_roles() {
    let db = setup("CREATE TABLE known (id text PRIMARY KEY);").await;

    let query = parse_rest_query("ghost", &[]).unwrap();
    let hidden = db.rest_select(&query, &AuthContext::anon()).await.unwrap();
    assert!(hidden.rows.is_empty());

    let err = db
        .rest_select(&query, &AuthContext::service_role())
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::UnknownTable(_)));
}

#[tokio::test]
async fn system_tables_are_not_served() {
    let db = setup("CREATE TABLE known (id text PRIMARY KEY);").await;
    let query = parse_rest_query("_columns", &[]).unwrap();
    let err = db
        .rest_select(&query, &AuthContext::service_role())
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::UnknownTable(_)));
}

#[tokio::test]
async fn embedded_resources_stitch_one_to_many_and_many_to_one() {
    let db = setup(
        "CREATE TABLE authors (id text PRIMARY KEY, name text);
         CREATE TABLE posts (id text PRIMARY KEY, author_id text REFERENCES authors(id), title text);
         INSERT INTO authors (id, name) VALUES ('a1', 'Ada');
         INSERT INTO authors (id, name) VALUES ('a2', 'Grace');
         INSERT INTO posts (id, author_id, title) VALUES ('p1', 'a1', 'first');
         INSERT INTO posts (id, author_id, title) VALUES ('p2', 'a1', 'second');",
    )
    .await;
    let ctx = AuthContext::service_role();

    // one-to-many: authors with their posts
    let query = parse_rest_query("authors", &pairs(&[("select", "id,posts(title)")])).unwrap();
    let result = db.rest_select(&query, &ctx).await.unwrap();
    let ada = result
        .rows
        .iter()
        .find(|r| r["id"] == "a1")
        .expect("a1 present");
    let titles: Vec<&str> = ada["posts"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["title"].as_str().unwrap())
        .collect();
    assert_eq!(titles.len(), 2);
    assert!(titles.contains(&"first") && titles.contains(&"second"));
    let grace = result.rows.iter().find(|r| r["id"] == "a2").unwrap();
    assert_eq!(grace["posts"], json!([]));

    // many-to-one: posts with their author
    let query = parse_rest_query("posts", &pairs(&[("select", "id,authors(name)")])).unwrap();
    let result = db.rest_select(&query, &ctx).await.unwrap();
    let p1 = result.rows.iter().find(|r| r["id"] == "p1").unwrap();
    assert_eq!(p1["authors"], json!({"name": "Ada"}));
}

#[tokio::test]
async fn order_limit_offset_shape_the_page() {
    let db = setup(
        "CREATE TABLE nums (id integer PRIMARY KEY, v integer);
         INSERT INTO nums (id, v) VALUES (1, 30);
         INSERT INTO nums (id, v) VALUES (2, 10);
         INSERT INTO nums (id, v) VALUES (3, 20);",
    )
    .await;
    let ctx = AuthContext::service_role();
    let query = parse_rest_query(
        "nums",
        &pairs(&[("select", "v"), ("order", "v.desc"), ("limit", "2"), ("offset", "1")]),
    )
    .unwrap();
    let result = db.rest_select(&query, &ctx).await.unwrap();
    assert_eq!(
        result.rows,
        vec![json!({"v": 20}), json!({"v": 10})]
    );
    // Total counts the filtered set, not the page.
    assert_eq!(result.total, 3);
}

#[tokio::test]
async fn jsonb_and_boolean_values_round_trip_as_json() {
    let db = setup("CREATE TABLE cfg (id text PRIMARY KEY, data jsonb, on_flag boolean);").await;
    let ctx = AuthContext::service_role();
    db.rest_insert(
        "cfg",
        &json!({"id": "c1", "data": {"depth": [1, 2]}, "on_flag": true}),
        false,
        &ctx,
    )
    .await
    .unwrap();

    let query = parse_rest_query("cfg", &[]).unwrap();
    let rows = db.rest_select(&query, &ctx).await.unwrap().rows;
    assert_eq!(rows[0]["data"], json!({"depth": [1, 2]}));
    assert_eq!(rows[0]["on_flag"], Value::Bool(true));
}
