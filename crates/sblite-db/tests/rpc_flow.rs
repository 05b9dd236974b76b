//! Stored function lifecycle and invocation flows.

use serde_json::{json, Map, Value};
use sblite_db::auth::AuthContext;
use sblite_db::error::DbError;
use sblite_db::rpc::RpcResult;
use sblite_db::Database;

async fn setup(script: &str) -> Database {
    let db = Database::connect("sqlite::memory:").await.unwrap();
    db.execute_script(script, &AuthContext::service_role())
        .await
        .unwrap();
    db
}

fn args(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[tokio::test]
async fn scalar_function_returns_a_bare_json_value() {
    let db = setup(
        "CREATE FUNCTION add(a integer, b integer) RETURNS integer LANGUAGE sql \
         AS $$ SELECT a + b $$;",
    )
    .await;

    let result = db
        .call_function("add", &args(json!({"a": 2, "b": 3})), &AuthContext::anon())
        .await
        .unwrap();
    assert_eq!(result, RpcResult::Scalar(json!(5)));
}

#[tokio::test]
async fn missing_required_argument_is_a_42883() {
    let db = setup(
        "CREATE FUNCTION add(a integer, b integer) RETURNS integer LANGUAGE sql \
         AS $$ SELECT a + b $$;",
    )
    .await;

    let err = db
        .call_function("add", &args(json!({"a": 2})), &AuthContext::anon())
        .await
        .unwrap_err();
    assert_eq!(err.envelope().code, "42883");
    assert_eq!(err.http_status(), 400);
}

#[tokio::test]
async fn defaults_fill_omitted_arguments() {
    let db = setup(
        "CREATE FUNCTION greet(name text DEFAULT 'world') RETURNS text LANGUAGE sql \
         AS $$ SELECT 'hi ' || name $$;",
    )
    .await;

    let result = db
        .call_function("greet", &Map::new(), &AuthContext::anon())
        .await
        .unwrap();
    assert_eq!(result, RpcResult::Scalar(json!("hi world")));

    let result = db
        .call_function("greet", &args(json!({"name": "ada"})), &AuthContext::anon())
        .await
        .unwrap();
    assert_eq!(result, RpcResult::Scalar(json!("hi ada")));
}

#[tokio::test]
async fn unknown_function_is_a_404() {
    let db = setup("CREATE TABLE t (id text);").await;
    let err = db
        .call_function("nope", &Map::new(), &AuthContext::anon())
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::UndefinedFunction(_)));
    assert_eq!(err.http_status(), 404);
}

#[tokio::test]
async fn setof_functions_return_arrays_of_objects() {
    let db = setup(
        "CREATE TABLE nums (v integer);
         INSERT INTO nums (v) VALUES (1);
         INSERT INTO nums (v) VALUES (2);
         CREATE FUNCTION all_nums() RETURNS SETOF nums LANGUAGE sql \
         AS $$ SELECT * FROM nums ORDER BY v $$;",
    )
    .await;

    let result = db
        .call_function("all_nums", &Map::new(), &AuthContext::anon())
        .await
        .unwrap();
    assert_eq!(
        result,
        RpcResult::Set(vec![json!({"v": 1}), json!({"v": 2})])
    );
}

#[tokio::test]
async fn create_then_drop_leaves_no_function() {
    let db = setup(
        "CREATE FUNCTION f() RETURNS integer LANGUAGE sql AS $$ SELECT 1 $$;
         DROP FUNCTION f;",
    )
    .await;
    assert!(db.fetch_function("f").await.unwrap().is_none());
}

#[tokio::test]
async fn create_or_replace_keeps_the_second_body() {
    let db = setup(
        "CREATE FUNCTION f() RETURNS integer LANGUAGE sql AS $$ SELECT 1 $$;
         CREATE OR REPLACE FUNCTION f() RETURNS integer LANGUAGE sql AS $$ SELECT 2 $$;",
    )
    .await;
    let def = db.fetch_function("f").await.unwrap().unwrap();
    assert_eq!(def.source_sqlite, "SELECT 2");

    let result = db
        .call_function("f", &Map::new(), &AuthContext::anon())
        .await
        .unwrap();
    assert_eq!(result, RpcResult::Scalar(json!(2)));
}

#[tokio::test]
async fn duplicate_create_without_or_replace_fails() {
    let db = setup("CREATE FUNCTION f() RETURNS integer LANGUAGE sql AS $$ SELECT 1 $$;").await;
    let err = db
        .execute_script(
            "CREATE FUNCTION f() RETURNS integer LANGUAGE sql AS $$ SELECT 2 $$;",
            &AuthContext::service_role(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::DuplicateFunction(_)));
}

#[tokio::test]
async fn security_definer_bypasses_rls_in_the_body() {
    let db = setup(
        "CREATE TABLE notes (id text PRIMARY KEY, user_id text);
         INSERT INTO notes (id, user_id) VALUES ('n1', 'someone');
         ALTER TABLE notes ENABLE ROW LEVEL SECURITY;
         CREATE POLICY own ON notes FOR SELECT USING (auth.uid() = user_id);
         CREATE FUNCTION count_notes() RETURNS integer LANGUAGE sql SECURITY DEFINER \
         AS $$ SELECT COUNT(*) FROM notes $$;",
    )
    .await;

    // The function body is not predicate-injected; DEFINER marks the call
    // context as bypassing RLS for nested access.
    let result = db
        .call_function("count_notes", &Map::new(), &AuthContext::anon())
        .await
        .unwrap();
    assert_eq!(result, RpcResult::Scalar(json!(1)));
}

#[tokio::test]
async fn invoker_functions_see_the_callers_auth_context() {
    let db = setup(
        "CREATE FUNCTION whoami() RETURNS text LANGUAGE sql \
         AS $$ SELECT auth.uid() $$;",
    )
    .await;

    let mut ctx = AuthContext::anon();
    ctx.user_id = Some("u-7".into());
    let result = db.call_function("whoami", &Map::new(), &ctx).await.unwrap();
    assert_eq!(result, RpcResult::Scalar(json!("u-7")));

    let result = db
        .call_function("whoami", &Map::new(), &AuthContext::anon())
        .await
        .unwrap();
    assert_eq!(result, RpcResult::Scalar(Value::Null));
}

#[tokio::test]
async fn unmatched_argument_names_are_rejected() {
    let db = setup(
        "CREATE FUNCTION add(a integer, b integer) RETURNS integer LANGUAGE sql \
         AS $$ SELECT a + b $$;",
    )
    .await;
    let err = db
        .call_function("add", &args(json!({"a": 1, "wrong": 2})), &AuthContext::anon())
        .await
        .unwrap_err();
    assert_eq!(err.http_status(), 404);
}
