//! End-to-end HTTP tests driven through the router with `oneshot`.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use sblite_daemon::auth::AuthKeys;
use sblite_daemon::server::{build_router, AppState};
use sblite_db::Database;
use sblite_realtime::Hub;
use serde_json::{json, Value};
use tower::ServiceExt;

struct TestApp {
    router: Router,
    anon_key: String,
    service_key: String,
}

async fn test_app(setup_sql: &str) -> TestApp {
    let db = Database::connect("sqlite::memory:").await.unwrap();
    if !setup_sql.is_empty() {
        db.execute_script(setup_sql, &sblite_db::AuthContext::service_role())
            .await
            .unwrap();
    }
    let keys = AuthKeys::new("test-secret").unwrap();
    let anon_key = keys.anon_key.clone();
    let service_key = keys.service_key.clone();
    let state = Arc::new(AppState {
        db,
        hub: Arc::new(Hub::new()),
        keys,
    });
    TestApp {
        router: build_router(state),
        anon_key,
        service_key,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value, axum::http::HeaderMap) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body, headers)
}

#[tokio::test]
async fn health_needs_no_auth() {
    let app = test_app("").await;
    let (status, body, _) = send(
        &app.router,
        Request::get("/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok"}));
}

#[tokio::test]
async fn rest_requires_an_apikey() {
    let app = test_app("CREATE TABLE t (id text PRIMARY KEY);").await;
    let (status, body, _) = send(
        &app.router,
        Request::get("/rest/v1/t").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "invalid_apikey");
}

#[tokio::test]
async fn invalid_bearer_tokens_are_rejected() {
    let app = test_app("CREATE TABLE t (id text PRIMARY KEY);").await;
    let (status, body, _) = send(
        &app.router,
        Request::get("/rest/v1/t")
            .header("apikey", &app.anon_key)
            .header(header::AUTHORIZATION, "Bearer nope")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "invalid_token");
}

#[tokio::test]
async fn filter_translation_end_to_end() {
    let app = test_app(
        "CREATE TABLE users (id text PRIMARY KEY, score integer);
         INSERT INTO users (id, score) VALUES ('u1', 100);
         INSERT INTO users (id, score) VALUES ('u2', 200);",
    )
    .await;

    let (status, body, headers) = send(
        &app.router,
        Request::get("/rest/v1/users?score=gt.150&select=id")
            .header("apikey", &app.service_key)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([{"id": "u2"}]));
    assert_eq!(
        headers.get("content-range").unwrap().to_str().unwrap(),
        "0-0/1"
    );
}

#[tokio::test]
async fn insert_then_read_back_with_representation() {
    let app = test_app("CREATE TABLE notes (id text PRIMARY KEY, body text);").await;

    let (status, body, _) = send(
        &app.router,
        Request::post("/rest/v1/notes")
            .header("apikey", &app.service_key)
            .header(header::CONTENT_TYPE, "application/json")
            .header("prefer", "return=representation")
            .body(Body::from(
                json!({"id": "n1", "body": "hello"}).to_string(),
            ))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body, json!([{"id": "n1", "body": "hello"}]));

    // Default POST shape is minimal: 201, empty body.
    let (status, body, _) = send(
        &app.router,
        Request::post("/rest/v1/notes")
            .header("apikey", &app.service_key)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({"id": "n2", "body": "x"}).to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body, Value::Null);
}

#[tokio::test]
async fn validation_failures_use_the_postgrest_envelope() {
    let app = test_app("CREATE TABLE items (id uuid PRIMARY KEY);").await;
    let (status, body, _) = send(
        &app.router,
        Request::post("/rest/v1/items")
            .header("apikey", &app.service_key)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({"id": "not-a-uuid"}).to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "22P02");
    assert!(body["message"].as_str().unwrap().contains("id"));
}

#[tokio::test]
async fn rls_scopes_rest_reads_by_bearer_identity() {
    let app = test_app(
        "CREATE TABLE notes (id text PRIMARY KEY, user_id text);
         INSERT INTO notes (id, user_id) VALUES ('n1', 'userA');
         INSERT INTO notes (id, user_id) VALUES ('n2', 'userB');
         ALTER TABLE notes ENABLE ROW LEVEL SECURITY;
         CREATE POLICY own_rows ON notes FOR SELECT USING ((select auth.uid()) = user_id);",
    )
    .await;

    // Anonymous: empty set, not an error.
    let (status, body, _) = send(
        &app.router,
        Request::get("/rest/v1/notes")
            .header("apikey", &app.anon_key)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    // Authenticated as userB sees only their row.
    let keys = sblite_db::JwtKeys::new("test-secret");
    let token = keys
        .sign(&json!({
            "sub": "userB",
            "role": "authenticated",
            "exp": (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp(),
        }))
        .unwrap();
    let (status, body, _) = send(
        &app.router,
        Request::get("/rest/v1/notes")
            .header("apikey", &app.anon_key)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([{"id": "n2", "user_id": "userB"}]));
}

#[tokio::test]
async fn rpc_scalar_returns_a_bare_json_number() {
    let app = test_app(
        "CREATE FUNCTION add(a integer, b integer) RETURNS integer LANGUAGE sql \
         AS $$ SELECT a + b $$;",
    )
    .await;

    let (status, body, headers) = send(
        &app.router,
        Request::post("/rest/v1/rpc/add")
            .header("apikey", &app.anon_key)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({"a": 2, "b": 3}).to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!(5));
    assert!(headers
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("application/json"));
}

#[tokio::test]
async fn missing_rpc_function_is_404_with_42883() {
    let app = test_app("").await;
    let (status, body, _) = send(
        &app.router,
        Request::post("/rest/v1/rpc/nope")
            .header("apikey", &app.anon_key)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "42883");
}

#[tokio::test]
async fn single_object_accept_enforces_exactly_one_row() {
    let app = test_app(
        "CREATE TABLE t (id text PRIMARY KEY);
         INSERT INTO t (id) VALUES ('a');
         INSERT INTO t (id) VALUES ('b');",
    )
    .await;

    let (status, body, _) = send(
        &app.router,
        Request::get("/rest/v1/t?id=eq.a")
            .header("apikey", &app.service_key)
            .header(header::ACCEPT, "application/vnd.pgrst.object+json")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"id": "a"}));

    let (status, body, _) = send(
        &app.router,
        Request::get("/rest/v1/t")
            .header("apikey", &app.service_key)
            .header(header::ACCEPT, "application/vnd.pgrst.object+json")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_ACCEPTABLE);
    assert_eq!(body["code"], "PGRST116");
}

#[tokio::test]
async fn range_header_paginates_and_reports_content_range() {
    let app = test_app(
        "CREATE TABLE seq (n integer PRIMARY KEY);
         INSERT INTO seq (n) VALUES (1);
         INSERT INTO seq (n) VALUES (2);
         INSERT INTO seq (n) VALUES (3);
         INSERT INTO seq (n) VALUES (4);",
    )
    .await;

    let (status, body, headers) = send(
        &app.router,
        Request::get("/rest/v1/seq?order=n.asc")
            .header("apikey", &app.service_key)
            .header("range", "1-2")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([{"n": 2}, {"n": 3}]));
    assert_eq!(
        headers.get("content-range").unwrap().to_str().unwrap(),
        "1-2/4"
    );
}

#[tokio::test]
async fn dashboard_query_is_service_role_only() {
    let app = test_app("").await;

    let (status, _, _) = send(
        &app.router,
        Request::post("/dashboard/v1/query")
            .header("apikey", &app.anon_key)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({"query": "SELECT 1"}).to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body, _) = send(
        &app.router,
        Request::post("/dashboard/v1/query")
            .header("apikey", &app.service_key)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({"query": "SELECT 1 + 1 AS two"}).to_string(),
            ))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"][0]["rows"][0]["two"], json!(2));
}

#[tokio::test]
async fn dashboard_errors_embed_the_envelope_in_a_diagnostic() {
    let app = test_app("").await;
    let (status, body, _) = send(
        &app.router,
        Request::post("/dashboard/v1/query")
            .header("apikey", &app.service_key)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({"query": "SELECT FROM FROM"}).to_string(),
            ))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"]["code"].is_string());
    assert_eq!(body["query"], "SELECT FROM FROM");
}

#[tokio::test]
async fn upsert_with_merge_duplicates_preference() {
    let app = test_app(
        "CREATE TABLE counters (id text PRIMARY KEY, n integer);
         INSERT INTO counters (id, n) VALUES ('a', 1);",
    )
    .await;

    let (status, body, headers) = send(
        &app.router,
        Request::post("/rest/v1/counters")
            .header("apikey", &app.service_key)
            .header(header::CONTENT_TYPE, "application/json")
            .header("prefer", "return=representation, resolution=merge-duplicates")
            .body(Body::from(json!({"id": "a", "n": 7}).to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body, json!([{"id": "a", "n": 7}]));
    assert!(headers
        .get("preference-applied")
        .unwrap()
        .to_str()
        .unwrap()
        .contains("merge-duplicates"));
}
