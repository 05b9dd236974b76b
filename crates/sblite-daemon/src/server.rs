//! HTTP surface: PostgREST-style CRUD, RPC dispatch, the dashboard SQL
//! endpoint, health, and the realtime WebSocket route.

use std::{env, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::{header::HeaderName, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use sblite_db::{
    auth::generate_dev_secret,
    error::{DbError, ErrorEnvelope},
    rest::{parse_rest_query, RestQuery},
    AuthError, Database, MigrationRunner, RpcResult,
};
use sblite_realtime::Hub;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::{extract_context, AuthKeys};
use crate::realtime;

pub async fn run() -> Result<()> {
    let config = AppConfig::from_env()?;

    let db = Database::connect(&config.db_url)
        .await
        .context("failed to open database")?;

    let runner = MigrationRunner::new(&db, &config.migrations_dir);
    let applied = runner.apply_all().await.context("migrations failed")?;
    if !applied.is_empty() {
        info!(count = applied.len(), "applied pending migrations");
    }

    let keys = AuthKeys::new(&config.jwt_secret).context("minting API keys")?;
    info!(anon_key = %keys.anon_key, "anon API key");
    info!(service_key = %keys.service_key, "service-role API key");

    let state = Arc::new(AppState {
        db,
        hub: Arc::new(Hub::new()),
        keys,
    });

    let app = build_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listen socket")?;
    info!(addr = %config.listen_addr, "sblite listening");
    axum::serve(listener, app).await.context("HTTP server exited")?;
    Ok(())
}

pub fn build_router(state: Arc<AppState>) -> Router {
    // The request timeout stays off the WebSocket route; realtime
    // connections have their own heartbeat/idle policing.
    let api = Router::new()
        .route("/health", get(health))
        .route("/rest/v1/rpc/:name", post(rpc_call))
        .route(
            "/rest/v1/:table",
            get(rest_get).post(rest_post).patch(rest_patch).delete(rest_delete),
        )
        .route("/dashboard/v1/query", post(dashboard_query))
        .layer(TimeoutLayer::new(Duration::from_secs(30)));
    Router::new()
        .merge(api)
        .route("/realtime/v1/websocket", get(realtime::ws_handler))
        .with_state(state)
}

pub struct AppState {
    pub db: Database,
    pub hub: Arc<Hub>,
    pub keys: AuthKeys,
}

#[derive(Debug, Clone)]
struct AppConfig {
    listen_addr: SocketAddr,
    db_url: String,
    migrations_dir: PathBuf,
    jwt_secret: String,
}

impl AppConfig {
    fn from_env() -> Result<Self> {
        let listen_addr = env::var("SBLITE_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8000".to_string())
            .parse()
            .context("invalid SBLITE_ADDR")?;

        let db_url = match env::var("SBLITE_DB") {
            Ok(value) if value.starts_with("sqlite:") => value,
            Ok(value) => format!("sqlite://{value}"),
            Err(_) => "sqlite://./sblite.db".to_string(),
        };

        let migrations_dir = env::var("SBLITE_MIGRATIONS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./migrations"));

        let jwt_secret = match env::var("SBLITE_JWT_SECRET") {
            Ok(value) if !value.trim().is_empty() => value,
            _ => {
                let secret = generate_dev_secret();
                tracing::warn!(
                    "SBLITE_JWT_SECRET is not set; using a generated secret \
                     (tokens will not survive a restart)"
                );
                secret
            }
        };

        Ok(Self {
            listen_addr,
            db_url,
            migrations_dir,
            jwt_secret,
        })
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// GET /rest/v1/{table}
async fn rest_get(
    State(state): State<Arc<AppState>>,
    Path(table): Path<String>,
    Query(pairs): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let ctx = extract_context(&state.keys, &headers, None)?;
    let mut query = parse_rest_query(&table, &pairs)?;
    apply_range(&headers, &mut query)?;

    let result = state.db.rest_select(&query, &ctx).await?;
    let offset = query.offset.unwrap_or(0);
    let content_range = content_range(offset, result.rows.len(), result.total);

    let body = shape_rows(result.rows, &headers)?;
    let mut response = (StatusCode::OK, Json(body)).into_response();
    insert_header(&mut response, "content-range", &content_range);
    Ok(response)
}

/// POST /rest/v1/{table}
async fn rest_post(
    State(state): State<Arc<AppState>>,
    Path(table): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<Response, ApiError> {
    let ctx = extract_context(&state.keys, &headers, None)?;
    let prefs = Preferences::from_headers(&headers);

    let result = state
        .db
        .rest_insert(&table, &payload, prefs.merge_duplicates, &ctx)
        .await?;
    for event in &result.events {
        state.hub.notify_change(event);
    }

    let mut response = match prefs.representation {
        Repr::Representation => {
            let body = shape_rows(result.rows, &headers)?;
            (StatusCode::CREATED, Json(body)).into_response()
        }
        _ => StatusCode::CREATED.into_response(),
    };
    if let Some(applied) = prefs.applied() {
        insert_header(&mut response, "preference-applied", &applied);
    }
    Ok(response)
}

/// PATCH /rest/v1/{table}
async fn rest_patch(
    State(state): State<Arc<AppState>>,
    Path(table): Path<String>,
    Query(pairs): Query<Vec<(String, String)>>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<Response, ApiError> {
    let ctx = extract_context(&state.keys, &headers, None)?;
    let prefs = Preferences::from_headers(&headers);
    let query = parse_rest_query(&table, &pairs)?;

    let result = state.db.rest_update(&query, &payload, &ctx).await?;
    for event in &result.events {
        state.hub.notify_change(event);
    }

    Ok(match prefs.representation {
        Repr::Representation => {
            let body = shape_rows(result.rows, &headers)?;
            (StatusCode::OK, Json(body)).into_response()
        }
        _ => StatusCode::NO_CONTENT.into_response(),
    })
}

/// DELETE /rest/v1/{table}
async fn rest_delete(
    State(state): State<Arc<AppState>>,
    Path(table): Path<String>,
    Query(pairs): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let ctx = extract_context(&state.keys, &headers, None)?;
    let prefs = Preferences::from_headers(&headers);
    let query = parse_rest_query(&table, &pairs)?;

    let result = state.db.rest_delete(&query, &ctx).await?;
    for event in &result.events {
        state.hub.notify_change(event);
    }

    Ok(match prefs.representation {
        Repr::Representation => {
            let body = shape_rows(result.rows, &headers)?;
            (StatusCode::OK, Json(body)).into_response()
        }
        _ => StatusCode::NO_CONTENT.into_response(),
    })
}

/// POST /rest/v1/rpc/{name}
async fn rpc_call(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Result<Response, ApiError> {
    let ctx = extract_context(&state.keys, &headers, None)?;
    let args = match body {
        Some(Json(Value::Object(map))) => map,
        Some(Json(Value::Null)) | None => serde_json::Map::new(),
        Some(_) => {
            return Err(DbError::BadRequest("rpc body must be a JSON object".into()).into())
        }
    };

    let result = state.db.call_function(&name, &args, &ctx).await?;
    let body = match result {
        RpcResult::Scalar(value) => value,
        RpcResult::Row(value) => value,
        RpcResult::Set(rows) => shape_rows(rows, &headers)?,
    };
    Ok((StatusCode::OK, Json(body)).into_response())
}

#[derive(Debug, Deserialize)]
struct DashboardQuery {
    query: String,
}

/// POST /dashboard/v1/query — service-role only. Errors come back embedded in
/// a diagnostic object alongside the offending script.
async fn dashboard_query(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<DashboardQuery>,
) -> Result<Response, ApiError> {
    let ctx = extract_context(&state.keys, &headers, None)?;
    if !ctx.bypass_rls {
        return Err(DbError::RlsDenied("dashboard".into()).into());
    }

    match state.db.execute_script(&body.query, &ctx).await {
        Ok(outcomes) => Ok(Json(json!({ "results": outcomes })).into_response()),
        Err(err) => {
            let status =
                StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::BAD_REQUEST);
            Ok((
                status,
                Json(json!({ "error": err.envelope(), "query": body.query })),
            )
                .into_response())
        }
    }
}

/// `Prefer` header contents the write path honors.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Repr {
    Minimal,
    Representation,
    HeadersOnly,
}

#[derive(Debug)]
struct Preferences {
    representation: Repr,
    merge_duplicates: bool,
}

impl Preferences {
    fn from_headers(headers: &HeaderMap) -> Self {
        let mut prefs = Preferences {
            representation: Repr::Minimal,
            merge_duplicates: false,
        };
        for value in headers.get_all("prefer") {
            let Ok(value) = value.to_str() else { continue };
            for token in value.split(',') {
                match token.trim() {
                    "return=representation" => prefs.representation = Repr::Representation,
                    "return=minimal" => prefs.representation = Repr::Minimal,
                    "return=headers-only" => prefs.representation = Repr::HeadersOnly,
                    "resolution=merge-duplicates" => prefs.merge_duplicates = true,
                    _ => {}
                }
            }
        }
        prefs
    }

    fn applied(&self) -> Option<String> {
        let mut parts = Vec::new();
        match self.representation {
            Repr::Representation => parts.push("return=representation"),
            Repr::HeadersOnly => parts.push("return=headers-only"),
            Repr::Minimal => {}
        }
        if self.merge_duplicates {
            parts.push("resolution=merge-duplicates");
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(", "))
        }
    }
}

/// `Range: a-b` becomes limit/offset when the URL did not already paginate.
fn apply_range(headers: &HeaderMap, query: &mut RestQuery) -> Result<(), DbError> {
    if query.limit.is_some() || query.offset.is_some() {
        return Ok(());
    }
    let Some(range) = headers.get("range").and_then(|v| v.to_str().ok()) else {
        return Ok(());
    };
    let range = range.trim().trim_start_matches("items=");
    let Some((start, end)) = range.split_once('-') else {
        return Err(DbError::BadRequest(format!("invalid Range header '{range}'")));
    };
    let start: i64 = start
        .parse()
        .map_err(|_| DbError::BadRequest(format!("invalid Range header '{range}'")))?;
    let end: i64 = end
        .parse()
        .map_err(|_| DbError::BadRequest(format!("invalid Range header '{range}'")))?;
    if end < start {
        return Err(DbError::BadRequest(format!("invalid Range header '{range}'")));
    }
    query.offset = Some(start);
    query.limit = Some(end - start + 1);
    Ok(())
}

fn content_range(offset: i64, returned: usize, total: i64) -> String {
    if returned == 0 {
        format!("*/{total}")
    } else {
        format!("{}-{}/{total}", offset, offset + returned as i64 - 1)
    }
}

/// Applies the single-object `Accept` contract: exactly one row or PGRST116.
fn shape_rows(rows: Vec<Value>, headers: &HeaderMap) -> Result<Value, DbError> {
    let single = headers
        .get(axum::http::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("application/vnd.pgrst.object+json"));
    if single {
        if rows.len() != 1 {
            return Err(DbError::SingularityViolation { rows: rows.len() });
        }
        Ok(rows.into_iter().next().unwrap_or(Value::Null))
    } else {
        Ok(Value::Array(rows))
    }
}

fn insert_header(response: &mut Response, name: &'static str, value: &str) {
    if let Ok(value) = value.parse() {
        response
            .headers_mut()
            .insert(HeaderName::from_static(name), value);
    }
}

/// Daemon-level error: everything renders as the PostgREST envelope.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    envelope: ErrorEnvelope,
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        Self {
            status: StatusCode::from_u16(err.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            envelope: err.envelope(),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            envelope: ErrorEnvelope {
                code: err.to_string(),
                message: match err {
                    AuthError::InvalidToken => "JWT is invalid or expired".to_string(),
                    AuthError::InvalidApiKey => "No valid API key found".to_string(),
                },
                details: None,
                hint: None,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::debug!(status = %self.status, code = %self.envelope.code, "request failed");
        (self.status, Json(self.envelope)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_matches_postgrest_shape() {
        assert_eq!(content_range(0, 1, 1), "0-0/1");
        assert_eq!(content_range(5, 3, 20), "5-7/20");
        assert_eq!(content_range(0, 0, 0), "*/0");
    }

    #[test]
    fn range_header_becomes_limit_offset() {
        let mut headers = HeaderMap::new();
        headers.insert("range", "2-6".parse().unwrap());
        let mut query = parse_rest_query("t", &[]).unwrap();
        apply_range(&headers, &mut query).unwrap();
        assert_eq!(query.offset, Some(2));
        assert_eq!(query.limit, Some(5));
    }

    #[test]
    fn url_pagination_wins_over_the_range_header() {
        let mut headers = HeaderMap::new();
        headers.insert("range", "2-6".parse().unwrap());
        let mut query =
            parse_rest_query("t", &[("limit".to_string(), "1".to_string())]).unwrap();
        apply_range(&headers, &mut query).unwrap();
        assert_eq!(query.limit, Some(1));
        assert_eq!(query.offset, None);
    }

    #[test]
    fn prefer_header_parses_combined_tokens() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "prefer",
            "return=representation, resolution=merge-duplicates".parse().unwrap(),
        );
        let prefs = Preferences::from_headers(&headers);
        assert_eq!(prefs.representation, Repr::Representation);
        assert!(prefs.merge_duplicates);
        assert_eq!(
            prefs.applied().as_deref(),
            Some("return=representation, resolution=merge-duplicates")
        );
    }

    #[test]
    fn single_object_accept_requires_exactly_one_row() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::ACCEPT,
            "application/vnd.pgrst.object+json".parse().unwrap(),
        );
        assert!(shape_rows(vec![], &headers).is_err());
        assert_eq!(
            shape_rows(vec![json!({"a": 1})], &headers).unwrap(),
            json!({"a": 1})
        );
        assert!(shape_rows(vec![json!(1), json!(2)], &headers).is_err());
    }
}
