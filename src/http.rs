//! Optional client-facing HTTP API (`"http"` feature): a thin axum surface
//! over [`crate::core::QuorumDb`] for clients that don't link the crate
//! directly.
use crate::clock::Context;
use crate::core::QuorumDb;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Clone)]
struct AppState {
    db: QuorumDb,
}

/// Build the router. Mount it with `axum::serve` on whatever listener the
/// caller prefers; this module doesn't own the socket.
pub fn router(db: QuorumDb) -> Router {
    Router::new()
        .route("/db/{bucket}/{key}", get(handle_get).put(handle_put).delete(handle_delete))
        .with_state(AppState { db })
}

#[derive(Debug, Serialize)]
struct GetResponse {
    values: Vec<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct PutRequest {
    value: JsonValue,
    #[serde(default)]
    context: Context,
}

#[derive(Debug, Deserialize, Default)]
struct DeleteRequest {
    #[serde(default)]
    context: Context,
}

async fn handle_get(State(state): State<AppState>, Path((bucket, key)): Path<(String, String)>) -> Response {
    match state.db.get(bucket.as_bytes(), key.as_bytes()).await {
        Ok(values) => Json(GetResponse { values }).into_response(),
        Err(e) => db_error_response(e),
    }
}

async fn handle_put(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    Json(req): Json<PutRequest>,
) -> Response {
    match state.db.put(bucket.as_bytes(), key.as_bytes(), req.context, req.value).await {
        Ok(ctx) => Json(ctx).into_response(),
        Err(e) => db_error_response(e),
    }
}

async fn handle_delete(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    body: Option<Json<DeleteRequest>>,
) -> Response {
    let context = body.map(|Json(r)| r.context).unwrap_or_default();
    match state.db.delete(bucket.as_bytes(), key.as_bytes(), context).await {
        Ok(ctx) => Json(ctx).into_response(),
        Err(e) => db_error_response(e),
    }
}

fn db_error_response(e: crate::error::DbError) -> Response {
    use crate::error::DbError::*;
    let status = match e {
        NotFound => StatusCode::NOT_FOUND,
        Timeout => StatusCode::GATEWAY_TIMEOUT,
        Overload => StatusCode::SERVICE_UNAVAILABLE,
        NotReady => StatusCode::SERVICE_UNAVAILABLE,
        InvalidContext => StatusCode::BAD_REQUEST,
        Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string()).into_response()
}
