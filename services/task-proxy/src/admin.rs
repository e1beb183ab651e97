//! Admin API for key management
//!
//! Runs on a separate listener (default 127.0.0.1:9090) and is not meant to
//! be exposed publicly: listings return full key values, since deletion is
//! keyed by value.
//!
//! Endpoints:
//! - GET    /admin/keys          list records with memo and usage
//! - POST   /admin/keys          add a key `{"value": "...", "memo": "..."}`
//! - DELETE /admin/keys/{value}  remove a key (absent values are not an error)
//! - POST   /admin/pool/refresh  rescan the store now
//! - GET    /admin/pool          pool summary

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use common::fingerprint;
use key_pool::Pool;
use serde::Deserialize;
use tracing::{info, warn};

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    pool: Arc<Pool>,
}

impl AdminState {
    pub fn new(pool: Arc<Pool>) -> Self {
        Self { pool }
    }
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/keys", get(list_keys).post(add_key))
        .route("/admin/keys/{value}", delete(delete_key))
        .route("/admin/pool", get(pool_status))
        .route("/admin/pool/refresh", post(refresh_pool))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (status, [(CONTENT_TYPE, "application/json")], body.to_string()).into_response()
}

fn pool_error_response(err: key_pool::Error) -> Response {
    let status = match &err {
        key_pool::Error::DuplicateValue(_) => StatusCode::CONFLICT,
        key_pool::Error::InvalidValue(_) => StatusCode::BAD_REQUEST,
        key_pool::Error::RecordNotFound(_) => StatusCode::NOT_FOUND,
        key_pool::Error::StoreUnavailable(_) | key_pool::Error::PoolExhausted => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    };
    json_response(status, serde_json::json!({ "error": err.to_string() }))
}

/// GET /admin/keys
async fn list_keys(State(state): State<AdminState>) -> Response {
    match state.pool.list().await {
        Ok(keys) => json_response(StatusCode::OK, serde_json::json!({ "keys": keys })),
        Err(e) => {
            warn!(error = %e, "key listing failed");
            pool_error_response(e)
        }
    }
}

#[derive(Deserialize)]
struct AddKeyRequest {
    value: String,
    #[serde(default)]
    memo: String,
}

/// POST /admin/keys: persist a key and make it allocatable immediately.
async fn add_key(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<AddKeyRequest>,
) -> Response {
    match state.pool.add(&body.value, &body.memo).await {
        Ok(()) => json_response(
            StatusCode::CREATED,
            serde_json::json!({ "key": fingerprint(body.value.trim()), "status": "added" }),
        ),
        Err(e) => {
            warn!(key = %fingerprint(&body.value), error = %e, "key not added");
            pool_error_response(e)
        }
    }
}

/// DELETE /admin/keys/{value}
async fn delete_key(State(state): State<AdminState>, Path(value): Path<String>) -> Response {
    let key = fingerprint(&value);
    match state.pool.remove(&value).await {
        Ok(removed) => json_response(
            StatusCode::OK,
            serde_json::json!({
                "key": key,
                "status": if removed { "removed" } else { "absent" },
            }),
        ),
        Err(e) => {
            warn!(key, error = %e, "key removal failed");
            pool_error_response(e)
        }
    }
}

/// GET /admin/pool
async fn pool_status(State(state): State<AdminState>) -> Response {
    json_response(StatusCode::OK, state.pool.health())
}

/// POST /admin/pool/refresh: reload the pool from the store.
///
/// On failure the pool keeps serving its previous key list.
async fn refresh_pool(State(state): State<AdminState>) -> Response {
    match state.pool.refresh().await {
        Ok(count) => {
            info!(keys_total = count, "pool refreshed on demand");
            json_response(StatusCode::OK, state.pool.health())
        }
        Err(e) => {
            warn!(error = %e, "on-demand refresh failed");
            pool_error_response(e)
        }
    }
}
