//! HTTP API
//!
//! Client routes:
//! - `GET|PUT|DELETE /kv/*key` (`PUT` takes `ttl_ms`, `nx`, `keepttl`)
//! - `POST /incr/*key?by=`, `POST /append/*key`
//! - `GET /keys?prefix=&limit=`, `POST /flush`
//! - `GET /health`, `GET /status`
//!
//! Replication routes (served by the master, consumed by replicas):
//! - `GET /replication/wal?limit=&offset=`
//! - `GET|POST /replication/offset`
//! - `GET /dump?replica_id=`

use crate::common::{Error, Result};
use crate::engine::WriteInput;
use crate::replication::{
    Manager, Offset, OffsetInfo, OffsetReport, Position, WalBatch, CURRENT_OFFSET_HEADER,
};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

/// Remaining time to live of a returned key, in milliseconds
pub const TTL_HEADER: &str = "x-ttl-ms";

/// Largest accepted request body (one value)
pub const MAX_VALUE_SIZE: usize = 512 * 1024 * 1024;

#[derive(Clone)]
pub struct HttpState {
    pub manager: Arc<Manager>,
    /// How long a write waits to be applied locally before answering 202
    pub apply_timeout: Duration,
}

impl HttpState {
    pub fn new(manager: Arc<Manager>) -> Self {
        Self {
            manager,
            apply_timeout: Duration::from_secs(5),
        }
    }
}

pub fn create_router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/kv/*key", get(get_key).put(put_key).delete(delete_key))
        .route("/incr/*key", post(incr_key))
        .route("/append/*key", post(append_key))
        .route("/keys", get(list_keys))
        .route("/flush", post(flush))
        .route("/replication/wal", get(replication_wal))
        .route(
            "/replication/offset",
            get(current_offset).post(report_offset),
        )
        .route("/dump", get(dump))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(MAX_VALUE_SIZE))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WriteAck {
    pub offset: Offset,
    /// False when the write is durable in the WAL but not yet applied
    pub applied: bool,
    /// Value after the write, for increments and appends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

async fn health(State(state): State<HttpState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "node_id": state.manager.node_id(),
        "role": state.manager.role(),
    }))
}

async fn status(State(state): State<HttpState>) -> Result<impl IntoResponse> {
    Ok(Json(state.manager.status()?))
}

async fn get_key(State(state): State<HttpState>, Path(key): Path<String>) -> Result<Response> {
    let out = state.manager.read(key.as_bytes())?;
    let value = match out.value {
        Some(value) if out.exists => value,
        _ => {
            return Ok((
                StatusCode::NOT_FOUND,
                Json(json!({ "error": format!("key not found: {}", key) })),
            )
                .into_response())
        }
    };

    let mut resp = (StatusCode::OK, value).into_response();
    if let Some(ttl) = out.ttl {
        resp.headers_mut()
            .insert(TTL_HEADER, HeaderValue::from(ttl.as_millis() as u64));
    }
    Ok(resp)
}

#[derive(Debug, Default, Deserialize)]
struct PutParams {
    ttl_ms: Option<u64>,
    #[serde(default)]
    nx: bool,
    #[serde(default)]
    keepttl: bool,
}

/// Submit a write and wait (bounded) until it is visible locally
async fn submit(state: &HttpState, input: &WriteInput) -> Result<(Offset, bool)> {
    let manager = state.manager.clone();
    let input = input.clone();
    // the WAL append is a synced RocksDB put
    let offset = tokio::task::spawn_blocking(move || manager.write(&input))
        .await
        .map_err(|e| Error::Internal(format!("write task failed: {}", e)))??;
    match state.manager.wait_for(offset, state.apply_timeout).await {
        Ok(()) => Ok((offset, true)),
        Err(Error::Timeout(_)) => Ok((offset, false)),
        Err(e) => Err(e),
    }
}

fn ack(offset: Offset, applied: bool, value: Option<String>) -> Response {
    let status = if applied {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    (
        status,
        Json(WriteAck {
            offset,
            applied,
            value,
        }),
    )
        .into_response()
}

async fn put_key(
    State(state): State<HttpState>,
    Path(key): Path<String>,
    Query(params): Query<PutParams>,
    body: Bytes,
) -> Result<Response> {
    let mut input = WriteInput::set(key, body.to_vec());
    if let Some(ms) = params.ttl_ms {
        input = input.with_ttl(Duration::from_millis(ms));
    }
    if params.nx {
        input = input.with_only_if_not_exists();
    }
    if params.keepttl {
        input = input.with_keep_ttl();
    }

    let (offset, applied) = submit(&state, &input).await?;
    Ok(ack(offset, applied, None))
}

async fn delete_key(State(state): State<HttpState>, Path(key): Path<String>) -> Result<Response> {
    let (offset, applied) = submit(&state, &WriteInput::delete(key)).await?;
    Ok(ack(offset, applied, None))
}

#[derive(Debug, Deserialize)]
struct IncrParams {
    by: Option<String>,
}

async fn incr_key(
    State(state): State<HttpState>,
    Path(key): Path<String>,
    Query(params): Query<IncrParams>,
) -> Result<Response> {
    let delta = params.by.unwrap_or_else(|| "1".to_string());
    let (offset, applied) = submit(&state, &WriteInput::increment(key.clone(), delta)).await?;
    Ok(ack(offset, applied, current_value(&state, &key, applied)?))
}

async fn append_key(
    State(state): State<HttpState>,
    Path(key): Path<String>,
    body: Bytes,
) -> Result<Response> {
    let (offset, applied) =
        submit(&state, &WriteInput::append(key.clone(), body.to_vec())).await?;
    Ok(ack(offset, applied, current_value(&state, &key, applied)?))
}

fn current_value(state: &HttpState, key: &str, applied: bool) -> Result<Option<String>> {
    if !applied {
        return Ok(None);
    }
    let out = state.manager.read(key.as_bytes())?;
    Ok(out
        .value
        .map(|v| String::from_utf8_lossy(&v).into_owned()))
}

#[derive(Debug, Default, Deserialize)]
struct KeysParams {
    #[serde(default)]
    prefix: String,
    limit: Option<usize>,
}

async fn list_keys(
    State(state): State<HttpState>,
    Query(params): Query<KeysParams>,
) -> Result<impl IntoResponse> {
    let limit = params.limit.unwrap_or(usize::MAX);
    let mut keys = Vec::new();
    if limit > 0 {
        state.manager.iterate(params.prefix.as_bytes(), &mut |key: &[u8], _: &[u8]| {
            keys.push(String::from_utf8_lossy(key).into_owned());
            keys.len() < limit
        })?;
    }
    Ok(Json(json!({ "keys": keys })))
}

async fn flush(State(state): State<HttpState>) -> Result<Response> {
    let (offset, applied) = submit(&state, &WriteInput::flush_all()).await?;
    Ok(ack(offset, applied, None))
}

// === Replication ===

#[derive(Debug, Default, Deserialize)]
struct WalParams {
    #[serde(default)]
    limit: i64,
    #[serde(default)]
    offset: String,
}

async fn replication_wal(
    State(state): State<HttpState>,
    Query(params): Query<WalParams>,
) -> Result<impl IntoResponse> {
    let position: Position = params.offset.parse()?;
    let limit = if params.limit <= 0 {
        0
    } else {
        params.limit as usize
    };
    let manager = state.manager.clone();
    let entries = tokio::task::spawn_blocking(move || manager.range_since(position, limit))
        .await
        .map_err(|e| Error::Internal(format!("WAL read task failed: {}", e)))??;
    Ok(Json(WalBatch { entries }))
}

async fn current_offset(State(state): State<HttpState>) -> Result<impl IntoResponse> {
    Ok(Json(OffsetInfo {
        offset: state.manager.current_position()?,
    }))
}

async fn report_offset(
    State(state): State<HttpState>,
    Json(report): Json<OffsetReport>,
) -> Result<impl IntoResponse> {
    state
        .manager
        .report_offset(&report.replica_id, report.offset)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
struct DumpParams {
    replica_id: Option<String>,
}

async fn dump(
    State(state): State<HttpState>,
    Query(params): Query<DumpParams>,
) -> Result<Response> {
    let manager = state.manager.clone();
    let replica_id = params.replica_id.filter(|id| !id.trim().is_empty());
    let (position, bytes) =
        tokio::task::spawn_blocking(move || manager.capture_dump(replica_id.as_deref()))
            .await
            .map_err(|e| Error::Internal(format!("dump task failed: {}", e)))??;

    let offset = HeaderValue::from_str(&position.to_string())
        .map_err(|e| Error::Internal(format!("invalid offset header: {}", e)))?;
    let mut resp = (StatusCode::OK, bytes).into_response();
    let headers = resp.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(CURRENT_OFFSET_HEADER, offset);
    Ok(resp)
}
