//! Router and handlers for the four surfaces:
//! `/files/{key}`, `/files`, `/sign/{path}`, `/serve/{path}`.

use std::collections::HashMap;

use axum::body::Body;
use axum::extract::{Path, Query, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::TryStreamExt;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::Serialize;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::instrument;

use crate::error::ApiError;
use crate::AppState;

/// Build the service router. Cross-cutting layers (CORS, timeout) are
/// applied by the binary so tests drive the bare routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/files", get(list_files))
        .route(
            "/files/{*key}",
            get(get_file).head(head_file).put(put_file).delete(delete_file),
        )
        .route("/sign/{*path}", get(sign_path))
        .route("/serve/{*path}", get(serve_path))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// JSON shape of a list response.
#[derive(Debug, Serialize)]
pub struct ListResponse {
    /// Matching keys, ascending.
    pub keys: Vec<String>,
    /// Whether another page exists.
    pub has_more: bool,
    /// Signed URL for the next page, or empty.
    pub next_page: String,
}

/// API key or signed-query check for `/files` surfaces.
fn authorize_files(
    state: &AppState,
    headers: &HeaderMap,
    path: &str,
    query: &HashMap<String, String>,
) -> Result<(), ApiError> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        if state.signer.verify_api_key(key) {
            return Ok(());
        }
    }
    state
        .signer
        .verify_files_request(
            path,
            query.get(signer::EXPIRE_PARAM).map(String::as_str),
            query.get(signer::SIGNATURE_PARAM).map(String::as_str),
        )
        .map_err(|_| ApiError::unauthorized())
}

fn api_key_only(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    match headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        Some(key) if state.signer.verify_api_key(key) => Ok(()),
        _ => Err(ApiError::unauthorized()),
    }
}

#[instrument(skip_all, fields(key = %key))]
async fn put_file(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Body,
) -> Result<StatusCode, ApiError> {
    authorize_files(&state, &headers, &format!("/files/{key}"), &query)?;
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    let reader = StreamReader::new(body.into_data_stream().map_err(std::io::Error::other));
    state.store.put(key.as_bytes(), reader, declared).await?;
    Ok(StatusCode::CREATED)
}

async fn get_file(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    authorize_files(&state, &headers, &format!("/files/{key}"), &query)?;
    let got = state.store.get(key.as_bytes()).await?;
    blob_response(got.content_type, got.size, got.hash.to_hex(), Some(got.file))
}

async fn head_file(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    authorize_files(&state, &headers, &format!("/files/{key}"), &query)?;
    let stat = state.store.head(key.as_bytes()).await?;
    blob_response(stat.content_type, stat.size, stat.hash.to_hex(), None)
}

fn blob_response(
    content_type: String,
    size: u64,
    md5_hex: String,
    file: Option<tokio::fs::File>,
) -> Result<Response, ApiError> {
    let body = match file {
        Some(f) => Body::from_stream(ReaderStream::new(f)),
        None => Body::empty(),
    };
    Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, size)
        .header("content-md5", md5_hex)
        .body(body)
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

#[instrument(skip_all, fields(key = %key))]
async fn delete_file(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    authorize_files(&state, &headers, &format!("/files/{key}"), &query)?;
    let unlink = query.get("unlink").map(|v| v == "true" || v == "1").unwrap_or(false);
    state.store.delete(key.as_bytes(), unlink).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_files(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Json<ListResponse>, ApiError> {
    authorize_files(&state, &headers, "/files", &query)?;
    let limit = match query.get("limit") {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "invalid limit"))?,
        None => state.default_page_limit,
    };
    let unlinked = query.get("unlinked").map(|v| v == "true" || v == "1").unwrap_or(false);
    let page = state.store.list(&blob_store::ListQuery {
        prefix: query.get("prefix").cloned().unwrap_or_default().into_bytes(),
        starting_at: query.get("starting_at").map(|s| s.clone().into_bytes()),
        limit,
        unlinked,
    })?;

    let next_page = match (&page.next_starting_at, page.has_more) {
        (Some(cursor), true) => {
            let mut input = format!(
                "/sign/files?starting_at={}&limit={limit}",
                encode(&String::from_utf8_lossy(cursor)),
            );
            if let Some(prefix) = query.get("prefix") {
                input.push_str(&format!("&prefix={}", encode(prefix)));
            }
            if unlinked {
                input.push_str("&unlinked=true");
            }
            state.signer.sign_url(&input)?
        }
        _ => String::new(),
    };

    Ok(Json(ListResponse {
        keys: page.keys.iter().map(|k| String::from_utf8_lossy(k).into_owned()).collect(),
        has_more: page.has_more,
        next_page,
    }))
}

fn encode(value: &str) -> String {
    utf8_percent_encode(value, NON_ALPHANUMERIC).to_string()
}

async fn sign_path(
    State(state): State<AppState>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Result<String, ApiError> {
    api_key_only(&state, &headers)?;
    let input = match query {
        Some(q) => format!("/sign/{path}?{q}"),
        None => format!("/sign/{path}"),
    };
    Ok(state.signer.sign_url(&input)?)
}

async fn serve_path(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let accept = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok());
    let out = state.pipeline.serve(&path, accept).await?;
    Response::builder()
        .header(header::CONTENT_TYPE, out.content_type)
        .header(header::CONTENT_LENGTH, out.body.len())
        .header(header::CACHE_CONTROL, state.cache_control.clone())
        .body(Body::from(out.body))
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
