//! TiddlyWeb-style endpoints

use std::io;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{
        header::{CONTENT_TYPE, ETAG},
        HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
};
use md5::{Digest, Md5};
use tidbit_core::{Revision, StoreResult, Tiddler, TiddlerStore, BAG};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::form_urlencoded;

use super::error::{AppError, AppResult};
use crate::state::AppState;

const JSON: &str = "application/json";
const STATUS: &str = r#"{"username":"me","space":{"recipe":"all"}}"#;

/// Run a store call on the blocking pool.
///
/// The call gets a fresh cancellation token that fires if this future is
/// dropped, i.e. when the client goes away before the store is done.
async fn run_blocking<T, F>(state: &AppState, op: F) -> AppResult<T>
where
    F: FnOnce(&dyn TiddlerStore, &CancellationToken) -> StoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(&state.store);
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    let result = tokio::task::spawn_blocking(move || op(store.as_ref(), &cancel))
        .await
        .map_err(AppError::internal)?;
    guard.disarm();

    Ok(result?)
}

/// GET /
pub async fn index(State(state): State<AppState>) -> AppResult<Response> {
    let path = &state.index_path;
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => {}
        Ok(_) => return Err(AppError::with_status(StatusCode::NOT_FOUND)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!("no index page at {}", path.display());
            return Err(AppError::with_status(StatusCode::NOT_FOUND));
        }
        Err(err) => return Err(AppError::internal(format!("{}: {err}", path.display()))),
    }

    let page = tokio::fs::read(path)
        .await
        .map_err(|err| AppError::internal(format!("{}: {err}", path.display())))?;
    Ok(([(CONTENT_TYPE, "text/html")], page).into_response())
}

/// GET /status
pub async fn status() -> impl IntoResponse {
    ([(CONTENT_TYPE, JSON)], STATUS)
}

/// GET /recipes/all/tiddlers.json
///
/// Skinny tiddlers, plus fat macro tiddlers, as one JSON array.
pub async fn list(State(state): State<AppState>) -> AppResult<Response> {
    let tiddlers = run_blocking(&state, |store, cancel| store.all(cancel)).await?;

    let mut body = Vec::with_capacity(tiddlers.len() * 64 + 2);
    body.push(b'[');
    let mut first = true;
    for tiddler in &tiddlers {
        if tiddler.meta.is_empty() {
            continue;
        }
        let json = match tiddler.to_json() {
            Ok(json) => json,
            Err(err) => {
                warn!(key = %tiddler.key, "skipping tiddler in listing: {err}");
                continue;
            }
        };
        if !first {
            body.push(b',');
        }
        first = false;
        body.extend_from_slice(&json);
    }
    body.push(b']');

    Ok(([(CONTENT_TYPE, JSON)], body).into_response())
}

/// GET /recipes/all/tiddlers/{key}
pub async fn get_tiddler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> AppResult<Response> {
    let tiddler = run_blocking(&state, move |store, cancel| store.get(cancel, &key)).await?;
    let json = tiddler.to_json()?;
    Ok(([(CONTENT_TYPE, JSON)], json).into_response())
}

/// PUT /recipes/all/tiddlers/{key}
pub async fn put_tiddler(
    State(state): State<AppState>,
    Path(key): Path<String>,
    body: Bytes,
) -> AppResult<Response> {
    let tiddler = Tiddler::from_json_body(key, &body)
        .map_err(|err| AppError::new(StatusCode::BAD_REQUEST, Some(err)))?;
    let digest = Md5::digest(&tiddler.meta);
    let escaped: String = form_urlencoded::byte_serialize(tiddler.key.as_bytes()).collect();

    let revision = run_blocking(&state, move |store, cancel| store.put(cancel, &tiddler)).await?;

    let etag = etag(&escaped, revision, &format!("{digest:x}"));
    let etag = HeaderValue::from_str(&etag).map_err(AppError::internal)?;
    Ok((StatusCode::NO_CONTENT, [(ETAG, etag)]).into_response())
}

/// DELETE /bags/bag/tiddlers/{key}
pub async fn delete_tiddler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> AppResult<StatusCode> {
    run_blocking(&state, move |store, cancel| store.delete(cancel, &key)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `"bag/<escaped key>/<revision>:<md5 hex>"`
fn etag(escaped_key: &str, revision: Revision, digest_hex: &str) -> String {
    format!("\"{BAG}/{escaped_key}/{revision}:{digest_hex}\"")
}
