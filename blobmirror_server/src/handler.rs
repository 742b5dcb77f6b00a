//! HTTP handlers for the mirror surface.

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use http::{HeaderMap, header};
use blobmirror_cache::{Cache, ItemReader};
use blobmirror_core::CacheError;

use crate::config::Settings;

#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<Cache>,
    pub settings: Arc<Settings>,
}

/// GET /
pub(crate) async fn get_root(State(app): State<AppState>) -> Response {
    match &app.settings.redirect {
        Some(url) => (StatusCode::FOUND, [(header::LOCATION, url.clone())]).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// GET /robots.txt
pub(crate) async fn robots() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain")],
        "User-agent: *\nDisallow: /\n",
    )
}

/// POST /reload
pub(crate) async fn reload(
    State(app): State<AppState>,
    headers: HeaderMap,
    Json(keys): Json<Vec<String>>,
) -> Response {
    let authorized = match &app.settings.api_key {
        Some(expected) => headers
            .get("x-api-key")
            .and_then(|value| value.to_str().ok())
            .is_some_and(|got| got == expected),
        None => false,
    };
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    log::info!(keys = keys.len(); "forced reload");
    app.cache.force_expire(&keys);
    StatusCode::OK.into_response()
}

/// GET /{*path}
pub(crate) async fn get_blob(State(app): State<AppState>, Path(path): Path<String>) -> Response {
    let key = match (&app.settings.index_match, &app.settings.index_key) {
        (Some(re), Some(index_key)) if re.is_match(&path) => index_key.as_str(),
        _ => path.as_str(),
    };
    serve(&app, key).await
}

async fn serve(app: &AppState, key: &str) -> Response {
    match stream_item(app, key).await {
        Ok(reader) => {
            log::info!(key = key, length = reader.len(); "serving");
            let cache_control = match &app.settings.no_cache {
                Some(re) if re.is_match(key) => "private, no-cache, no-store".to_string(),
                _ => {
                    let max_age = app.cache.validity_period().as_secs().saturating_sub(1);
                    format!("public, max-age={max_age}")
                }
            };
            blob_response(app, StatusCode::OK, key, reader, &cache_control)
        }
        Err(err) if err.is_not_found() => not_found(app).await,
        Err(CacheError::Disposed) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        Err(err) => {
            log::warn!(key = key, error = err.to_string().as_str(); "request failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Resolves `key` to a streaming reader, kicking off the shared download
/// when the item has none yet. An item can expire between the existence
/// check and the reader; retry once against a fresh item in that case.
async fn stream_item(app: &AppState, key: &str) -> Result<ItemReader, CacheError> {
    for _ in 0..2 {
        let item = app.cache.get(key)?;
        if !item.exists().await? {
            return Err(CacheError::NotFound {
                key: key.to_string(),
            });
        }
        match item.start_download() {
            Ok(()) => {}
            Err(CacheError::InvalidState { .. }) => continue,
            Err(err) => return Err(err),
        }
        match item.local_reader().await {
            Ok(reader) => return Ok(reader),
            Err(CacheError::InvalidState { .. }) => continue,
            Err(err) => return Err(err),
        }
    }
    Err(CacheError::NotFound {
        key: key.to_string(),
    })
}

fn blob_response(
    app: &AppState,
    status: StatusCode,
    key: &str,
    reader: ItemReader,
    cache_control: &str,
) -> Response {
    let content_type = content_type(&app.settings, key);
    let built = Response::builder()
        .status(status)
        .header(header::CONTENT_LENGTH, reader.len())
        .header(header::CONTENT_TYPE, content_type.as_ref())
        .header(header::CACHE_CONTROL, cache_control)
        .body(Body::from_stream(reader.into_stream()));
    match built {
        Ok(response) => response,
        Err(err) => {
            log::error!(key = key, error = err.to_string().as_str(); "failed to build response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn not_found(app: &AppState) -> Response {
    if let Some(not_found_key) = &app.settings.not_found_key {
        match stream_item(app, not_found_key).await {
            Ok(reader) => {
                return blob_response(
                    app,
                    StatusCode::NOT_FOUND,
                    not_found_key,
                    reader,
                    "private, no-cache, no-store",
                );
            }
            Err(err) => {
                log::warn!(key = not_found_key.as_str(), error = err.to_string().as_str(); "substitute 404 body unavailable");
            }
        }
    }
    StatusCode::NOT_FOUND.into_response()
}

fn content_type(settings: &Settings, key: &str) -> mime::Mime {
    std::path::Path::new(key)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .and_then(|ext| settings.types.get(ext.as_str()))
        .cloned()
        .unwrap_or(mime::APPLICATION_OCTET_STREAM)
}
