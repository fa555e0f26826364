//! HTTP server for media proxy endpoints
//!
//! Provides /health, /media and /preview. `GET /media?url=` resolves the
//! remote URL through the media cache and returns the file; `DELETE` on the
//! same path invalidates the cached copy.

use crate::error::Result;
use crate::types::{HealthResponse, InvalidateResponse, MediaQuery};
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use spatial_media_cache::{FileType, HttpBlobFetcher, MediaCache, ResolveSource, Resolved};
use std::sync::Arc;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

pub type ProxyCache = MediaCache<HttpBlobFetcher>;

const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// Shared state for the HTTP server
pub struct ServerState {
    pub media: ProxyCache,
    pub preview: ProxyCache,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(media: ProxyCache, preview: ProxyCache) -> Self {
        Self {
            media,
            preview,
            started_at: Utc::now(),
        }
    }
}

pub type SharedState = Arc<ServerState>;

/// Create the HTTP router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/media", get(get_media).delete(invalidate_media))
        .route("/preview", get(get_preview).delete(invalidate_preview))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server
pub async fn start_server(state: SharedState, port: u16) -> std::io::Result<()> {
    let router = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await
}

/// Health check endpoint
async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let uptime_secs = (Utc::now() - state.started_at).num_seconds() as u64;

    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs,
        media: state.media.stats(),
        preview: state.preview.stats(),
    })
}

async fn get_media(State(state): State<SharedState>, Query(query): Query<MediaQuery>) -> Response {
    respond(serve_cached(&state.media, &query.url).await, &query.url)
}

async fn get_preview(
    State(state): State<SharedState>,
    Query(query): Query<MediaQuery>,
) -> Response {
    respond(serve_cached(&state.preview, &query.url).await, &query.url)
}

async fn invalidate_media(
    State(state): State<SharedState>,
    Query(query): Query<MediaQuery>,
) -> Response {
    respond(invalidate(&state.media, &query.url).await, &query.url)
}

async fn invalidate_preview(
    State(state): State<SharedState>,
    Query(query): Query<MediaQuery>,
) -> Response {
    respond(invalidate(&state.preview, &query.url).await, &query.url)
}

fn respond(result: Result<Response>, url: &str) -> Response {
    result.unwrap_or_else(|e| {
        warn!(url = %url, error = %e, "Media request failed");
        e.into_response()
    })
}

/// Resolve `url` through `cache` and stream the file back
async fn serve_cached(cache: &ProxyCache, url: &str) -> Result<Response> {
    let (resolved, file) = open_resolved(cache, url).await?;
    let content_length = file.metadata().await?.len().to_string();

    let cache_header = match resolved.source {
        ResolveSource::Hit => "HIT",
        ResolveSource::Downloaded => "MISS",
        ResolveSource::Coalesced => "COALESCED",
    };
    let content_type = FileType::from_path(url)
        .map(|t| t.content_type())
        .unwrap_or("application/octet-stream");

    // The open handle keeps the bytes readable even if the file is evicted mid-stream
    let body = Body::from_stream(ReaderStream::new(file));

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_LENGTH, content_length.as_str()),
            (header::CACHE_CONTROL, "public, max-age=86400"),
            (X_CACHE, cache_header),
        ],
        body,
    )
        .into_response())
}

/// Resolve and open the cached file, resolving once more if it was
/// evicted between the two steps
async fn open_resolved(cache: &ProxyCache, url: &str) -> Result<(Resolved, File)> {
    let resolved = cache.resolve_detailed(url).await?;
    match File::open(&resolved.path).await {
        Ok(file) => Ok((resolved, file)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(url = %url, path = ?resolved.path, "Cached file evicted before it was opened");
            let resolved = cache.resolve_detailed(url).await?;
            let file = File::open(&resolved.path).await?;
            Ok((resolved, file))
        }
        Err(e) => Err(e.into()),
    }
}

async fn invalidate(cache: &ProxyCache, url: &str) -> Result<Response> {
    let removed = cache.invalidate(url).await?;
    Ok(Json(InvalidateResponse { removed }).into_response())
}
