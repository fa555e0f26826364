//! Spatial media proxy - local cache in front of remote media storage
//!
//! Serves spatial videos and 3D models to app clients from a bounded local
//! cache, downloading from remote object storage on first request.

mod error;
mod server;
mod types;

use crate::error::{MediaProxyError, Result};
use crate::server::{start_server, ProxyCache, ServerState, SharedState};
use crate::types::MediaProxyConfig;
use spatial_media_cache::{CacheConfig, HttpBlobFetcher, MediaCache};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let env_filter = EnvFilter::from_default_env()
        .add_directive("spatial_media_proxy=info".parse()?)
        .add_directive("spatial_media_cache=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    };

    info!("Starting spatial media proxy...");

    let config = load_config();
    info!("Port: {}", config.port);
    info!("Media cache dir: {:?}", config.cache_dir);
    info!("Preview cache dir: {:?}", config.preview_cache_dir);
    info!(
        "Max cache size: {} MB (media), {} MB (preview)",
        config.max_cache_size / (1024 * 1024),
        config.max_preview_cache_size / (1024 * 1024)
    );
    info!("Fetch timeout: {} seconds", config.fetch_timeout_secs);

    let media = build_cache(config.media_cache()).await?;
    let preview = build_cache(config.preview_cache()).await?;

    let state: SharedState = Arc::new(ServerState::new(media, preview));

    // Start HTTP server (blocking)
    start_server(state, config.port)
        .await
        .map_err(|e| MediaProxyError::Config(format!("Server error: {}", e)))?;

    Ok(())
}

async fn build_cache(config: CacheConfig) -> Result<ProxyCache> {
    let fetcher = HttpBlobFetcher::from_config(&config)?;
    let cache = MediaCache::new(config, fetcher);
    cache.init().await?;
    Ok(cache)
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.parse::<u64>().ok())
}

fn load_config() -> MediaProxyConfig {
    let defaults = MediaProxyConfig::default();

    let port = std::env::var("PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(defaults.port);

    let cache_dir = std::env::var("CACHE_DIR")
        .map(PathBuf::from)
        .unwrap_or(defaults.cache_dir);

    let preview_cache_dir = std::env::var("PREVIEW_CACHE_DIR")
        .map(PathBuf::from)
        .unwrap_or(defaults.preview_cache_dir);

    MediaProxyConfig {
        port,
        cache_dir,
        preview_cache_dir,
        max_cache_size: env_u64("MAX_CACHE_SIZE").unwrap_or(defaults.max_cache_size),
        max_preview_cache_size: env_u64("MAX_PREVIEW_CACHE_SIZE")
            .unwrap_or(defaults.max_preview_cache_size),
        fetch_timeout_secs: env_u64("FETCH_TIMEOUT_SECS").unwrap_or(defaults.fetch_timeout_secs),
    }
}
