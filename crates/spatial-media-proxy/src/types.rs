//! Core types for the spatial media proxy

use serde::{Deserialize, Serialize};
use spatial_media_cache::{
    CacheConfig, CacheStats, DEFAULT_MEDIA_CACHE_SIZE, DEFAULT_PREVIEW_CACHE_SIZE,
};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the media proxy
#[derive(Debug, Clone)]
pub struct MediaProxyConfig {
    pub port: u16,
    pub cache_dir: PathBuf,
    pub preview_cache_dir: PathBuf,
    pub max_cache_size: u64,
    pub max_preview_cache_size: u64,
    pub fetch_timeout_secs: u64,
}

impl Default for MediaProxyConfig {
    fn default() -> Self {
        Self {
            port: 3001,
            cache_dir: PathBuf::from("./cache/media"),
            preview_cache_dir: PathBuf::from("./cache/preview"),
            max_cache_size: DEFAULT_MEDIA_CACHE_SIZE,
            max_preview_cache_size: DEFAULT_PREVIEW_CACHE_SIZE,
            fetch_timeout_secs: 60,
        }
    }
}

impl MediaProxyConfig {
    pub fn media_cache(&self) -> CacheConfig {
        CacheConfig::new(self.cache_dir.clone(), self.max_cache_size)
            .with_fetch_timeout(Duration::from_secs(self.fetch_timeout_secs))
    }

    pub fn preview_cache(&self) -> CacheConfig {
        CacheConfig::new(self.preview_cache_dir.clone(), self.max_preview_cache_size)
            .with_fetch_timeout(Duration::from_secs(self.fetch_timeout_secs))
    }
}

/// `?url=` query naming the remote media
#[derive(Debug, Deserialize)]
pub struct MediaQuery {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct InvalidateResponse {
    pub removed: bool,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub media: CacheStats,
    pub preview: CacheStats,
}
