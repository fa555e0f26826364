//! Cache types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const GIB: u64 = 1024 * 1024 * 1024;

/// Budget for the general media cache
pub const DEFAULT_MEDIA_CACHE_SIZE: u64 = 10 * GIB;
/// Budget for the preview cache
pub const DEFAULT_PREVIEW_CACHE_SIZE: u64 = 3 * GIB;
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Name of the staging subdirectory created under the cache directory
pub const STAGING_DIR_NAME: &str = ".staging";

/// Download state of a remote media object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaState {
    #[default]
    NotCached,
    Downloading,
    Cached,
    Failed,
}

/// One piece of remote media known to the cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRecord {
    pub remote_key: String,
    pub local_path: Option<PathBuf>,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub state: MediaState,
    pub last_error: Option<String>,
}

impl MediaRecord {
    pub fn new(remote_key: impl Into<String>) -> Self {
        Self {
            remote_key: remote_key.into(),
            local_path: None,
            size_bytes: 0,
            created_at: Utc::now(),
            state: MediaState::NotCached,
            last_error: None,
        }
    }

    pub fn is_cached(&self) -> bool {
        self.state == MediaState::Cached && self.local_path.is_some()
    }
}

/// How a post's media is rendered. The cache never branches on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Video,
    Model,
    RealityScene,
}

impl FileType {
    /// Guess the file type from the extension of a remote key or local path
    pub fn from_path(path: &str) -> Option<Self> {
        let path = path.split(['?', '#']).next().unwrap_or(path);
        let ext = Path::new(path).extension()?.to_str()?;
        match ext.to_ascii_lowercase().as_str() {
            "mov" | "mp4" | "m4v" => Some(FileType::Video),
            "usdz" | "usd" => Some(FileType::Model),
            "reality" => Some(FileType::RealityScene),
            _ => None,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            FileType::Video => "video/quicktime",
            FileType::Model => "model/vnd.usdz+zip",
            FileType::RealityScene => "application/octet-stream",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileType::Video => "video",
            FileType::Model => "model",
            FileType::RealityScene => "reality",
        };
        f.write_str(s)
    }
}

impl FromStr for FileType {
    type Err = String;

    /// Parses the `fileType` field stored on post documents
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "video" | "mov" | "mp4" => Ok(FileType::Video),
            "model" | "usdz" => Ok(FileType::Model),
            "reality" => Ok(FileType::RealityScene),
            other => Err(format!("unknown file type: {other}")),
        }
    }
}

/// The part of a post document the cache consumes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMedia {
    pub remote_key: String,
    pub file_type: FileType,
}

/// Configuration for one cache instance
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Flat directory holding cached files
    pub cache_dir: PathBuf,
    /// Where downloads are staged before being moved into `cache_dir`.
    /// Must be on the same filesystem as `cache_dir`.
    pub staging_dir: PathBuf,
    pub max_size_bytes: u64,
    pub fetch_timeout: Duration,
}

impl CacheConfig {
    pub fn new(cache_dir: impl Into<PathBuf>, max_size_bytes: u64) -> Self {
        let cache_dir = cache_dir.into();
        Self {
            staging_dir: cache_dir.join(STAGING_DIR_NAME),
            cache_dir,
            max_size_bytes,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    /// General media cache (10 GiB)
    pub fn media(cache_dir: impl Into<PathBuf>) -> Self {
        Self::new(cache_dir, DEFAULT_MEDIA_CACHE_SIZE)
    }

    /// Preview cache (3 GiB)
    pub fn preview(cache_dir: impl Into<PathBuf>) -> Self {
        Self::new(cache_dir, DEFAULT_PREVIEW_CACHE_SIZE)
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }
}

/// Statistics about the cache
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_size: u64,
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub downloads: u64,
    pub failures: u64,
    pub evictions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_default() {
        let stats = CacheStats::default();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.total_size, 0);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.evictions, 0);
    }

    #[test]
    fn test_media_record_serialization() {
        let mut record = MediaRecord::new("https://cdn.example.com/posts/abc.usdz");
        record.local_path = Some(PathBuf::from("/cache/abc123.usdz"));
        record.size_bytes = 12345;
        record.state = MediaState::Cached;

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"cached\""));
        assert!(json.contains("12345"));

        let deserialized: MediaRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.remote_key, record.remote_key);
        assert!(deserialized.is_cached());
    }

    #[test]
    fn test_new_record_is_not_cached() {
        let record = MediaRecord::new("https://cdn.example.com/a.mov");
        assert_eq!(record.state, MediaState::NotCached);
        assert!(record.local_path.is_none());
        assert!(!record.is_cached());
    }

    #[test]
    fn test_file_type_from_path() {
        assert_eq!(
            FileType::from_path("https://cdn.example.com/v/clip.MOV"),
            Some(FileType::Video)
        );
        assert_eq!(
            FileType::from_path("https://cdn.example.com/m/chair.usdz?alt=media&token=x"),
            Some(FileType::Model)
        );
        assert_eq!(
            FileType::from_path("scene.reality"),
            Some(FileType::RealityScene)
        );
        assert_eq!(FileType::from_path("https://cdn.example.com/readme"), None);
    }

    #[test]
    fn test_file_type_from_str() {
        assert_eq!("video".parse::<FileType>().unwrap(), FileType::Video);
        assert_eq!("model".parse::<FileType>().unwrap(), FileType::Model);
        assert!("gif".parse::<FileType>().is_err());
    }

    #[test]
    fn test_post_media_deserialization() {
        let json = r#"{"remoteKey": "https://cdn.example.com/a.mov", "fileType": "video"}"#;
        let media: PostMedia = serde_json::from_str(json).unwrap();
        assert_eq!(media.file_type, FileType::Video);
    }

    #[test]
    fn test_config_defaults() {
        let config = CacheConfig::media("/tmp/media");
        assert_eq!(config.max_size_bytes, 10 * 1024 * 1024 * 1024);
        assert_eq!(config.staging_dir, PathBuf::from("/tmp/media/.staging"));
        assert_eq!(config.fetch_timeout, DEFAULT_FETCH_TIMEOUT);

        let config = CacheConfig::preview("/tmp/preview").with_fetch_timeout(Duration::from_secs(5));
        assert_eq!(config.max_size_bytes, 3 * 1024 * 1024 * 1024);
        assert_eq!(config.fetch_timeout, Duration::from_secs(5));
    }
}
