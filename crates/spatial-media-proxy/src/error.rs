//! Error types for the spatial media proxy

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use spatial_media_cache::{CacheError, FetchError};
use std::fmt;

#[derive(Debug)]
pub enum MediaProxyError {
    Cache(CacheError),
    Io(Box<std::io::Error>),
    Config(String),
}

impl MediaProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            MediaProxyError::Cache(CacheError::DownloadFailed(FetchError::InvalidUrl(_))) => {
                StatusCode::BAD_REQUEST
            }
            MediaProxyError::Cache(CacheError::DownloadFailed(FetchError::Transport(_))) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for MediaProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaProxyError::Cache(err) => write!(f, "Cache error: {}", err),
            MediaProxyError::Io(err) => write!(f, "IO error: {}", err),
            MediaProxyError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for MediaProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MediaProxyError::Cache(err) => Some(err),
            MediaProxyError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<CacheError> for MediaProxyError {
    fn from(err: CacheError) -> Self {
        MediaProxyError::Cache(err)
    }
}

impl From<FetchError> for MediaProxyError {
    fn from(err: FetchError) -> Self {
        MediaProxyError::Cache(CacheError::DownloadFailed(err))
    }
}

impl From<std::io::Error> for MediaProxyError {
    fn from(err: std::io::Error) -> Self {
        MediaProxyError::Io(Box::new(err))
    }
}

impl From<tracing_subscriber::filter::ParseError> for MediaProxyError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        MediaProxyError::Config(err.to_string())
    }
}

impl IntoResponse for MediaProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Media request failed");
        }
        (status, axum::Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type Result<T> = std::result::Result<T, MediaProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_error_display() {
        let err = MediaProxyError::from(FetchError::Transport("connection reset".to_string()));
        assert_eq!(
            format!("{}", err),
            "Cache error: Download failed: Transport failure: connection reset"
        );
    }

    #[test]
    fn test_config_error_display() {
        let err = MediaProxyError::Config("missing CACHE_DIR".to_string());
        assert_eq!(format!("{}", err), "Configuration error: missing CACHE_DIR");
    }

    #[test]
    fn test_status_mapping() {
        let err = MediaProxyError::from(FetchError::InvalidUrl("nope".to_string()));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err = MediaProxyError::from(FetchError::Transport("timed out".to_string()));
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);

        let err = MediaProxyError::Cache(CacheError::TaskAborted("panic".to_string()));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_error_is_debug() {
        let err = MediaProxyError::Config("test".to_string());
        let debug_str = format!("{:?}", err);
        assert!(debug_str.contains("Config"));
    }
}
