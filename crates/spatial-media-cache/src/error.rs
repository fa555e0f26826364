//! Error types for the spatial media cache

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

/// Errors from a single blob download
#[derive(Debug, Clone)]
pub enum FetchError {
    /// The remote key is not an http(s) URL. Retrying with the same key is pointless.
    InvalidUrl(String),
    /// Connect error, timeout, reset or non-success status.
    Transport(String),
    /// Writing the staged file failed.
    Io(Arc<io::Error>),
}

impl FetchError {
    /// Whether a fresh `resolve` of the same key may succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchError::InvalidUrl(_))
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::InvalidUrl(msg) => write!(f, "Invalid URL: {msg}"),
            FetchError::Transport(msg) => write!(f, "Transport failure: {msg}"),
            FetchError::Io(err) => write!(f, "Staging IO error: {err}"),
        }
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FetchError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Transport(format!("timed out: {err}"))
        } else {
            FetchError::Transport(err.to_string())
        }
    }
}

impl From<io::Error> for FetchError {
    fn from(err: io::Error) -> Self {
        FetchError::Io(Arc::new(err))
    }
}

/// Errors surfaced by [`crate::MediaCache`]
///
/// Cloneable so one outcome can be handed to every coalesced waiter.
#[derive(Debug, Clone)]
pub enum CacheError {
    DownloadFailed(FetchError),
    Filesystem {
        path: PathBuf,
        source: Arc<io::Error>,
    },
    /// The download task panicked or was cancelled by runtime shutdown.
    TaskAborted(String),
}

impl CacheError {
    pub(crate) fn filesystem(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CacheError::Filesystem {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            CacheError::DownloadFailed(err) => err.is_retryable(),
            _ => true,
        }
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::DownloadFailed(err) => write!(f, "Download failed: {err}"),
            CacheError::Filesystem { path, source } => {
                write!(f, "Filesystem error at {}: {source}", path.display())
            }
            CacheError::TaskAborted(msg) => write!(f, "Download task aborted: {msg}"),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::DownloadFailed(err) => Some(err),
            CacheError::Filesystem { source, .. } => Some(source.as_ref()),
            CacheError::TaskAborted(_) => None,
        }
    }
}

impl From<FetchError> for CacheError {
    fn from(err: FetchError) -> Self {
        CacheError::DownloadFailed(err)
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
