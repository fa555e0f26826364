//! Remote blob downloads into a staging directory

use crate::error::FetchError;
use crate::types::CacheConfig;
use reqwest::Client;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use url::Url;

/// A downloaded blob sitting in the staging directory.
///
/// The file is deleted when this is dropped, unless it has been moved into
/// the cache with [`TempBlob::persist`].
#[derive(Debug)]
pub struct TempBlob {
    path: TempPath,
    size: u64,
}

impl TempBlob {
    /// Stage an in-memory blob. Used by fetchers that don't stream.
    pub async fn from_bytes(staging_dir: &Path, data: &[u8]) -> Result<Self, FetchError> {
        let (mut file, path) = create_staged_file(staging_dir)?;
        file.write_all(data).await?;
        file.flush().await?;

        Ok(Self {
            path,
            size: data.len() as u64,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Atomically rename the staged file to `dest`
    pub(crate) fn persist(self, dest: &Path) -> io::Result<()> {
        self.path.persist(dest).map_err(|e| e.error)
    }
}

/// Downloads a remote object to a private staging location.
///
/// Implementations perform exactly one transfer per call and never retry.
pub trait BlobFetcher: Send + Sync + 'static {
    fn fetch(&self, remote_key: &str) -> impl Future<Output = Result<TempBlob, FetchError>> + Send;
}

/// Parse a remote key, accepting only absolute http(s) URLs with a host
pub fn parse_remote_key(remote_key: &str) -> Result<Url, FetchError> {
    let url = Url::parse(remote_key)
        .map_err(|e| FetchError::InvalidUrl(format!("{remote_key}: {e}")))?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(FetchError::InvalidUrl(format!(
                "{remote_key}: unsupported scheme {scheme}"
            )))
        }
    }

    match url.host_str() {
        Some(host) if !host.is_empty() => {}
        _ => return Err(FetchError::InvalidUrl(format!("{remote_key}: missing host"))),
    }

    Ok(url)
}

/// HTTP client for fetching media from remote object storage
pub struct HttpBlobFetcher {
    client: Client,
    staging_dir: PathBuf,
}

impl HttpBlobFetcher {
    /// Create a fetcher whose transfers are bounded by `timeout`
    pub fn new(staging_dir: impl Into<PathBuf>, timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            staging_dir: staging_dir.into(),
        })
    }

    pub fn from_config(config: &CacheConfig) -> Result<Self, FetchError> {
        Self::new(config.staging_dir.clone(), config.fetch_timeout)
    }
}

impl BlobFetcher for HttpBlobFetcher {
    async fn fetch(&self, remote_key: &str) -> Result<TempBlob, FetchError> {
        let url = parse_remote_key(remote_key)?;

        debug!(url = %url, "Fetching blob");

        let mut response = self.client.get(url.clone()).send().await?;

        if !response.status().is_success() {
            warn!(status = %response.status(), url = %url, "Failed to fetch blob");
            return Err(FetchError::Transport(format!(
                "remote returned status {}",
                response.status()
            )));
        }

        let (mut file, path) = create_staged_file(&self.staging_dir)?;
        let mut size = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            size += chunk.len() as u64;
        }
        file.flush().await?;

        debug!(url = %url, size, "Fetched blob");

        Ok(TempBlob { path, size })
    }
}

fn create_staged_file(staging_dir: &Path) -> io::Result<(tokio::fs::File, TempPath)> {
    let staged = tempfile::Builder::new()
        .prefix("download-")
        .suffix(".part")
        .tempfile_in(staging_dir)?;
    let (file, path) = staged.into_parts();
    Ok((tokio::fs::File::from_std(file), path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and return the base URL
    async fn serve_once(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut read = 0;
            loop {
                let n = socket.read(&mut buf[read..]).await.unwrap();
                read += n;
                if n == 0 || buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });

        format!("http://{}", addr)
    }

    #[test]
    fn test_parse_remote_key() {
        assert!(parse_remote_key("https://cdn.example.com/a.usdz").is_ok());
        assert!(parse_remote_key("http://127.0.0.1:9000/bucket/a.mov").is_ok());

        let err = parse_remote_key("not a url").unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl(_)));

        let err = parse_remote_key("ftp://example.com/a.mov").unwrap_err();
        assert!(err.to_string().contains("unsupported scheme"));

        let err = parse_remote_key("file:///etc/passwd").unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn test_fetch_invalid_url_fails_immediately() {
        let dir = tempdir().unwrap();
        let fetcher = HttpBlobFetcher::new(dir.path(), Duration::from_secs(5)).unwrap();

        let err = fetcher.fetch("::nope::").await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl(_)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_fetch_success_stages_file() {
        let dir = tempdir().unwrap();
        let base =
            serve_once("HTTP/1.1 200 OK\r\nContent-Length: 11\r\nConnection: close\r\n\r\nhello world")
                .await;
        let fetcher = HttpBlobFetcher::new(dir.path(), Duration::from_secs(5)).unwrap();

        let blob = fetcher.fetch(&format!("{}/a.mov", base)).await.unwrap();
        assert_eq!(blob.size(), 11);
        assert!(blob.path().starts_with(dir.path()));
        assert_eq!(std::fs::read(blob.path()).unwrap(), b"hello world");

        // Dropping an unpersisted blob cleans up the staged file
        let staged = blob.path().to_path_buf();
        drop(blob);
        assert!(!staged.exists());
    }

    #[tokio::test]
    async fn test_fetch_non_success_status() {
        let dir = tempdir().unwrap();
        let base =
            serve_once("HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await;
        let fetcher = HttpBlobFetcher::new(dir.path(), Duration::from_secs(5)).unwrap();

        let err = fetcher.fetch(&format!("{}/missing.usdz", base)).await.unwrap_err();
        assert!(matches!(err, FetchError::Transport(_)));
        assert!(err.to_string().contains("404"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_fetch_connection_refused() {
        let dir = tempdir().unwrap();
        // Bind then drop to get a port nothing listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let fetcher = HttpBlobFetcher::new(dir.path(), Duration::from_secs(5)).unwrap();

        let err = fetcher
            .fetch(&format!("http://127.0.0.1:{}/a.mov", port))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Transport(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_fetch_timeout_discards_partial_download() {
        let dir = tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Send the head and part of the body, then stall with the socket open
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            socket.read(&mut buf).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\npartial")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let fetcher = HttpBlobFetcher::new(dir.path(), Duration::from_millis(200)).unwrap();
        let err = fetcher
            .fetch(&format!("http://{}/scene.reality", addr))
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Transport(_)));
        assert!(err.to_string().contains("timed out"));
        assert!(err.is_retryable());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_temp_blob_persist() {
        let dir = tempdir().unwrap();
        let blob = TempBlob::from_bytes(dir.path(), b"model bytes").await.unwrap();
        assert_eq!(blob.size(), 11);

        let dest = dir.path().join("final.usdz");
        blob.persist(&dest).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"model bytes");
    }
}
