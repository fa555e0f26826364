//! Media cache orchestration: resolve, coalesce, publish and evict

use crate::budget::{scan_directory, EvictionReport, StorageBudgetManager};
use crate::error::{CacheError, Result};
use crate::fetcher::{parse_remote_key, BlobFetcher};
use crate::index::{Claim, MetadataIndex};
use crate::types::{CacheConfig, CacheStats, MediaRecord, MediaState};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::fs;
use tracing::{debug, info, warn};
use url::Url;

type SharedDownload = Shared<BoxFuture<'static, Result<PathBuf>>>;

/// How a resolved path was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveSource {
    /// Already cached, no network activity
    Hit,
    /// This caller started the download
    Downloaded,
    /// Attached to a download another caller started
    Coalesced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub path: PathBuf,
    pub source: ResolveSource,
}

/// Local cache of remote media files, bounded by a byte budget.
///
/// Cheap to clone; clones share the same index and in-flight downloads.
pub struct MediaCache<F> {
    inner: Arc<Inner<F>>,
}

impl<F> Clone for MediaCache<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<F> {
    config: CacheConfig,
    fetcher: F,
    index: MetadataIndex,
    budget: StorageBudgetManager,
    /// Downloads currently running, keyed by remote key
    in_flight: Mutex<HashMap<String, SharedDownload>>,
    /// Held while files are moved into, evicted from or deleted from the cache directory
    eviction_lock: tokio::sync::Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    downloads: AtomicU64,
    failures: AtomicU64,
    evictions: AtomicU64,
}

/// Cache file name for a remote key: sha256 of the key plus its extension
pub fn cache_file_name(remote_key: &str) -> String {
    let digest = hex::encode(Sha256::digest(remote_key.as_bytes()));
    match key_extension(remote_key) {
        Some(ext) => format!("{digest}.{ext}"),
        None => digest,
    }
}

fn key_extension(remote_key: &str) -> Option<String> {
    let url = Url::parse(remote_key).ok()?;
    let ext = Path::new(url.path()).extension()?.to_str()?;
    if ext.is_empty() || ext.len() > 8 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

fn file_created_at(metadata: &std::fs::Metadata) -> DateTime<Utc> {
    metadata
        .created()
        .or_else(|_| metadata.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

impl<F: BlobFetcher> MediaCache<F> {
    pub fn new(config: CacheConfig, fetcher: F) -> Self {
        let budget = StorageBudgetManager::new(config.cache_dir.clone(), config.max_size_bytes);
        Self {
            inner: Arc::new(Inner {
                config,
                fetcher,
                index: MetadataIndex::new(),
                budget,
                in_flight: Mutex::new(HashMap::new()),
                eviction_lock: tokio::sync::Mutex::new(()),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                coalesced: AtomicU64::new(0),
                downloads: AtomicU64::new(0),
                failures: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn fetcher(&self) -> &F {
        &self.inner.fetcher
    }

    pub fn index(&self) -> &MetadataIndex {
        &self.inner.index
    }

    /// Where `remote_key` is stored once cached
    pub fn cache_path(&self, remote_key: &str) -> PathBuf {
        self.inner.config.cache_dir.join(cache_file_name(remote_key))
    }

    pub fn record(&self, remote_key: &str) -> Option<MediaRecord> {
        self.inner.index.get(remote_key)
    }

    /// Create the cache directories, drop leftover staged downloads and
    /// bring the directory within budget
    pub async fn init(&self) -> Result<()> {
        let config = &self.inner.config;
        fs::create_dir_all(&config.cache_dir)
            .await
            .map_err(|e| CacheError::filesystem(&config.cache_dir, e))?;
        fs::create_dir_all(&config.staging_dir)
            .await
            .map_err(|e| CacheError::filesystem(&config.staging_dir, e))?;

        let stale = scan_directory(&config.staging_dir)
            .await
            .map_err(|e| CacheError::filesystem(&config.staging_dir, e))?;
        for file in stale {
            if let Err(e) = fs::remove_file(&file.path).await {
                warn!(path = ?file.path, error = %e, "Failed to remove stale staged download");
            }
        }

        let _eviction = self.inner.eviction_lock.lock().await;
        let report = self
            .inner
            .budget
            .reconcile()
            .await
            .map_err(|e| CacheError::filesystem(&config.cache_dir, e))?;
        self.inner.apply_eviction(&report);

        info!(
            cache_dir = ?config.cache_dir,
            max_size_bytes = config.max_size_bytes,
            used_bytes = report.remaining_bytes,
            "Cache initialized"
        );
        Ok(())
    }

    /// Return a local path for `remote_key`, downloading it if needed
    pub async fn resolve(&self, remote_key: &str) -> Result<PathBuf> {
        self.resolve_detailed(remote_key).await.map(|r| r.path)
    }

    /// Like [`MediaCache::resolve`], also reporting whether the path was a hit.
    ///
    /// Dropping the returned future only stops this caller waiting; the
    /// download keeps running and still populates the cache.
    pub async fn resolve_detailed(&self, remote_key: &str) -> Result<Resolved> {
        // Malformed keys never get a record
        parse_remote_key(remote_key)?;

        if let Some(path) = self.cached_path(remote_key).await {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %remote_key, "Cache hit");
            return Ok(Resolved {
                path,
                source: ResolveSource::Hit,
            });
        }

        let (download, source) = {
            let mut in_flight = self.inner.lock_in_flight();

            if let Some(download) = in_flight.get(remote_key) {
                (download.clone(), ResolveSource::Coalesced)
            } else {
                match self.inner.index.get_or_create_downloading(remote_key) {
                    Claim::Cached(path) => {
                        self.inner.hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(Resolved {
                            path,
                            source: ResolveSource::Hit,
                        });
                    }
                    Claim::AlreadyDownloading => {
                        // Every claim inserts into in_flight under this lock, so a
                        // downloading record without an entry was set from outside.
                        return Err(CacheError::TaskAborted(format!(
                            "{remote_key} is marked downloading but has no active download"
                        )));
                    }
                    Claim::Started => {
                        self.inner.misses.fetch_add(1, Ordering::Relaxed);
                        let download = self.spawn_download(remote_key);
                        in_flight.insert(remote_key.to_string(), download.clone());
                        (download, ResolveSource::Downloaded)
                    }
                }
            }
        };

        if source == ResolveSource::Coalesced {
            self.inner.coalesced.fetch_add(1, Ordering::Relaxed);
            debug!(key = %remote_key, "Joined in-flight download");
        }

        let path = download.await?;
        Ok(Resolved { path, source })
    }

    /// Path of a cached record whose file still exists.
    /// A record whose file has vanished is reset to `NotCached`.
    async fn cached_path(&self, remote_key: &str) -> Option<PathBuf> {
        let record = self.inner.index.get(remote_key)?;
        if record.state != MediaState::Cached {
            return None;
        }
        let path = record.local_path?;

        if fs::try_exists(&path).await.unwrap_or(false) {
            Some(path)
        } else {
            warn!(key = %remote_key, path = ?path, "Cached file missing, will download again");
            self.inner.index.mark_not_cached(remote_key);
            None
        }
    }

    fn spawn_download(&self, remote_key: &str) -> SharedDownload {
        let inner = self.inner.clone();
        let key = remote_key.to_string();

        let handle = tokio::spawn(async move {
            let _guard = InFlightGuard {
                inner: inner.clone(),
                key: key.clone(),
            };
            inner.download(&key).await
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(CacheError::TaskAborted(e.to_string())),
            }
        }
        .boxed()
        .shared()
    }

    /// Delete the cached copy of `remote_key` and reset it to `NotCached`.
    ///
    /// Returns whether a file was removed. A key that is currently
    /// downloading is left alone.
    pub async fn invalidate(&self, remote_key: &str) -> Result<bool> {
        let _eviction = self.inner.eviction_lock.lock().await;

        if let Some(record) = self.inner.index.get(remote_key) {
            if record.state == MediaState::Downloading {
                debug!(key = %remote_key, "Not invalidating in-flight download");
                return Ok(false);
            }
        }

        let indexed = self.inner.index.mark_not_cached(remote_key);
        let path = indexed.unwrap_or_else(|| self.cache_path(remote_key));

        match fs::remove_file(&path).await {
            Ok(()) => {
                info!(key = %remote_key, path = ?path, "Invalidated cached media");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CacheError::filesystem(path, e)),
        }
    }

    /// Delete every cached file and forget every settled record.
    /// Returns the number of bytes removed.
    pub async fn clear(&self) -> Result<u64> {
        let _eviction = self.inner.eviction_lock.lock().await;
        let cache_dir = &self.inner.config.cache_dir;

        let dropped = self.inner.index.clear_settled();
        let files = scan_directory(cache_dir)
            .await
            .map_err(|e| CacheError::filesystem(cache_dir, e))?;

        let mut freed = 0;
        for file in files {
            match fs::remove_file(&file.path).await {
                Ok(()) => freed += file.size,
                Err(e) => warn!(path = ?file.path, error = %e, "Failed to remove cached file"),
            }
        }

        info!(records = dropped.len(), freed_bytes = freed, "Cleared cache");
        Ok(freed)
    }

    pub fn stats(&self) -> CacheStats {
        let inner = &self.inner;
        CacheStats {
            entries: inner.index.count_in_state(MediaState::Cached),
            total_size: inner.index.cached_bytes(),
            hits: inner.hits.load(Ordering::Relaxed),
            misses: inner.misses.load(Ordering::Relaxed),
            coalesced: inner.coalesced.load(Ordering::Relaxed),
            downloads: inner.downloads.load(Ordering::Relaxed),
            failures: inner.failures.load(Ordering::Relaxed),
            evictions: inner.evictions.load(Ordering::Relaxed),
        }
    }
}

impl<F> Inner<F> {
    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<String, SharedDownload>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn apply_eviction(&self, report: &EvictionReport) {
        for path in &report.evicted {
            if let Some(record) = self.index.remove_by_path(path) {
                debug!(key = %record.remote_key, "Evicted media record");
            }
        }
        self.evictions
            .fetch_add(report.evicted.len() as u64, Ordering::Relaxed);
    }

    fn fail(&self, remote_key: &str, err: CacheError) -> CacheError {
        self.failures.fetch_add(1, Ordering::Relaxed);
        warn!(key = %remote_key, error = %err, "Failed to cache media");
        self.index.mark_failed(remote_key, err.to_string());
        err
    }
}

impl<F: BlobFetcher> Inner<F> {
    /// Fetch `remote_key`, move it into the cache and publish it.
    /// Runs on its own task, once per claimed download.
    async fn download(&self, remote_key: &str) -> Result<PathBuf> {
        let dest = self.config.cache_dir.join(cache_file_name(remote_key));

        // Files only land here by rename, so an existing file is complete.
        // Held across the check so a reconcile can't unlink it before it is published.
        {
            let _eviction = self.eviction_lock.lock().await;
            if let Ok(metadata) = fs::metadata(&dest).await {
                if metadata.is_file() {
                    self.index.mark_cached(
                        remote_key,
                        dest.clone(),
                        metadata.len(),
                        file_created_at(&metadata),
                    );
                    debug!(key = %remote_key, path = ?dest, "Adopted existing cache file");
                    return Ok(dest);
                }
            }
        }

        self.downloads.fetch_add(1, Ordering::Relaxed);
        let blob = match self.fetcher.fetch(remote_key).await {
            Ok(blob) => blob,
            Err(e) => return Err(self.fail(remote_key, e.into())),
        };

        let _eviction = self.eviction_lock.lock().await;

        if let Err(e) = blob.persist(&dest) {
            return Err(self.fail(remote_key, CacheError::filesystem(&dest, e)));
        }

        let metadata = match fs::metadata(&dest).await {
            Ok(metadata) => metadata,
            Err(e) => return Err(self.fail(remote_key, CacheError::filesystem(&dest, e))),
        };
        let size = metadata.len();
        self.index
            .mark_cached(remote_key, dest.clone(), size, file_created_at(&metadata));

        info!(key = %remote_key, path = ?dest, size, "Cached media");

        // Eviction failures never fail the download
        match self.budget.reconcile_protecting(Some(&dest)).await {
            Ok(report) => self.apply_eviction(&report),
            Err(e) => warn!(error = %e, "Failed to reconcile cache budget"),
        }

        Ok(dest)
    }
}

/// Settles a download's bookkeeping when its task ends, including by panic
struct InFlightGuard<F> {
    inner: Arc<Inner<F>>,
    key: String,
}

impl<F> Drop for InFlightGuard<F> {
    fn drop(&mut self) {
        if let Some(record) = self.inner.index.get(&self.key) {
            if record.state == MediaState::Downloading {
                self.inner
                    .index
                    .mark_failed(&self.key, "download task aborted".to_string());
            }
        }
        self.inner.lock_in_flight().remove(&self.key);
    }
}
