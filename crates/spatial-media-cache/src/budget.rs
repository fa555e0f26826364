//! Storage budget accounting and oldest-first eviction
//!
//! Works on a flat directory: only regular files directly under it are
//! counted or evicted. Subdirectories (such as the download staging area)
//! and symlinks are ignored.

use std::cmp::Ordering;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;
use tracing::{debug, info, warn};

/// A regular file found in the cache directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedFile {
    pub path: PathBuf,
    pub size: u64,
    /// Birth time, or modification time where the platform has none
    pub created: SystemTime,
}

/// Outcome of one reconcile pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub freed_bytes: u64,
    pub evicted: Vec<PathBuf>,
    pub remaining_bytes: u64,
    /// Set when only files that may not be evicted remain and they exceed the budget
    pub exceeded_after_eviction: bool,
}

/// Keeps a cache directory at or under a byte budget
#[derive(Debug, Clone)]
pub struct StorageBudgetManager {
    directory: PathBuf,
    budget_bytes: u64,
}

impl StorageBudgetManager {
    pub fn new(directory: impl Into<PathBuf>, budget_bytes: u64) -> Self {
        Self {
            directory: directory.into(),
            budget_bytes,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    pub async fn total_size(&self) -> io::Result<u64> {
        directory_size(&self.directory).await
    }

    pub async fn reconcile(&self) -> io::Result<EvictionReport> {
        reconcile(&self.directory, self.budget_bytes).await
    }

    /// Reconcile without ever deleting `protected`
    pub async fn reconcile_protecting(&self, protected: Option<&Path>) -> io::Result<EvictionReport> {
        reconcile_protecting(&self.directory, self.budget_bytes, protected).await
    }
}

/// List the regular files directly under `directory`
pub async fn scan_directory(directory: &Path) -> io::Result<Vec<CachedFile>> {
    let mut files = Vec::new();
    let mut entries = fs::read_dir(directory).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();

        // Entries can disappear between listing and stat
        let file_type = match entry.file_type().await {
            Ok(file_type) => file_type,
            Err(e) => {
                debug!(path = ?path, error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        if !file_type.is_file() {
            continue;
        }

        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(e) => {
                debug!(path = ?path, error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .unwrap_or(UNIX_EPOCH);

        files.push(CachedFile {
            path,
            size: metadata.len(),
            created,
        });
    }

    Ok(files)
}

/// Total bytes of the regular files directly under `directory`
pub async fn directory_size(directory: &Path) -> io::Result<u64> {
    let files = scan_directory(directory).await?;
    Ok(files.iter().map(|f| f.size).sum())
}

/// Oldest first, ties broken by file name
fn eviction_order(a: &CachedFile, b: &CachedFile) -> Ordering {
    a.created
        .cmp(&b.created)
        .then_with(|| a.path.file_name().cmp(&b.path.file_name()))
}

/// Evict oldest files under `directory` until it fits in `budget_bytes`.
/// Returns how much was freed and what was deleted.
pub async fn reconcile(directory: &Path, budget_bytes: u64) -> io::Result<EvictionReport> {
    reconcile_protecting(directory, budget_bytes, None).await
}

pub async fn reconcile_protecting(
    directory: &Path,
    budget_bytes: u64,
    protected: Option<&Path>,
) -> io::Result<EvictionReport> {
    let files = scan_directory(directory).await?;
    Ok(evict_files(files, budget_bytes, protected).await)
}

async fn evict_files(
    mut files: Vec<CachedFile>,
    budget_bytes: u64,
    protected: Option<&Path>,
) -> EvictionReport {
    let mut total: u64 = files.iter().map(|f| f.size).sum();
    let mut report = EvictionReport::default();

    if total <= budget_bytes {
        report.remaining_bytes = total;
        return report;
    }

    files.retain(|f| Some(f.path.as_path()) != protected);
    files.sort_by(eviction_order);

    for file in files {
        if total <= budget_bytes {
            break;
        }

        match fs::remove_file(&file.path).await {
            Ok(()) => {
                total = total.saturating_sub(file.size);
                report.freed_bytes += file.size;
                debug!(path = ?file.path, size = file.size, "Evicted cached file");
                report.evicted.push(file.path);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // Already gone, so it no longer counts against the budget
                total = total.saturating_sub(file.size);
                warn!(path = ?file.path, "Cached file vanished before eviction");
            }
            Err(e) => {
                warn!(path = ?file.path, error = %e, "Failed to evict cached file, skipping");
            }
        }
    }

    report.remaining_bytes = total;
    report.exceeded_after_eviction = total > budget_bytes;

    if report.exceeded_after_eviction {
        warn!(
            remaining_bytes = total,
            budget_bytes, "Cache still over budget after eviction"
        );
    } else if report.freed_bytes > 0 {
        info!(
            freed_bytes = report.freed_bytes,
            evicted = report.evicted.len(),
            remaining_bytes = total,
            "Reconciled cache budget"
        );
    }

    report
}
