//! In-memory metadata for known media

use crate::types::{MediaRecord, MediaState};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Result of [`MetadataIndex::get_or_create_downloading`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The caller moved the record to `Downloading` and must run the download
    Started,
    /// Another caller already owns the download
    AlreadyDownloading,
    /// The record is cached at this path
    Cached(PathBuf),
}

/// Task-safe map from remote key to its [`MediaRecord`].
///
/// Every method takes the lock once, so each state transition is atomic.
#[derive(Debug, Default)]
pub struct MetadataIndex {
    records: RwLock<HashMap<String, MediaRecord>>,
}

impl MetadataIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, MediaRecord>> {
        self.records.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, MediaRecord>> {
        self.records.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, remote_key: &str) -> Option<MediaRecord> {
        self.read().get(remote_key).cloned()
    }

    /// Insert or replace the record for its remote key
    pub fn upsert(&self, record: MediaRecord) {
        self.write().insert(record.remote_key.clone(), record);
    }

    pub fn remove(&self, remote_key: &str) -> Option<MediaRecord> {
        self.write().remove(remote_key)
    }

    /// Atomically check the record's state and claim the download if nobody has.
    ///
    /// Creates the record on first request. `NotCached` and `Failed` records
    /// move to `Downloading`.
    pub fn get_or_create_downloading(&self, remote_key: &str) -> Claim {
        let mut records = self.write();
        let record = records
            .entry(remote_key.to_string())
            .or_insert_with(|| MediaRecord::new(remote_key));

        match (record.state, &record.local_path) {
            (MediaState::Cached, Some(path)) => Claim::Cached(path.clone()),
            (MediaState::Downloading, _) => Claim::AlreadyDownloading,
            _ => {
                record.state = MediaState::Downloading;
                record.local_path = None;
                record.last_error = None;
                Claim::Started
            }
        }
    }

    pub fn mark_cached(
        &self,
        remote_key: &str,
        local_path: PathBuf,
        size_bytes: u64,
        created_at: DateTime<Utc>,
    ) {
        let mut records = self.write();
        let record = records
            .entry(remote_key.to_string())
            .or_insert_with(|| MediaRecord::new(remote_key));
        record.local_path = Some(local_path);
        record.size_bytes = size_bytes;
        record.created_at = created_at;
        record.state = MediaState::Cached;
        record.last_error = None;
    }

    pub fn mark_failed(&self, remote_key: &str, error: String) {
        let mut records = self.write();
        let record = records
            .entry(remote_key.to_string())
            .or_insert_with(|| MediaRecord::new(remote_key));
        record.local_path = None;
        record.state = MediaState::Failed;
        record.last_error = Some(error);
    }

    /// Reset a record whose file is gone. Returns the path it pointed at.
    pub fn mark_not_cached(&self, remote_key: &str) -> Option<PathBuf> {
        let mut records = self.write();
        let record = records.get_mut(remote_key)?;
        if record.state == MediaState::Downloading {
            return None;
        }
        record.state = MediaState::NotCached;
        record.size_bytes = 0;
        record.local_path.take()
    }

    /// Drop the cached record backed by `path`. Used after eviction.
    pub fn remove_by_path(&self, path: &Path) -> Option<MediaRecord> {
        let mut records = self.write();
        let key = records
            .iter()
            .find(|(_, r)| r.state == MediaState::Cached && r.local_path.as_deref() == Some(path))
            .map(|(k, _)| k.clone())?;
        records.remove(&key)
    }

    /// Drop every record not currently downloading. Returns the removed records.
    pub fn clear_settled(&self) -> Vec<MediaRecord> {
        let mut records = self.write();
        let keys: Vec<String> = records
            .iter()
            .filter(|(_, r)| r.state != MediaState::Downloading)
            .map(|(k, _)| k.clone())
            .collect();
        keys.iter().filter_map(|k| records.remove(k)).collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Bytes held by cached records
    pub fn cached_bytes(&self) -> u64 {
        self.read()
            .values()
            .filter(|r| r.is_cached())
            .map(|r| r.size_bytes)
            .sum()
    }

    pub fn count_in_state(&self, state: MediaState) -> usize {
        self.read().values().filter(|r| r.state == state).count()
    }
}
