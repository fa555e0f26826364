//! Storage-bounded local cache for remote spatial media
//!
//! Downloads videos and 3D models on demand, stores them in a flat cache
//! directory under a name derived from the remote URL, coalesces concurrent
//! requests for the same URL into a single download, and evicts the oldest
//! files once the directory exceeds its byte budget.

pub mod budget;
mod cache;
mod error;
mod fetcher;
mod index;
mod types;

pub use budget::{EvictionReport, StorageBudgetManager};
pub use cache::{cache_file_name, MediaCache, ResolveSource, Resolved};
pub use error::{CacheError, FetchError, Result};
pub use fetcher::{parse_remote_key, BlobFetcher, HttpBlobFetcher, TempBlob};
pub use index::{Claim, MetadataIndex};
pub use types::{
    CacheConfig, CacheStats, FileType, MediaRecord, MediaState, PostMedia,
    DEFAULT_FETCH_TIMEOUT, DEFAULT_MEDIA_CACHE_SIZE, DEFAULT_PREVIEW_CACHE_SIZE,
};
