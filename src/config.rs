//! Queue configuration and on-disk directory layout.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::queue::PersistentQueue;
use crate::Result;

pub const DEFAULT_DATA_PAGE_SIZE: u64 = 128 * 1024 * 1024;
pub const DEFAULT_INDEX_ITEMS_PER_PAGE: u64 = 50_000;
pub const DEFAULT_MIN_DEQUEUE_BATCH_SIZE: usize = 1;
pub const DEFAULT_MAX_DEQUEUE_BATCH_SIZE: usize = 100;
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(10);

/// Settings for a [`PersistentQueue`].
///
/// All fields are plain data; build one with [`QueueConfiguration::new`] and
/// adjust fields directly or via struct update syntax.
#[derive(Debug, Clone)]
pub struct QueueConfiguration {
    /// Root directory of the queue. The meta, index and data page
    /// directories live underneath it.
    pub queue_path: PathBuf,
    pub meta_page_dir: String,
    pub index_page_dir: String,
    pub data_page_dir: String,
    /// Number of 24-byte index records per index page.
    pub index_items_per_page: u64,
    /// Size of one data page in bytes. Also the hard per-item size limit.
    pub data_page_size: u64,
    /// A dequeue does not complete until at least this many items exist.
    pub min_dequeue_batch_size: usize,
    /// Upper bound on the number of items returned by one dequeue.
    pub max_dequeue_batch_size: usize,
    /// Optional byte budget for one dequeue batch. The first item of a batch
    /// is always returned, so progress is guaranteed even for items larger
    /// than the budget.
    pub max_dequeue_batch_bytes: Option<u64>,
    /// When a byte budget is set: whether enqueuing an item larger than the
    /// budget fails (`true`) or is accepted anyway (`false`).
    pub reject_oversized_items: bool,
    /// Idle TTL for cached index and data page handles.
    pub cache_ttl: Duration,
}

impl QueueConfiguration {
    pub fn new(queue_path: impl Into<PathBuf>) -> Self {
        Self {
            queue_path: queue_path.into(),
            meta_page_dir: "meta".to_string(),
            index_page_dir: "index".to_string(),
            data_page_dir: "data".to_string(),
            index_items_per_page: DEFAULT_INDEX_ITEMS_PER_PAGE,
            data_page_size: DEFAULT_DATA_PAGE_SIZE,
            min_dequeue_batch_size: DEFAULT_MIN_DEQUEUE_BATCH_SIZE,
            max_dequeue_batch_size: DEFAULT_MAX_DEQUEUE_BATCH_SIZE,
            max_dequeue_batch_bytes: None,
            reject_oversized_items: true,
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }

    pub fn with_data_page_size(queue_path: impl Into<PathBuf>, data_page_size: u64) -> Self {
        Self {
            data_page_size,
            ..Self::new(queue_path)
        }
    }

    /// Opens (or creates) the queue described by this configuration.
    pub fn open(self) -> Result<PersistentQueue> {
        PersistentQueue::open(self)
    }

    pub fn meta_path(&self) -> PathBuf {
        self.queue_path.join(&self.meta_page_dir)
    }

    pub fn index_path(&self) -> PathBuf {
        self.queue_path.join(&self.index_page_dir)
    }

    pub fn data_path(&self) -> PathBuf {
        self.queue_path.join(&self.data_page_dir)
    }

    pub fn queue_path(&self) -> &Path {
        &self.queue_path
    }
}
