//! Cache store configuration
//!
//! Everything lives under one caller-supplied root directory:
//! `<root>/CacheStore.db` for the metadata index and `<root>/Cache/` for blobs.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default metadata index file name
pub const DEFAULT_INDEX_FILE: &str = "CacheStore.db";

/// Default blob directory name
pub const DEFAULT_BLOB_DIR: &str = "Cache";

/// Default number of expiry timestamps kept in memory
pub const DEFAULT_MEMO_CAPACITY: u64 = 10_000;

/// Default SQLite busy timeout: 5 seconds
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Configuration for a [`CacheStore`](crate::CacheStore)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    /// Root directory holding the index file and blob directory
    pub root: PathBuf,
    /// Index file name, relative to `root`
    #[serde(default = "default_index_file")]
    pub index_file: String,
    /// Blob directory name, relative to `root`
    #[serde(default = "default_blob_dir")]
    pub blob_dir: String,
    /// Max entries in the in-memory expiry memo (0 disables it)
    #[serde(default = "default_memo_capacity")]
    pub memo_capacity: u64,
    /// How long an index call waits on a locked database
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_index_file() -> String {
    DEFAULT_INDEX_FILE.to_string()
}

fn default_blob_dir() -> String {
    DEFAULT_BLOB_DIR.to_string()
}

fn default_memo_capacity() -> u64 {
    DEFAULT_MEMO_CAPACITY
}

fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

impl CacheConfig {
    /// Configuration rooted at `root` with default file names and limits
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            index_file: default_index_file(),
            blob_dir: default_blob_dir(),
            memo_capacity: default_memo_capacity(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }

    /// Configuration rooted in the platform cache directory, under `app_name`
    pub fn default_location(app_name: &str) -> Self {
        let root = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(app_name);
        Self::new(root)
    }

    /// Full path of the metadata index file
    pub fn index_path(&self) -> PathBuf {
        self.root.join(&self.index_file)
    }

    /// Full path of the blob directory
    pub fn blob_path(&self) -> PathBuf {
        self.root.join(&self.blob_dir)
    }

    pub fn with_memo_capacity(mut self, capacity: u64) -> Self {
        self.memo_capacity = capacity;
        self
    }
}
