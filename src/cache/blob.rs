//! Blob Store
//!
//! One file per identifier in a single directory, raw bytes only.
//! Writes go through a temp file that is renamed over the target, so readers
//! only ever see a complete previous or complete new payload.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::error::{CacheError, Result};

/// Number of write lock stripes
const LOCK_STRIPES: usize = 64;

/// Extension of in-flight write files
const TEMP_EXTENSION: &str = "tmp";

/// Directory of blobs keyed by identifier
pub struct BlobStore {
    /// Directory holding one file per identifier
    dir: PathBuf,
    /// Writers of the same identifier always land on the same stripe
    stripes: Vec<Mutex<()>>,
    /// Makes every write fail before touching the target
    #[cfg(test)]
    pub(crate) fail_writes: std::sync::atomic::AtomicBool,
}

impl BlobStore {
    /// Open a blob store in `dir`, creating it if needed
    ///
    /// Temp files left behind by interrupted writes are removed.
    ///
    /// # Arguments
    /// * `dir` - Directory holding one file per identifier
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let store = Self {
            dir: dir.into(),
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            #[cfg(test)]
            fail_writes: std::sync::atomic::AtomicBool::new(false),
        };

        store.ensure_directory()?;
        store.cleanup();

        info!(blob_dir = %store.dir.display(), "Blob store initialized");
        Ok(store)
    }

    /// Create the blob directory if it does not exist
    pub fn ensure_directory(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| CacheError::io(&self.dir, e))
    }

    /// Create or overwrite the blob for `id`
    ///
    /// Concurrent writers of the same identifier are serialized; the last
    /// rename wins.
    pub fn write(&self, id: &str, data: &[u8]) -> Result<PathBuf> {
        let _guard = self.lock(id);
        self.write_locked(id, data)
    }

    /// [`write`](Self::write) for a caller already holding `lock(id)`
    pub(crate) fn write_locked(&self, id: &str, data: &[u8]) -> Result<PathBuf> {
        let path = self.path_for(id);

        #[cfg(test)]
        if self.fail_writes.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(CacheError::io(
                &self.dir,
                std::io::Error::new(ErrorKind::Other, "write disabled"),
            ));
        }

        let mut tmp = tempfile::Builder::new()
            .prefix(".")
            .suffix(&format!(".{}", TEMP_EXTENSION))
            .tempfile_in(&self.dir)
            .map_err(|e| CacheError::io(&self.dir, e))?;

        tmp.write_all(data)
            .map_err(|e| CacheError::io(tmp.path().to_path_buf(), e))?;

        tmp.persist(&path).map_err(|e| CacheError::Persist {
            path: path.clone(),
            source: e.error,
        })?;

        debug!(
            id = id,
            local = %path.display(),
            size = data.len(),
            "Stored blob"
        );

        Ok(path)
    }

    /// Read the blob for `id`; `None` when there is no such file
    pub fn read(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(id);
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::io(path, e)),
        }
    }

    /// Whether a blob file exists for `id`
    pub fn exists(&self, id: &str) -> bool {
        self.path_for(id).is_file()
    }

    /// Delete the blob for `id`; returns false if it was already gone
    pub fn delete(&self, id: &str) -> Result<bool> {
        let _guard = self.lock(id);
        self.delete_locked(id)
    }

    /// [`delete`](Self::delete) for a caller already holding `lock(id)`
    pub(crate) fn delete_locked(&self, id: &str) -> Result<bool> {
        let path = self.path_for(id);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(id = id, "Deleted blob");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CacheError::io(path, e)),
        }
    }

    /// Delete every file in the blob directory, returning how many went
    ///
    /// Files that cannot be removed are logged and skipped.
    pub fn clear(&self) -> Result<usize> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(CacheError::io(&self.dir, e)),
        };

        let mut removed = 0;
        for entry in read_dir.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove blob"),
            }
        }

        Ok(removed)
    }

    /// Clean up stale temp files from interrupted writes
    pub fn cleanup(&self) {
        if let Ok(read_dir) = fs::read_dir(&self.dir) {
            for entry in read_dir.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == TEMP_EXTENSION) {
                    debug!(path = %path.display(), "Removing stale temp file");
                    if let Err(e) = fs::remove_file(&path) {
                        warn!(path = %path.display(), error = %e, "Failed to remove stale temp file");
                    }
                }
            }
        }
    }

    /// On-disk location of the blob for `id`
    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    /// Get the blob directory path
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Exclusive access to `id` for writers and deleters
    pub(crate) fn lock(&self, id: &str) -> MutexGuard<'_, ()> {
        let stripe = id
            .bytes()
            .fold(0usize, |h, b| h.wrapping_mul(31).wrapping_add(b as usize))
            % self.stripes.len();
        self.stripes[stripe]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
