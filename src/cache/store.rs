//! Cache Store
//!
//! Orchestrates key hashing, the metadata index and the blob directory.
//! The two stores have no shared transaction; every path that can leave
//! them out of step resolves to a miss rather than stale or torn data:
//!
//! - `save` writes the index row before the blob, so a crash in between
//!   leaves a row without a blob (a miss), never a blob without an expiry.
//! - `load` treats absent or expired rows as a miss without touching the
//!   blob, and a valid row with no blob as a miss too.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::cache::blob::BlobStore;
use crate::cache::hasher::KeyHasher;
use crate::cache::index::{MetadataIndex, SqliteIndex};
use crate::cache::memo::{CacheStats, ExpiryMemo};
use crate::config::CacheConfig;
use crate::error::Result;

/// Longest TTL honored; larger values are clamped
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Persistent, expiration-aware key -> bytes cache
///
/// Construct once per cache root and share by reference (or through
/// [`SharedCacheStore`](crate::SharedCacheStore)); all methods take `&self`
/// and are safe to call from many threads.
pub struct CacheStore<I: MetadataIndex = SqliteIndex> {
    /// Identifier -> expiry table
    index: I,
    /// Identifier -> payload files
    blobs: BlobStore,
    /// Hot expiry lookups
    memo: ExpiryMemo,
}

impl CacheStore<SqliteIndex> {
    /// Open the cache rooted at `root` with default settings
    ///
    /// # Arguments
    /// * `root` - Directory holding `CacheStore.db` and `Cache/`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        Self::with_config(CacheConfig::new(root))
    }

    /// Open the cache described by `config`, backed by SQLite
    ///
    /// The database itself is opened lazily on first use; call
    /// [`init`](Self::init) to surface index errors up front.
    ///
    /// # Arguments
    /// * `config` - Cache root, file names and limits
    pub fn with_config(config: CacheConfig) -> Result<Self> {
        let index = SqliteIndex::new(
            config.index_path(),
            Duration::from_millis(config.busy_timeout_ms),
        );
        Self::with_index(index, &config)
    }
}

impl<I: MetadataIndex> CacheStore<I> {
    /// Build a store over a caller-supplied index implementation
    ///
    /// # Arguments
    /// * `index` - Metadata index to keep expiries in
    /// * `config` - Cache root (for the blob directory) and memo size;
    ///   the index settings in it are ignored
    pub fn with_index(index: I, config: &CacheConfig) -> Result<Self> {
        let blobs = BlobStore::new(config.blob_path())?;

        info!(
            root = %config.root.display(),
            memo_capacity = config.memo_capacity,
            "Cache store opened"
        );

        Ok(Self {
            index,
            blobs,
            memo: ExpiryMemo::new(config.memo_capacity),
        })
    }

    /// Force the metadata index to initialize now
    pub fn init(&self) -> Result<()> {
        self.index.init()
    }

    /// Store `data` under `key`, valid for `ttl` from now
    ///
    /// A zero TTL stores an entry that is already expired.
    pub fn save(&self, key: &str, data: &[u8], ttl: Duration) -> Result<()> {
        let id = KeyHasher::hash(key);
        let expire_at = SystemTime::now() + ttl.min(MAX_TTL);

        self.blobs.ensure_directory()?;

        let _guard = self.blobs.lock(&id);

        if let Err(e) = self.index.upsert(&id, expire_at) {
            self.memo.invalidate(&id);
            return Err(e);
        }
        self.memo.insert(&id, expire_at);

        if let Err(e) = self.blobs.write_locked(&id, data) {
            // The row now carries the new expiry; the previous payload must
            // not be served under it
            if let Err(delete_err) = self.blobs.delete_locked(&id) {
                warn!(id = %id, error = %delete_err, "Failed to drop previous blob");
            }
            self.memo.invalidate(&id);
            return Err(e);
        }

        debug!(
            key = key,
            id = %id,
            size = data.len(),
            ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            "Saved cache entry"
        );
        Ok(())
    }

    /// Fetch the payload for `key`
    ///
    /// `Ok(None)` is a miss: never saved, expired, or blob missing.
    /// `Err` is reserved for storage failures.
    pub fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let id = KeyHasher::hash(key);
        if !self.is_live(key, &id)? {
            return Ok(None);
        }

        match self.blobs.read(&id)? {
            Some(data) => {
                debug!(key = key, size = data.len(), "Cache HIT");
                Ok(Some(data))
            }
            None => {
                debug!(key = key, id = %id, "Cache MISS (blob missing)");
                Ok(None)
            }
        }
    }

    /// Whether `load(key)` would currently hit, without reading the payload
    pub fn contains(&self, key: &str) -> Result<bool> {
        let id = KeyHasher::hash(key);
        Ok(self.is_live(key, &id)? && self.blobs.exists(&id))
    }

    /// Delete a single key; returns whether a row or blob existed
    pub fn remove(&self, key: &str) -> Result<bool> {
        let id = KeyHasher::hash(key);
        let _guard = self.blobs.lock(&id);

        let rows = self.index.remove(std::slice::from_ref(&id))?;
        self.memo.invalidate(&id);
        let blob = self.blobs.delete_locked(&id)?;

        debug!(key = key, "Removed cache entry");
        Ok(rows > 0 || blob)
    }

    /// Purge every entry whose TTL has elapsed
    ///
    /// Both the blob and the index row are removed. Blob deletion is
    /// best-effort: a failure is logged, the row is kept for the next sweep
    /// and the sweep carries on. Entries saved again after the listing are
    /// left alone. Returns the number of entries purged.
    pub fn delete_expired(&self) -> Result<usize> {
        let now = SystemTime::now();
        let expired = self.index.list_expired(now)?;
        if expired.is_empty() {
            return Ok(0);
        }

        let mut purged = Vec::with_capacity(expired.len());
        for entry in expired {
            let _guard = self.blobs.lock(&entry.id);

            // A save holds this lock across its row and blob writes
            match self.index.lookup(&entry.id)? {
                Some(current) if current.is_expired_at(now) => {}
                _ => continue,
            }

            match self.blobs.delete_locked(&entry.id) {
                Ok(_) => purged.push(entry.id),
                Err(e) => warn!(id = %entry.id, error = %e, "Failed to delete expired blob"),
            }
        }

        let removed = self.index.remove_expired(&purged, now)?;
        for id in &purged {
            self.memo.invalidate(id);
        }

        info!(purged = removed, "Swept expired cache entries");
        Ok(removed)
    }

    /// Drop every entry: all index rows, then every file in the blob directory
    pub fn delete_all(&self) -> Result<()> {
        let rows = self.index.clear()?;
        self.memo.clear();
        let blobs = self.blobs.clear()?;

        info!(rows = rows, blobs = blobs, "Cleared cache");
        Ok(())
    }

    /// Number of index rows, expired ones included
    pub fn entry_count(&self) -> Result<usize> {
        self.index.len()
    }

    /// On-disk location of the blob `key` maps to
    pub fn blob_path(&self, key: &str) -> PathBuf {
        self.blobs.path_for(&KeyHasher::hash(key))
    }

    /// Expiry memo statistics
    pub fn stats(&self) -> CacheStats {
        self.memo.stats()
    }

    /// Log current cache metrics
    pub fn log_metrics(&self) {
        let stats = self.stats();
        debug!(
            hits = stats.hits,
            misses = stats.misses,
            hit_rate = format!("{:.1}%", stats.hit_rate),
            memo_entries = stats.entries,
            "Cache metrics"
        );
    }

    /// Whether the index holds an unexpired row for `id`
    fn is_live(&self, key: &str, id: &str) -> Result<bool> {
        let expire_at = match self.memo.get(id) {
            Some(expire_at) => expire_at,
            None => match self.index.lookup(id)? {
                Some(entry) => {
                    self.memo.fill(id, entry.expire_at);
                    entry.expire_at
                }
                None => {
                    debug!(key = key, "Cache MISS");
                    return Ok(false);
                }
            },
        };

        if expire_at <= SystemTime::now() {
            debug!(key = key, "Cache MISS (expired)");
            return Ok(false);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::index::{IndexEntry, MemoryIndex};
    use std::fs;
    use std::sync::atomic::Ordering;
    use std::sync::{mpsc, Arc, Mutex};
    use std::thread;

    /// Index that parks the first call to `method`, right after it has
    /// read the inner index, until the test resumes it
    struct GatedIndex {
        inner: MemoryIndex,
        method: &'static str,
        gate: Mutex<Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>>,
    }

    impl GatedIndex {
        /// Returns the index, a receiver signalled when the call is parked,
        /// and a sender that lets it continue
        fn new(method: &'static str) -> (Self, mpsc::Receiver<()>, mpsc::Sender<()>) {
            let (entered_tx, entered_rx) = mpsc::channel();
            let (resume_tx, resume_rx) = mpsc::channel();
            let index = Self {
                inner: MemoryIndex::new(),
                method,
                gate: Mutex::new(Some((entered_tx, resume_rx))),
            };
            (index, entered_rx, resume_tx)
        }

        fn park(&self, method: &str) {
            if method != self.method {
                return;
            }
            let gate = self.gate.lock().unwrap().take();
            if let Some((entered, resume)) = gate {
                entered.send(()).unwrap();
                resume.recv().unwrap();
            }
        }
    }

    impl MetadataIndex for GatedIndex {
        fn upsert(&self, id: &str, expire_at: SystemTime) -> Result<()> {
            self.inner.upsert(id, expire_at)
        }

        fn lookup(&self, id: &str) -> Result<Option<IndexEntry>> {
            let entry = self.inner.lookup(id);
            self.park("lookup");
            entry
        }

        fn list_expired(&self, now: SystemTime) -> Result<Vec<IndexEntry>> {
            let expired = self.inner.list_expired(now);
            self.park("list_expired");
            expired
        }

        fn remove(&self, ids: &[String]) -> Result<usize> {
            self.inner.remove(ids)
        }

        fn remove_expired(&self, ids: &[String], now: SystemTime) -> Result<usize> {
            self.inner.remove_expired(ids, now)
        }

        fn clear(&self) -> Result<usize> {
            self.inner.clear()
        }

        fn len(&self) -> Result<usize> {
            self.inner.len()
        }
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    #[test]
    fn test_save_load_scenario() -> anyhow::Result<()> {
        init_tracing();
        let dir = tempfile::tempdir()?;
        let store = CacheStore::open(dir.path())?;

        store.delete_expired()?;
        store.save("hoge", b"Hello World", Duration::from_secs(10))?;
        store.save("huga", b"This should expire soon", Duration::ZERO)?;

        assert_eq!(store.load("hoge")?.as_deref(), Some(&b"Hello World"[..]));
        assert!(store.load("huga")?.is_none());
        assert!(store.load("piyo")?.is_none());
        Ok(())
    }

    #[test]
    fn test_layout_on_disk() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CacheStore::open(dir.path())?;
        store.save("hoge", b"Hello World", Duration::from_secs(10))?;

        assert!(dir.path().join("CacheStore.db").is_file());
        let blob = dir.path().join("Cache").join(KeyHasher::hash("hoge"));
        assert_eq!(store.blob_path("hoge"), blob);
        assert_eq!(fs::read(blob)?, b"Hello World");
        Ok(())
    }

    #[test]
    fn test_survives_reopen() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;

        let first_path = {
            let store = CacheStore::open(dir.path())?;
            store.save("persisted", b"payload", Duration::from_secs(60))?;
            store.blob_path("persisted")
        };

        let store = CacheStore::open(dir.path())?;
        assert_eq!(store.blob_path("persisted"), first_path);
        assert_eq!(store.load("persisted")?.as_deref(), Some(&b"payload"[..]));
        Ok(())
    }

    #[test]
    fn test_overwrite_replaces_payload_and_ttl() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CacheStore::open(dir.path())?;

        store.save("k", b"old", Duration::from_secs(60))?;
        store.save("k", b"new", Duration::from_secs(60))?;
        assert_eq!(store.load("k")?.as_deref(), Some(&b"new"[..]));

        store.save("k", b"gone", Duration::ZERO)?;
        assert!(store.load("k")?.is_none());
        assert_eq!(store.entry_count()?, 1);
        Ok(())
    }

    #[test]
    fn test_orphan_row_is_a_miss() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CacheStore::open(dir.path())?;

        store.save("orphan", b"data", Duration::from_secs(60))?;
        fs::remove_file(store.blob_path("orphan"))?;

        assert!(store.load("orphan")?.is_none());
        assert!(!store.contains("orphan")?);
        Ok(())
    }

    #[test]
    fn test_delete_expired_purges_only_expired() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CacheStore::open(dir.path())?;

        store.save("stale-1", b"a", Duration::ZERO)?;
        store.save("stale-2", b"b", Duration::ZERO)?;
        store.save("fresh", b"c", Duration::from_secs(60))?;

        assert_eq!(store.delete_expired()?, 2);

        assert!(!store.blob_path("stale-1").exists());
        assert!(!store.blob_path("stale-2").exists());
        assert!(store.load("stale-1")?.is_none());
        assert_eq!(store.load("fresh")?.as_deref(), Some(&b"c"[..]));
        assert_eq!(store.entry_count()?, 1);

        // Nothing left to sweep
        assert_eq!(store.delete_expired()?, 0);
        Ok(())
    }

    #[test]
    fn test_delete_all_misses_even_with_leftover_blob() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CacheStore::open(dir.path())?;

        store.save("a", b"1", Duration::from_secs(60))?;
        store.save("b", b"2", Duration::from_secs(60))?;
        store.delete_all()?;

        assert!(store.load("a")?.is_none());
        assert!(store.load("b")?.is_none());
        assert!(!store.blob_path("a").exists());
        assert_eq!(store.entry_count()?, 0);

        // A blob resurrected behind the store's back stays invisible
        fs::write(store.blob_path("a"), b"1")?;
        assert!(store.load("a")?.is_none());
        Ok(())
    }

    #[test]
    fn test_remove_single_key() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CacheStore::open(dir.path())?;

        store.save("a", b"1", Duration::from_secs(60))?;
        store.save("b", b"2", Duration::from_secs(60))?;

        assert!(store.remove("a")?);
        assert!(!store.remove("a")?);
        assert!(store.load("a")?.is_none());
        assert!(store.contains("b")?);
        Ok(())
    }

    #[test]
    fn test_memory_index_without_memo() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = CacheConfig::new(dir.path()).with_memo_capacity(0);
        let store = CacheStore::with_index(MemoryIndex::new(), &config)?;

        store.save("hoge", b"Hello World", Duration::from_secs(10))?;
        assert_eq!(store.load("hoge")?.as_deref(), Some(&b"Hello World"[..]));
        assert!(!dir.path().join("CacheStore.db").exists());
        assert_eq!(store.stats().hits, 0);
        Ok(())
    }

    #[test]
    fn test_memo_serves_repeat_loads() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CacheStore::open(dir.path())?;

        store.save("hot", b"x", Duration::from_secs(60))?;
        for _ in 0..3 {
            assert!(store.load("hot")?.is_some());
        }

        let stats = store.stats();
        assert_eq!(stats.hits, 3);
        store.log_metrics();
        Ok(())
    }

    #[test]
    fn test_huge_ttl_is_clamped() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CacheStore::open(dir.path())?;

        // Debug level so the save log line (with its TTL field) is built
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            store.save("forever", b"x", Duration::MAX)
        })?;

        assert!(store.load("forever")?.is_some());
        Ok(())
    }

    #[test]
    fn test_concurrent_save_and_load() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(CacheStore::open(dir.path())?);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || -> crate::Result<()> {
                    let key = format!("key-{}", i % 4);
                    let payload = key.as_bytes().to_vec();
                    for _ in 0..10 {
                        store.save(&key, &payload, Duration::from_secs(60))?;
                        if let Some(data) = store.load(&key)? {
                            assert_eq!(data, payload);
                        }
                    }
                    Ok(())
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap()?;
        }
        assert_eq!(store.entry_count()?, 4);
        Ok(())
    }

    #[test]
    fn test_read_racing_a_save_keeps_the_newer_expiry() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (index, entered, resume) = GatedIndex::new("lookup");
        index.upsert(
            &KeyHasher::hash("k"),
            SystemTime::now() + Duration::from_secs(600),
        )?;
        let store = Arc::new(CacheStore::with_index(index, &CacheConfig::new(dir.path()))?);
        fs::write(store.blob_path("k"), b"old")?;

        // Loader reads the long expiry, then stalls before caching it
        let loader = {
            let store = Arc::clone(&store);
            thread::spawn(move || store.load("k"))
        };
        entered.recv()?;
        store.save("k", b"new", Duration::ZERO)?;
        resume.send(())?;
        loader.join().unwrap()?;

        assert!(store.load("k")?.is_none());
        assert!(!store.contains("k")?);
        Ok(())
    }

    #[test]
    fn test_failed_blob_write_drops_previous_payload() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CacheStore::open(dir.path())?;

        store.save("k", b"expired-payload", Duration::ZERO)?;

        store.blobs.fail_writes.store(true, Ordering::Relaxed);
        assert!(store.save("k", b"fresh", Duration::from_secs(600)).is_err());
        store.blobs.fail_writes.store(false, Ordering::Relaxed);

        assert!(store.load("k")?.is_none());
        assert!(!store.blob_path("k").exists());

        store.save("k", b"fresh", Duration::from_secs(600))?;
        assert_eq!(store.load("k")?.as_deref(), Some(&b"fresh"[..]));
        Ok(())
    }

    #[test]
    fn test_sweep_continues_past_undeletable_blob() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CacheStore::open(dir.path())?;

        store.save("stuck", b"a", Duration::ZERO)?;
        store.save("stale", b"b", Duration::ZERO)?;
        store.save("fresh", b"c", Duration::from_secs(60))?;

        // A non-empty directory where the blob file should be
        let stuck = store.blob_path("stuck");
        fs::remove_file(&stuck)?;
        fs::create_dir(&stuck)?;
        fs::write(stuck.join("pinned"), b"x")?;

        assert_eq!(store.delete_expired()?, 1);
        assert!(!store.blob_path("stale").exists());
        assert_eq!(store.entry_count()?, 2);
        assert!(store.load("stuck")?.is_none());
        assert_eq!(store.load("fresh")?.as_deref(), Some(&b"c"[..]));

        // Row was kept, so the next sweep finishes the job
        fs::remove_dir_all(&stuck)?;
        assert_eq!(store.delete_expired()?, 1);
        assert_eq!(store.entry_count()?, 1);
        Ok(())
    }

    #[test]
    fn test_sweep_spares_entry_saved_after_listing() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (index, entered, resume) = GatedIndex::new("list_expired");
        let store = Arc::new(CacheStore::with_index(index, &CacheConfig::new(dir.path()))?);

        store.save("k", b"stale", Duration::ZERO)?;

        let sweeper = {
            let store = Arc::clone(&store);
            thread::spawn(move || store.delete_expired())
        };
        entered.recv()?;
        store.save("k", b"fresh", Duration::from_secs(600))?;
        resume.send(())?;

        assert_eq!(sweeper.join().unwrap()?, 0);
        assert_eq!(store.load("k")?.as_deref(), Some(&b"fresh"[..]));
        assert_eq!(store.entry_count()?, 1);
        Ok(())
    }
}
