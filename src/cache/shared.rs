//! Async facade over [`CacheStore`]
//!
//! Every call runs on tokio's blocking pool so SQLite and file I/O never
//! stall the async workers. Clones share one underlying store.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::index::{MetadataIndex, SqliteIndex};
use crate::cache::memo::CacheStats;
use crate::cache::store::CacheStore;
use crate::error::Result;

/// Cloneable, awaitable handle to a [`CacheStore`]
pub struct SharedCacheStore<I: MetadataIndex = SqliteIndex> {
    inner: Arc<CacheStore<I>>,
}

impl<I: MetadataIndex> Clone for SharedCacheStore<I> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<I: MetadataIndex + 'static> From<CacheStore<I>> for SharedCacheStore<I> {
    fn from(store: CacheStore<I>) -> Self {
        Self::new(store)
    }
}

impl<I: MetadataIndex + 'static> SharedCacheStore<I> {
    pub fn new(store: CacheStore<I>) -> Self {
        Self {
            inner: Arc::new(store),
        }
    }

    /// Borrow the synchronous store
    pub fn store(&self) -> &CacheStore<I> {
        &self.inner
    }

    /// See [`CacheStore::init`]
    pub async fn init(&self) -> Result<()> {
        self.run(|store| store.init()).await
    }

    /// See [`CacheStore::save`]
    pub async fn save(
        &self,
        key: impl Into<String>,
        data: impl Into<Vec<u8>>,
        ttl: Duration,
    ) -> Result<()> {
        let key = key.into();
        let data = data.into();
        self.run(move |store| store.save(&key, &data, ttl)).await
    }

    /// See [`CacheStore::load`]
    pub async fn load(&self, key: impl Into<String>) -> Result<Option<Vec<u8>>> {
        let key = key.into();
        self.run(move |store| store.load(&key)).await
    }

    /// See [`CacheStore::contains`]
    pub async fn contains(&self, key: impl Into<String>) -> Result<bool> {
        let key = key.into();
        self.run(move |store| store.contains(&key)).await
    }

    /// See [`CacheStore::remove`]
    pub async fn remove(&self, key: impl Into<String>) -> Result<bool> {
        let key = key.into();
        self.run(move |store| store.remove(&key)).await
    }

    /// See [`CacheStore::delete_expired`]
    pub async fn delete_expired(&self) -> Result<usize> {
        self.run(|store| store.delete_expired()).await
    }

    /// See [`CacheStore::delete_all`]
    pub async fn delete_all(&self) -> Result<()> {
        self.run(|store| store.delete_all()).await
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.stats()
    }

    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&CacheStore<I>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || op(&store)).await?
    }
}
