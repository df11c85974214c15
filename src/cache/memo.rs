//! Expiry memo
//!
//! In-memory cache of identifier -> expiry in front of the metadata index,
//! so repeated loads of hot keys skip the database. Only rows that exist
//! are memoized; the store keeps it coherent on every index write.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use moka::sync::Cache;
use tracing::{debug, trace};

/// Hit/miss counters for the expiry memo
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Hit rate in percent
    pub hit_rate: f64,
    /// Entries currently memoized
    pub entries: u64,
}

pub(crate) struct ExpiryMemo {
    /// `None` when disabled by configuration
    expiries: Option<Cache<String, SystemTime>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ExpiryMemo {
    pub(crate) fn new(capacity: u64) -> Self {
        let expiries = (capacity > 0).then(|| {
            Cache::builder()
                .max_capacity(capacity)
                .name("expiry_memo")
                .build()
        });

        Self {
            expiries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub(crate) fn get(&self, id: &str) -> Option<SystemTime> {
        let expiries = self.expiries.as_ref()?;
        match expiries.get(id) {
            Some(expire_at) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(id = id, "Memo HIT");
                Some(expire_at)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                trace!(id = id, "Memo MISS");
                None
            }
        }
    }

    pub(crate) fn insert(&self, id: &str, expire_at: SystemTime) {
        if let Some(expiries) = &self.expiries {
            expiries.insert(id.to_string(), expire_at);
        }
    }

    /// Record an expiry read from the index, unless a write already did.
    /// Writers use [`insert`](Self::insert); a read must never replace theirs.
    pub(crate) fn fill(&self, id: &str, expire_at: SystemTime) {
        if let Some(expiries) = &self.expiries {
            expiries.entry(id.to_string()).or_insert(expire_at);
        }
    }

    pub(crate) fn invalidate(&self, id: &str) {
        if let Some(expiries) = &self.expiries {
            expiries.invalidate(id);
        }
    }

    pub(crate) fn clear(&self) {
        if let Some(expiries) = &self.expiries {
            expiries.invalidate_all();
        }
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        debug!("Cleared expiry memo");
    }

    pub(crate) fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        CacheStats {
            hits,
            misses,
            hit_rate,
            entries: self.expiries.as_ref().map_or(0, |c| c.entry_count()),
        }
    }
}
