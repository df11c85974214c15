//! netcache - persistent, expiration-aware key-value byte cache
//!
//! Stores opaque payloads under string keys with a time-to-live, in a local
//! directory that survives process restarts:
//!
//! - `<root>/CacheStore.db` holds the identifier -> expiry index (SQLite)
//! - `<root>/Cache/<identifier>` holds each payload as raw bytes
//!
//! Keys are hashed into filesystem-safe identifiers; the hash is for
//! addressing only and offers no protection against deliberate collisions.
//!
//! ```no_run
//! use std::time::Duration;
//! use netcache::CacheStore;
//!
//! # fn main() -> netcache::Result<()> {
//! let store = CacheStore::open("/tmp/my-app-cache")?;
//! store.save("https://example.com/feed", b"{}", Duration::from_secs(300))?;
//! if let Some(body) = store.load("https://example.com/feed")? {
//!     assert_eq!(body, b"{}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;

pub use cache::{
    BlobStore, CacheStats, CacheStore, IndexEntry, KeyHasher, MemoryIndex, MetadataIndex,
    SharedCacheStore, SqliteIndex,
};
pub use config::CacheConfig;
pub use error::{CacheError, Result};
