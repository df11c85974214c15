//! Disk-backed cache layer
//!
//! A durable metadata index (identifier -> expiry) plus a directory of blobs,
//! coordinated by [`CacheStore`].

pub mod blob;
pub mod hasher;
pub mod index;
mod memo;
pub mod shared;
pub mod store;

pub use blob::BlobStore;
pub use hasher::KeyHasher;
pub use index::{IndexEntry, MemoryIndex, MetadataIndex, SqliteIndex};
pub use memo::CacheStats;
pub use shared::SharedCacheStore;
pub use store::CacheStore;
