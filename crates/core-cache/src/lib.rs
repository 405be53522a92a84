//! Strand Core Cache: sharded key/value store with per-entry expiry
//!
//! Keys are routed to one of N shards by a fixed hash of the key. Every shard
//! has its own read-write lock, so operations on keys living in different
//! shards never wait on each other.
//!
//! Expiry is enforced twice:
//! - lazily, on every read (an expired entry is reported absent and removed)
//! - eagerly, by a periodic sweep that bounds memory held by entries nobody reads
//!
//! # Example
//!
//! ```
//! use strand_core_cache::ShardStore;
//! use std::time::Duration;
//!
//! let store: ShardStore<String, u32> = ShardStore::new(16).unwrap();
//! store.set("answer".to_string(), 42, Duration::from_secs(60));
//! assert_eq!(store.get("answer"), Some(42));
//! ```

pub mod store;
pub mod sweeper;

pub use store::{CacheError, CacheStats, ShardStore};
pub use sweeper::spawn_sweeper;
