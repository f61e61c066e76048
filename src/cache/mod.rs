//! In-process caches with TTL expiry and LRU eviction.

pub mod bounded;

pub use bounded::BoundedCache;
