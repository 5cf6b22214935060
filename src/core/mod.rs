//! Core engine modules - object pool, cache, workers, prefetcher
//!
//! Generic over frame content; the prefetcher ties them together.

pub mod lru_cache;
pub mod object_pool;
pub mod pattern;
pub mod prefetcher;
pub mod workers;

pub use lru_cache::{CacheStats, CacheStatsSnapshot, LookupResult, LruCache};
pub use object_pool::ObjectPool;
pub use pattern::{PatternSnapshot, PatternState};
pub use prefetcher::Prefetcher;
pub use workers::ThreadPool;
