//! framefetch - pull-based frame server with look-ahead prefetching
//!
//! Re-exports all modules for use by binary targets.

// Core engine (cache, pool, pattern detector, prefetcher)
pub mod core;

// Frames, clips, execution environment
pub mod entities;

pub mod cli;
pub mod config;

pub use crate::config::PrefetchConfig;
pub use crate::core::lru_cache::{CacheHandle, CacheStats, LookupResult, LruCache, Reservation};
pub use crate::core::prefetcher::Prefetcher;
pub use crate::entities::{Clip, ClipError, Environment, Frame, ThreadEnv, VideoInfo};
