//! Prefetcher configuration
//!
//! Priority (lowest to highest): defaults -> JSON file -> FRAMEFETCH_THREADS -> CLI.

use anyhow::{Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable overriding the worker thread count
pub const THREADS_ENV: &str = "FRAMEFETCH_THREADS";

/// Upper bound for `threads`
pub const MAX_THREADS: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Worker threads in the prefetch pool
    pub threads: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            threads: num_cpus::get_physical().max(1),
        }
    }
}

impl PrefetchConfig {
    /// Frames the prefetcher keeps in flight ahead of the consumer
    pub fn prefetch_window(&self) -> usize {
        self.normalized().threads * 2
    }

    pub fn cache_capacity(&self) -> usize {
        self.prefetch_window() * 2
    }

    /// Copy with `threads` clamped to `1..=MAX_THREADS`
    pub fn normalized(&self) -> Self {
        Self {
            threads: self.threads.clamp(1, MAX_THREADS),
        }
    }

    /// Load from a JSON file; missing fields keep their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        debug!("Loaded config from {}: {:?}", path.display(), config);
        Ok(config)
    }

    /// Write as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, text)
            .with_context(|| format!("Failed to write config {}", path.display()))?;
        Ok(())
    }

    /// Apply overrides from `lookup` (usually `std::env::var`).
    ///
    /// Unparseable values are logged and ignored.
    pub fn apply_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(THREADS_ENV) {
            match raw.trim().parse::<usize>() {
                Ok(threads) => {
                    debug!("{} override: threads={}", THREADS_ENV, threads);
                    self.threads = threads;
                }
                Err(e) => warn!("Ignoring {}={:?}: {}", THREADS_ENV, raw, e),
            }
        }
        self
    }

    /// Apply overrides from the process environment
    pub fn apply_process_env(self) -> Self {
        self.apply_env(|key| std::env::var(key).ok())
    }
}
