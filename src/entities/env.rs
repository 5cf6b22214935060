//! Execution environment shared by a filter graph, plus per-thread views of it.
//!
//! Clips may keep thread-affine state (decoder contexts, scratch buffers), so
//! every pool worker gets its own `ThreadEnv` specialized from the shared
//! `Environment`. The consumer uses `ThreadEnv::main()`.
//!
//! The environment also keeps a registry of live prefetchers. A prefetcher
//! registers itself on construction and detaches on drop, before it waits for
//! its in-flight jobs.

use log::{debug, trace};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Shared graph-wide environment
#[derive(Debug, Default)]
pub struct Environment {
    /// Live prefetchers: id -> display name
    prefetchers: Mutex<HashMap<Uuid, String>>,
}

impl Environment {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a prefetcher and return its id
    pub fn register_prefetcher(&self, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        let mut prefetchers = self.prefetchers.lock().unwrap_or_else(|e| e.into_inner());
        prefetchers.insert(id, name.to_string());
        debug!("Prefetcher registered: {} ({}), {} live", name, id, prefetchers.len());
        id
    }

    /// Remove a prefetcher from the registry
    ///
    /// Returns false if the id was unknown (already detached).
    pub fn detach_prefetcher(&self, id: Uuid) -> bool {
        let mut prefetchers = self.prefetchers.lock().unwrap_or_else(|e| e.into_inner());
        match prefetchers.remove(&id) {
            Some(name) => {
                debug!("Prefetcher detached: {} ({}), {} live", name, id, prefetchers.len());
                true
            }
            None => false,
        }
    }

    pub fn prefetcher_count(&self) -> usize {
        self.prefetchers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_registered(&self, id: Uuid) -> bool {
        self.prefetchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&id)
    }

    /// Execution context for pool worker `worker_index`
    pub fn specialize(self: &Arc<Self>, worker_index: usize) -> ThreadEnv {
        ThreadEnv::specialize(self, worker_index)
    }
}

/// Per-thread execution context handed to `Clip::get_frame`
#[derive(Debug, Clone)]
pub struct ThreadEnv {
    env: Arc<Environment>,
    worker_index: Option<usize>,
}

impl ThreadEnv {
    /// Context for the consumer thread
    pub fn main(env: &Arc<Environment>) -> Self {
        Self {
            env: Arc::clone(env),
            worker_index: None,
        }
    }

    /// Context for pool worker `worker_index`
    pub fn specialize(env: &Arc<Environment>, worker_index: usize) -> Self {
        trace!("Specialized environment for worker {}", worker_index);
        Self {
            env: Arc::clone(env),
            worker_index: Some(worker_index),
        }
    }

    /// `None` on the consumer thread
    pub fn worker_index(&self) -> Option<usize> {
        self.worker_index
    }

    pub fn is_worker(&self) -> bool {
        self.worker_index.is_some()
    }

    pub fn environment(&self) -> &Arc<Environment> {
        &self.env
    }
}
