//! Free-list pool for small per-request records
//!
//! The prefetcher builds one job record per scheduled frame. Recycled boxed
//! records travel through the worker queue by value, so once the pool has
//! warmed up, scheduling a job allocates neither the record nor the queue
//! message. One mutex guards the free list; every operation is O(1).

use log::trace;
use std::sync::Mutex;

#[derive(Debug)]
struct PoolState<T> {
    free: Vec<Box<T>>,
    allocated: usize,
}

/// Thread-safe free list of default-initialized `T`
#[derive(Debug)]
pub struct ObjectPool<T: Default> {
    state: Mutex<PoolState<T>>,
}

impl<T: Default> ObjectPool<T> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create a pool with `prealloc` records ready on the free list
    pub fn with_capacity(prealloc: usize) -> Self {
        let free = (0..prealloc).map(|_| Box::new(T::default())).collect();
        Self {
            state: Mutex::new(PoolState {
                free,
                allocated: prealloc,
            }),
        }
    }

    /// Take a default-initialized record, growing the pool if the free list is empty
    pub fn construct(&self) -> Box<T> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.free.pop() {
            Some(record) => record,
            None => {
                state.allocated += 1;
                trace!("ObjectPool grew to {} records", state.allocated);
                Box::new(T::default())
            }
        }
    }

    /// Reset a record and return it to the free list
    pub fn destruct(&self, mut record: Box<T>) {
        // Reset outside the lock: dropping fields may release shared state
        *record = T::default();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.free.push(record);
    }

    /// Records ever allocated by this pool
    pub fn allocated(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).allocated
    }

    /// Records currently on the free list
    pub fn available(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).free.len()
    }
}

impl<T: Default> Default for ObjectPool<T> {
    fn default() -> Self {
        Self::new()
    }
}
