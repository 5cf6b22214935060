//! Concurrent LRU cache with a reservation protocol
//!
//! Every key moves through `absent -> Pending -> Ready`, or back to absent on
//! rollback:
//! - `lookup(key, true)` on a missing key atomically inserts a `Pending` slot
//!   and hands the caller a [`Reservation`]. The holder is the only producer
//!   for that key until it calls [`LruCache::commit_value`] or
//!   [`LruCache::rollback`] (dropping the reservation rolls back).
//! - Readers of a `Pending` slot get `FoundButNotAvailable` and never see a
//!   payload. Lookups don't block.
//! - `Ready` slots are returned together with a [`CacheHandle`] that pins the
//!   slot against eviction until dropped.
//!
//! Eviction removes the least recently used slot that is `Ready` and unpinned.
//! If every slot is pinned or pending, the insert still succeeds and the cache
//! runs over capacity until a later insert or commit can trim it.
//!
//! Ordering comes from the `lru` crate; a single mutex guards the map and each
//! call holds it for O(1) work (eviction scans only past pinned slots).

use log::{debug, error, trace, warn};
use lru::LruCache as LruOrder;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Cache statistics for monitoring performance
///
/// Hits and misses count `lookup` calls; `lookup_uncounted` calls are left out.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    rollbacks: AtomicU64,
}

impl CacheStats {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.rollbacks.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub rollbacks: u64,
    pub size: usize,
}

impl CacheStatsSnapshot {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 { 0.0 } else { self.hits as f64 / total as f64 }
    }
}

enum SlotState<V> {
    Pending,
    Ready(V),
}

struct Slot<V> {
    state: SlotState<V>,
    /// Live `CacheHandle`s on this slot
    pins: usize,
    /// Distinguishes successive reservations of the same key
    generation: u64,
}

impl<V> Slot<V> {
    fn is_evictable(&self) -> bool {
        self.pins == 0 && matches!(self.state, SlotState::Ready(_))
    }

    fn is_pending(&self) -> bool {
        matches!(self.state, SlotState::Pending)
    }
}

struct Inner<K: Hash + Eq, V> {
    slots: LruOrder<K, Slot<V>>,
    next_generation: u64,
}

struct Shared<K: Hash + Eq, V> {
    inner: Mutex<Inner<K, V>>,
    /// Signalled whenever a pending slot resolves (commit or rollback)
    resolved: Condvar,
    capacity: usize,
    stats: CacheStats,
}

impl<K: Hash + Eq + Clone + fmt::Debug, V> Shared<K, V> {
    fn lock(&self) -> MutexGuard<'_, Inner<K, V>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Evict LRU victims until `len <= limit` or nothing is evictable
    fn trim_to(&self, inner: &mut Inner<K, V>, limit: usize) {
        while inner.slots.len() > limit {
            // iter() runs MRU -> LRU, so rev() visits the oldest slot first
            let victim = inner
                .slots
                .iter()
                .rev()
                .find(|(_, slot)| slot.is_evictable())
                .map(|(key, _)| key.clone());

            match victim {
                Some(key) => {
                    inner.slots.pop(&key);
                    self.stats.record_eviction();
                    trace!("LRU evicted: {:?}", key);
                }
                None => {
                    debug!(
                        "Cache over capacity: {} slots, {} allowed, all pinned or pending",
                        inner.slots.len(),
                        self.capacity
                    );
                    break;
                }
            }
        }
    }

    /// Remove a pending slot if it still belongs to `generation`
    fn rollback_slot(&self, key: &K, generation: u64) {
        {
            let mut inner = self.lock();
            let owned = inner
                .slots
                .peek(key)
                .map(|slot| slot.generation == generation && slot.is_pending())
                .unwrap_or(false);
            if owned {
                inner.slots.pop(key);
                self.stats.record_rollback();
                trace!("Rolled back reservation: {:?}", key);
            } else {
                error!("Rollback of {:?} without a matching pending slot", key);
                debug_assert!(false, "rollback without a matching pending slot");
            }
        }
        self.resolved.notify_all();
    }

    fn unpin(&self, key: &K, generation: u64) {
        let mut inner = self.lock();
        if let Some(slot) = inner.slots.peek_mut(key) {
            if slot.generation == generation {
                slot.pins = slot.pins.saturating_sub(1);
            }
        }
    }
}

/// Result of [`LruCache::lookup`]
pub enum LookupResult<K: Hash + Eq + Clone + fmt::Debug, V> {
    /// No entry. Carries a fresh reservation when creation was allowed.
    NotFound(Option<Reservation<K, V>>),
    /// Entry is populated; the handle pins it while held.
    FoundAndReady(CacheHandle<K, V>, V),
    /// Entry is being produced by another caller.
    FoundButNotAvailable,
    /// Capacity is zero; compute without the cache.
    NoCacheConfigured,
}

impl<K: Hash + Eq + Clone + fmt::Debug, V> fmt::Debug for LookupResult<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LookupResult::NotFound(Some(r)) => write!(f, "NotFound(reserved {:?})", r.key),
            LookupResult::NotFound(None) => write!(f, "NotFound"),
            LookupResult::FoundAndReady(h, _) => write!(f, "FoundAndReady({:?})", h.key),
            LookupResult::FoundButNotAvailable => write!(f, "FoundButNotAvailable"),
            LookupResult::NoCacheConfigured => write!(f, "NoCacheConfigured"),
        }
    }
}

/// Exclusive right and obligation to produce one key
///
/// Resolve with [`LruCache::commit_value`] or [`LruCache::rollback`].
/// Dropping an unresolved reservation rolls it back.
pub struct Reservation<K: Hash + Eq + Clone + fmt::Debug, V> {
    shared: Arc<Shared<K, V>>,
    key: K,
    generation: u64,
    resolved: bool,
}

impl<K: Hash + Eq + Clone + fmt::Debug, V> Reservation<K, V> {
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Hash + Eq + Clone + fmt::Debug, V> Drop for Reservation<K, V> {
    fn drop(&mut self) {
        if !self.resolved {
            warn!("Reservation for {:?} dropped unresolved, rolling back", self.key);
            self.shared.rollback_slot(&self.key, self.generation);
        }
    }
}

/// Pin on a `Ready` slot; released on drop
pub struct CacheHandle<K: Hash + Eq + Clone + fmt::Debug, V> {
    shared: Arc<Shared<K, V>>,
    key: K,
    generation: u64,
}

impl<K: Hash + Eq + Clone + fmt::Debug, V> CacheHandle<K, V> {
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Hash + Eq + Clone + fmt::Debug, V> Drop for CacheHandle<K, V> {
    fn drop(&mut self) {
        self.shared.unpin(&self.key, self.generation);
    }
}

/// Thread-safe, capacity-bounded cache of `K -> V`
///
/// Clones share the same storage.
pub struct LruCache<K: Hash + Eq + Clone + fmt::Debug, V> {
    shared: Arc<Shared<K, V>>,
}

impl<K: Hash + Eq + Clone + fmt::Debug, V: Clone> LruCache<K, V> {
    /// Create a cache holding up to `capacity` entries (0 disables caching)
    pub fn new(capacity: usize) -> Self {
        debug!("LruCache created: capacity={}", capacity);
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    slots: LruOrder::unbounded(),
                    next_generation: 0,
                }),
                resolved: Condvar::new(),
                capacity,
                stats: CacheStats::default(),
            }),
        }
    }

    /// Look up `key`, optionally reserving it when absent.
    ///
    /// Never blocks on another producer: a pending slot yields
    /// `FoundButNotAvailable`. A hit promotes the slot to most recently used.
    /// Hits and misses count toward [`stats`](Self::stats).
    pub fn lookup(&self, key: &K, allow_create_if_missing: bool) -> LookupResult<K, V> {
        self.lookup_impl(key, allow_create_if_missing, true)
    }

    /// Same as [`lookup`](Self::lookup) without touching the hit/miss counters.
    ///
    /// For internal lookups (prefetch scheduling) that aren't reads on behalf
    /// of a consumer.
    pub fn lookup_uncounted(&self, key: &K, allow_create_if_missing: bool) -> LookupResult<K, V> {
        self.lookup_impl(key, allow_create_if_missing, false)
    }

    fn lookup_impl(&self, key: &K, allow_create_if_missing: bool, counted: bool) -> LookupResult<K, V> {
        if self.shared.capacity == 0 {
            return LookupResult::NoCacheConfigured;
        }

        let mut inner = self.shared.lock();

        if let Some(slot) = inner.slots.get_mut(key) {
            return match &slot.state {
                SlotState::Ready(value) => {
                    slot.pins += 1;
                    let value = value.clone();
                    let handle = CacheHandle {
                        shared: Arc::clone(&self.shared),
                        key: key.clone(),
                        generation: slot.generation,
                    };
                    if counted {
                        self.shared.stats.record_hit();
                    }
                    LookupResult::FoundAndReady(handle, value)
                }
                SlotState::Pending => LookupResult::FoundButNotAvailable,
            };
        }

        if counted {
            self.shared.stats.record_miss();
        }
        if !allow_create_if_missing {
            return LookupResult::NotFound(None);
        }

        // Make room for the new slot before inserting it
        let limit = self.shared.capacity.saturating_sub(1);
        self.shared.trim_to(&mut inner, limit);

        let generation = inner.next_generation;
        inner.next_generation += 1;
        inner.slots.put(
            key.clone(),
            Slot {
                state: SlotState::Pending,
                pins: 0,
                generation,
            },
        );
        trace!("Reserved {:?} (generation {})", key, generation);

        LookupResult::NotFound(Some(Reservation {
            shared: Arc::clone(&self.shared),
            key: key.clone(),
            generation,
            resolved: false,
        }))
    }

    /// Publish `value` for a reserved key and return a pinning handle.
    ///
    /// The slot becomes visible to readers only once this returns; waiters in
    /// [`wait_while_pending`](Self::wait_while_pending) are woken.
    pub fn commit_value(&self, mut reservation: Reservation<K, V>, value: V) -> CacheHandle<K, V> {
        debug_assert!(
            Arc::ptr_eq(&self.shared, &reservation.shared),
            "reservation committed to a foreign cache"
        );
        reservation.resolved = true;
        let shared = Arc::clone(&reservation.shared);
        {
            let mut inner = shared.lock();
            match inner.slots.get_mut(&reservation.key) {
                Some(slot) if slot.generation == reservation.generation && slot.is_pending() => {
                    slot.state = SlotState::Ready(value);
                    slot.pins += 1;
                }
                _ => {
                    // Pending slots are never evicted, so only a broken
                    // at-most-one-producer invariant can land here
                    error!("Commit of {:?} without a matching pending slot", reservation.key);
                    debug_assert!(false, "commit without a matching pending slot");
                }
            }
            shared.trim_to(&mut inner, shared.capacity);
        }
        shared.resolved.notify_all();

        CacheHandle {
            shared,
            key: reservation.key.clone(),
            generation: reservation.generation,
        }
    }

    /// Discard a reservation; the key reads as absent again
    pub fn rollback(&self, mut reservation: Reservation<K, V>) {
        debug_assert!(
            Arc::ptr_eq(&self.shared, &reservation.shared),
            "reservation rolled back on a foreign cache"
        );
        reservation.resolved = true;
        reservation.shared.rollback_slot(&reservation.key, reservation.generation);
    }

    /// Block until `key` is no longer pending, or `timeout` elapses.
    ///
    /// Returns true if the key is resolved (ready or absent).
    pub fn wait_while_pending(&self, key: &K, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.shared.lock();
        loop {
            let pending = inner.slots.peek(key).map(|s| s.is_pending()).unwrap_or(false);
            if !pending {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .shared
                .resolved
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            inner = guard;
        }
    }

    /// True if `key` holds a published value (does not touch LRU order)
    pub fn contains_ready(&self, key: &K) -> bool {
        let inner = self.shared.lock();
        inner
            .slots
            .peek(key)
            .map(|s| matches!(s.state, SlotState::Ready(_)))
            .unwrap_or(false)
    }

    /// True if any handle currently pins `key`
    pub fn is_pinned(&self, key: &K) -> bool {
        let inner = self.shared.lock();
        inner.slots.peek(key).map(|s| s.pins > 0).unwrap_or(false)
    }

    /// Number of slots, pending ones included
    pub fn len(&self) -> usize {
        self.shared.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        let stats = &self.shared.stats;
        CacheStatsSnapshot {
            hits: stats.hits(),
            misses: stats.misses(),
            evictions: stats.evictions.load(Ordering::Relaxed),
            rollbacks: stats.rollbacks.load(Ordering::Relaxed),
            size: self.len(),
        }
    }

    pub fn reset_stats(&self) {
        self.shared.stats.reset();
    }
}

impl<K: Hash + Eq + Clone + fmt::Debug, V> Clone for LruCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K: Hash + Eq + Clone + fmt::Debug, V> fmt::Debug for LruCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruCache")
            .field("capacity", &self.shared.capacity)
            .field("len", &self.shared.lock().slots.len())
            .finish()
    }
}
