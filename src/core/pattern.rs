//! Access-pattern detector driving the prefetch stride
//!
//! Observes the difference between consecutive requested frame indices and
//! locks onto a stride once it repeats `PATTERN_LOCK_LENGTH` times in a row.
//!
//! - Unlocked: count consecutive repeats of the observed stride; lock on the
//!   third one.
//! - Locked, stride holds: both counters reset.
//! - Locked, stride breaks: every break is a miss. A competing stride that
//!   repeats `PATTERN_LOCK_LENGTH` times takes over the lock; otherwise
//!   `PATTERN_LOCK_LENGTH` misses drop the lock.
//!
//! A competing stride can only reach its third hit on a call that is also the
//! locked stride's third (or later) miss, so both limits can trip together.
//! The hand-off wins that tie.
//!
//! Single-writer: only the consumer thread touches it.

use log::debug;

/// Consecutive repeats needed to lock, switch, or unlock
pub const PATTERN_LOCK_LENGTH: u32 = 3;

/// Copy of the detector state for introspection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternSnapshot {
    pub last_requested_frame: i32,
    pub current_pattern: i32,
    pub locked_pattern: i32,
    pub pattern_hits: u32,
    pub pattern_misses: u32,
    pub is_locked: bool,
}

#[derive(Debug, Clone)]
pub struct PatternState {
    last_requested_frame: i32,
    current_pattern: i32,
    locked_pattern: i32,
    pattern_hits: u32,
    pattern_misses: u32,
    is_locked: bool,
}

impl Default for PatternState {
    fn default() -> Self {
        Self {
            last_requested_frame: 0,
            current_pattern: 1,
            locked_pattern: 1,
            pattern_hits: 0,
            pattern_misses: 0,
            is_locked: false,
        }
    }
}

impl PatternState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request for frame `n` and return the observed stride
    pub fn observe(&mut self, n: i32) -> i32 {
        let mut pattern = n.wrapping_sub(self.last_requested_frame);
        if pattern == 0 {
            pattern = 1;
        }
        self.last_requested_frame = n;

        if self.is_locked {
            self.observe_locked(pattern);
        } else {
            self.observe_unlocked(pattern);
        }
        pattern
    }

    fn track_candidate(&mut self, pattern: i32) {
        if pattern == self.current_pattern {
            self.pattern_hits += 1;
        } else {
            self.current_pattern = pattern;
            self.pattern_hits = 1;
        }
    }

    fn observe_unlocked(&mut self, pattern: i32) {
        self.track_candidate(pattern);
        if self.pattern_hits >= PATTERN_LOCK_LENGTH {
            self.is_locked = true;
            self.locked_pattern = pattern;
            self.pattern_hits = 0;
            self.pattern_misses = 0;
            debug!("Prefetch pattern locked: stride {}", pattern);
        }
    }

    fn observe_locked(&mut self, pattern: i32) {
        if pattern == self.locked_pattern {
            self.current_pattern = pattern;
            self.pattern_hits = 0;
            self.pattern_misses = 0;
            return;
        }

        self.pattern_misses += 1;
        self.track_candidate(pattern);

        if self.pattern_hits >= PATTERN_LOCK_LENGTH {
            debug!(
                "Prefetch pattern switched: stride {} -> {}",
                self.locked_pattern, pattern
            );
            self.locked_pattern = pattern;
            self.pattern_hits = 0;
            self.pattern_misses = 0;
        } else if self.pattern_misses >= PATTERN_LOCK_LENGTH {
            debug!("Prefetch pattern unlocked (was stride {})", self.locked_pattern);
            self.is_locked = false;
            self.locked_pattern = 1;
            self.pattern_misses = 0;
        }
    }

    /// Stride to prefetch with: the locked stride, else 1
    pub fn stride(&self) -> i32 {
        if self.is_locked { self.locked_pattern } else { 1 }
    }

    pub fn is_locked(&self) -> bool {
        self.is_locked
    }

    pub fn snapshot(&self) -> PatternSnapshot {
        PatternSnapshot {
            last_requested_frame: self.last_requested_frame,
            current_pattern: self.current_pattern,
            locked_pattern: self.locked_pattern,
            pattern_hits: self.pattern_hits,
            pattern_misses: self.pattern_misses,
            is_locked: self.is_locked,
        }
    }
}
