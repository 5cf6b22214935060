//! Look-ahead prefetcher
//!
//! Wraps an upstream clip and serves `get_frame(n)` synchronously while pool
//! workers compute the frames the consumer is predicted to ask for next.
//!
//! Per call:
//! 1. Update the stride detector (`PatternState`).
//! 2. Surface a captured worker failure, if any.
//! 3. Schedule pass 1: walk from `n` by the stride, reserving and queueing
//!    frames until `prefetch_window` jobs run or the walk is `prefetch_window`
//!    frames away from `n`.
//! 4. Serve `n`: from cache, or computed inline on the calling thread.
//! 5. Schedule pass 2 from where pass 1 stopped.
//!
//! The cache guarantees one producer per frame, so a frame is computed by
//! a worker or by the consumer but published only once.
//!
//! Failures on worker threads can't be returned to anyone there. The first one
//! is kept and returned from every later `get_frame`, so a failure surfaces
//! on a call that may not be the one that scheduled the failed frame.

use crossbeam::utils::CachePadded;
use log::{debug, error, trace, warn};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use uuid::Uuid;

use crate::config::{MAX_THREADS, PrefetchConfig};
use crate::core::lru_cache::{CacheStatsSnapshot, LookupResult, LruCache, Reservation};
use crate::core::object_pool::ObjectPool;
use crate::core::pattern::{PatternSnapshot, PatternState};
use crate::core::workers::ThreadPool;
use crate::entities::clip::{Clip, ClipError, MtMode, VideoInfo};
use crate::entities::env::{Environment, ThreadEnv};
use crate::entities::frame::Frame;

/// Parameters of one queued compute job
///
/// Taken from the pool right before queueing, returned as soon as the worker
/// has moved the fields out.
#[derive(Default)]
struct JobParams {
    frame: i32,
    owner: Option<Arc<PrefetchShared>>,
    reservation: Option<Reservation<i32, Frame>>,
}

/// State shared between the prefetcher and in-flight jobs
struct PrefetchShared {
    child: Arc<dyn Clip>,
    cache: LruCache<i32, Frame>,
    job_pool: ObjectPool<JobParams>,
    /// Queued or executing jobs
    running_workers: CachePadded<AtomicUsize>,
    idle_lock: Mutex<()>,
    idle: Condvar,
    /// First background failure; later ones are dropped
    worker_error: Mutex<Option<ClipError>>,
}

impl PrefetchShared {
    fn compute(&self, n: i32, reservation: Reservation<i32, Frame>, tenv: &ThreadEnv) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.child.get_frame(n, tenv)))
            .unwrap_or_else(|_| Err(ClipError::decode(n, "upstream panicked")));

        match result {
            Ok(frame) => {
                // Unpin right away; the cache owns the published frame
                drop(self.cache.commit_value(reservation, frame));
                trace!("Prefetched frame {} on worker {:?}", n, tenv.worker_index());
            }
            Err(e) => {
                self.cache.rollback(reservation);
                self.capture_worker_error(n, e);
            }
        }
    }

    fn capture_worker_error(&self, n: i32, e: ClipError) {
        let mut slot = self.worker_error.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            warn!("Background compute of frame {} failed: {}", n, e);
            *slot = Some(ClipError::Worker {
                frame: n,
                source: Box::new(e),
            });
        } else {
            debug!("Discarding background failure for frame {}: {}", n, e);
        }
    }

    fn pending_worker_error(&self) -> Option<ClipError> {
        self.worker_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn finish_job(&self) {
        if self.running_workers.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Take the lock so a waiter can't miss the wakeup between its
            // check and its wait
            let _guard = self.idle_lock.lock().unwrap_or_else(|e| e.into_inner());
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut guard = self.idle_lock.lock().unwrap_or_else(|e| e.into_inner());
        while self.running_workers.load(Ordering::Acquire) > 0 {
            guard = self.idle.wait(guard).unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// Pool job body
fn compute_job(tenv: &ThreadEnv, mut job: Box<JobParams>) {
    let frame = job.frame;
    let Some(owner) = job.owner.take() else {
        error!("Prefetch job for frame {} has no owner", frame);
        debug_assert!(false, "prefetch job without owner");
        return;
    };
    let reservation = job.reservation.take();
    owner.job_pool.destruct(job);

    match reservation {
        Some(reservation) => owner.compute(frame, reservation, tenv),
        None => {
            error!("Prefetch job for frame {} has no reservation", frame);
            debug_assert!(false, "prefetch job without reservation");
        }
    }
    owner.finish_job();
}

/// Frame server stage that computes frames ahead of the consumer
pub struct Prefetcher {
    id: Uuid,
    env: Arc<Environment>,
    shared: Arc<PrefetchShared>,
    pool: Option<ThreadPool<Box<JobParams>>>,
    /// Consumer-thread only; the mutex is never contended
    pattern: Mutex<PatternState>,
    video_info: VideoInfo,
    thread_count: usize,
    prefetch_window: usize,
}

impl Prefetcher {
    /// Wrap `child` with `thread_count` workers (clamped to `1..=MAX_THREADS`).
    ///
    /// `prefetch_window = 2 * thread_count`, cache capacity is twice that.
    pub fn new(child: Arc<dyn Clip>, thread_count: usize, env: &Arc<Environment>) -> Result<Self, ClipError> {
        let thread_count = thread_count.clamp(1, MAX_THREADS);
        let prefetch_window = thread_count * 2;
        let cache_capacity = prefetch_window * 2;

        // Queued jobs never outnumber running_workers, which scheduling caps
        // at the window, so queue_job never waits for a free slot
        let pool = ThreadPool::new(thread_count, prefetch_window, env, "prefetch")?;
        let video_info = child.video_info();

        let shared = Arc::new(PrefetchShared {
            child,
            cache: LruCache::new(cache_capacity),
            job_pool: ObjectPool::with_capacity(prefetch_window),
            running_workers: CachePadded::new(AtomicUsize::new(0)),
            idle_lock: Mutex::new(()),
            idle: Condvar::new(),
            worker_error: Mutex::new(None),
        });

        let id = env.register_prefetcher(&format!("Prefetcher(threads={})", thread_count));
        debug!(
            "Prefetcher {} created: threads={}, window={}, cache={}, frames={}",
            id, thread_count, prefetch_window, cache_capacity, video_info.frame_count
        );

        Ok(Self {
            id,
            env: Arc::clone(env),
            shared,
            pool: Some(pool),
            pattern: Mutex::new(PatternState::new()),
            video_info,
            thread_count,
            prefetch_window,
        })
    }

    pub fn with_config(child: Arc<dyn Clip>, config: &PrefetchConfig, env: &Arc<Environment>) -> Result<Self, ClipError> {
        Self::new(child, config.normalized().threads, env)
    }

    /// Walk from `start` by `stride`, reserving and queueing frames.
    ///
    /// Returns the last candidate visited so a later pass can resume there.
    fn schedule_prefetch(&self, current: i32, start: i32, stride: i32) -> i32 {
        let Some(pool) = &self.pool else {
            return start;
        };
        let window = self.prefetch_window as i64;
        let mut candidate = start;

        while self.shared.running_workers.load(Ordering::Acquire) < self.prefetch_window
            && (candidate as i64 - current as i64).abs() < window
        {
            candidate = match candidate.checked_add(stride) {
                Some(next) => next,
                None => break,
            };
            if !self.video_info.contains(candidate) {
                break;
            }

            match self.shared.cache.lookup_uncounted(&candidate, true) {
                LookupResult::NotFound(Some(reservation)) => {
                    let mut job = self.shared.job_pool.construct();
                    job.frame = candidate;
                    job.owner = Some(Arc::clone(&self.shared));
                    job.reservation = Some(reservation);

                    self.shared.running_workers.fetch_add(1, Ordering::AcqRel);
                    pool.queue_job(compute_job, job);
                    trace!("Scheduled frame {} (request {})", candidate, current);
                }
                LookupResult::NoCacheConfigured => break,
                // Ready or already in flight
                _ => {}
            }
        }
        candidate
    }

    /// Produce frame `n` on the calling thread, through the cache when possible
    fn serve(&self, n: i32, env: &ThreadEnv) -> Result<Frame, ClipError> {
        match self.shared.cache.lookup(&n, true) {
            LookupResult::NotFound(Some(reservation)) => match self.shared.child.get_frame(n, env) {
                Ok(frame) => {
                    drop(self.shared.cache.commit_value(reservation, frame.clone()));
                    Ok(frame)
                }
                Err(e) => {
                    self.shared.cache.rollback(reservation);
                    Err(e)
                }
            },
            LookupResult::FoundAndReady(_handle, frame) => Ok(frame),
            LookupResult::NoCacheConfigured => self.shared.child.get_frame(n, env),
            LookupResult::FoundButNotAvailable => {
                // A worker holds the reservation for n. Compute it here too
                // instead of waiting: the worker's commit stays the only
                // publication, this copy goes straight to the caller.
                trace!("Frame {} in flight on a worker, computing inline", n);
                self.shared.child.get_frame(n, env)
            }
            LookupResult::NotFound(None) => {
                error!("Cache refused to reserve frame {}", n);
                debug_assert!(false, "lookup with create returned no reservation");
                Err(ClipError::Invariant(format!("no reservation for frame {}", n)))
            }
        }
    }

    /// Block until no prefetch job is queued or running
    pub fn wait_idle(&self) {
        self.shared.wait_idle();
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    pub fn prefetch_window(&self) -> usize {
        self.prefetch_window
    }

    pub fn cache_capacity(&self) -> usize {
        self.shared.cache.capacity()
    }

    pub fn running_workers(&self) -> usize {
        self.shared.running_workers.load(Ordering::Acquire)
    }

    /// True if frame `n` is published in the cache
    pub fn is_cached(&self, n: i32) -> bool {
        self.shared.cache.contains_ready(&n)
    }

    pub fn cache_stats(&self) -> CacheStatsSnapshot {
        self.shared.cache.stats()
    }

    pub fn pattern_state(&self) -> PatternSnapshot {
        self.pattern.lock().unwrap_or_else(|e| e.into_inner()).snapshot()
    }
}

impl Clip for Prefetcher {
    fn get_frame(&self, n: i32, env: &ThreadEnv) -> Result<Frame, ClipError> {
        let stride = {
            let mut pattern = self.pattern.lock().unwrap_or_else(|e| e.into_inner());
            pattern.observe(n);
            pattern.stride()
        };

        if let Some(e) = self.shared.pending_worker_error() {
            return Err(e);
        }

        let resume = self.schedule_prefetch(n, n, stride);
        let frame = self.serve(n, env)?;
        self.schedule_prefetch(n, resume, stride);
        Ok(frame)
    }

    fn video_info(&self) -> VideoInfo {
        self.video_info
    }

    fn get_parity(&self, n: i32) -> bool {
        self.shared.child.get_parity(n)
    }

    fn get_audio(&self, buf: &mut [u8], start: i64, count: i64, env: &ThreadEnv) -> Result<(), ClipError> {
        self.shared.child.get_audio(buf, start, count, env)
    }

    fn mt_mode(&self) -> MtMode {
        MtMode::NiceFilter
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        self.env.detach_prefetcher(self.id);
        self.shared.wait_idle();
        // Joins the workers; the queue is already empty
        self.pool.take();
        debug!("Prefetcher {} shut down", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::synthetic::SyntheticClip;
    use crossbeam::channel::{Receiver, Sender, unbounded};
    use std::time::Duration;

    /// Holds frame `gated` on worker threads until released
    struct GatedClip {
        inner: SyntheticClip,
        gated: i32,
        entered_tx: Sender<()>,
        entered_rx: Receiver<()>,
        release_tx: Sender<()>,
        release_rx: Receiver<()>,
        consumer_calls: AtomicUsize,
        worker_calls: AtomicUsize,
    }

    impl GatedClip {
        fn new(inner: SyntheticClip, gated: i32) -> Self {
            let (entered_tx, entered_rx) = unbounded();
            let (release_tx, release_rx) = unbounded();
            Self {
                inner,
                gated,
                entered_tx,
                entered_rx,
                release_tx,
                release_rx,
                consumer_calls: AtomicUsize::new(0),
                worker_calls: AtomicUsize::new(0),
            }
        }
    }

    impl Clip for GatedClip {
        fn get_frame(&self, n: i32, env: &ThreadEnv) -> Result<Frame, ClipError> {
            if n == self.gated {
                if env.is_worker() {
                    self.worker_calls.fetch_add(1, Ordering::SeqCst);
                    let _ = self.entered_tx.send(());
                    let _ = self.release_rx.recv_timeout(Duration::from_secs(10));
                } else {
                    self.consumer_calls.fetch_add(1, Ordering::SeqCst);
                }
            }
            self.inner.get_frame(n, env)
        }

        fn video_info(&self) -> VideoInfo {
            self.inner.video_info()
        }

        fn get_parity(&self, n: i32) -> bool {
            self.inner.get_parity(n)
        }

        fn get_audio(&self, buf: &mut [u8], start: i64, count: i64, env: &ThreadEnv) -> Result<(), ClipError> {
            self.inner.get_audio(buf, start, count, env)
        }
    }

    /// Panics inside `get_frame` for one frame
    struct PanickingClip {
        inner: SyntheticClip,
        frame: i32,
    }

    impl Clip for PanickingClip {
        fn get_frame(&self, n: i32, env: &ThreadEnv) -> Result<Frame, ClipError> {
            if n == self.frame {
                panic!("upstream crashed on frame {}", n);
            }
            self.inner.get_frame(n, env)
        }

        fn video_info(&self) -> VideoInfo {
            self.inner.video_info()
        }

        fn get_parity(&self, n: i32) -> bool {
            self.inner.get_parity(n)
        }

        fn get_audio(&self, buf: &mut [u8], start: i64, count: i64, env: &ThreadEnv) -> Result<(), ClipError> {
            self.inner.get_audio(buf, start, count, env)
        }
    }

    fn setup(clip: SyntheticClip, threads: usize) -> (Arc<SyntheticClip>, Prefetcher, ThreadEnv) {
        let env = Environment::new();
        let clip = Arc::new(clip);
        let prefetcher = Prefetcher::new(clip.clone(), threads, &env).unwrap();
        (clip, prefetcher, ThreadEnv::main(&env))
    }

    #[test]
    fn test_sequential_read_matches_reference() {
        let (clip, prefetcher, main) =
            setup(SyntheticClip::new(100, 8, 8).with_cost(Duration::from_millis(1)), 4);
        assert_eq!(prefetcher.prefetch_window(), 8);
        assert_eq!(prefetcher.cache_capacity(), 16);

        for n in 0..20 {
            let frame = prefetcher.get_frame(n, &main).unwrap();
            assert_eq!(frame, clip.render(n), "frame {}", n);
        }
        assert!(prefetcher.pattern_state().is_locked);
        assert_eq!(prefetcher.pattern_state().locked_pattern, 1);
    }

    #[test]
    fn test_first_request_fills_window() {
        let (clip, prefetcher, main) = setup(SyntheticClip::new(100, 4, 4), 4);

        prefetcher.get_frame(0, &main).unwrap();
        prefetcher.wait_idle();

        for n in 0..=8 {
            assert!(prefetcher.is_cached(n), "frame {} not cached", n);
        }
        assert!(!prefetcher.is_cached(9));
        assert_eq!(clip.worker_calls(), 8);
        assert_eq!(prefetcher.running_workers(), 0);
    }

    #[test]
    fn test_prefetch_follows_locked_stride() {
        let (_clip, prefetcher, main) = setup(SyntheticClip::new(100, 4, 4), 4);

        for n in [0, 5, 10, 15] {
            prefetcher.get_frame(n, &main).unwrap();
            prefetcher.wait_idle();
        }
        assert_eq!(prefetcher.pattern_state().locked_pattern, 5);
        assert!(prefetcher.is_cached(20));
        assert!(prefetcher.is_cached(25));
        assert!(!prefetcher.is_cached(30));
    }

    #[test]
    fn test_prefetch_stops_at_clip_end() {
        let (clip, prefetcher, main) = setup(SyntheticClip::new(5, 4, 4), 4);

        prefetcher.get_frame(3, &main).unwrap();
        prefetcher.wait_idle();
        assert!(prefetcher.is_cached(4));
        // Only frame 4 lies ahead of 3
        assert_eq!(clip.worker_calls(), 1);
    }

    #[test]
    fn test_direct_failure_is_returned_and_rolled_back() {
        let (_clip, prefetcher, main) = setup(SyntheticClip::new(100, 4, 4).fail_on([7]), 2);

        let err = prefetcher.get_frame(7, &main).unwrap_err();
        assert!(matches!(err, ClipError::Decode { frame: 7, .. }));
        assert!(!prefetcher.is_cached(7));
        prefetcher.wait_idle();
        assert!(prefetcher.cache_stats().rollbacks >= 1);
    }

    #[test]
    fn test_background_failure_surfaces_on_next_call() {
        let (_clip, prefetcher, main) = setup(SyntheticClip::new(100, 4, 4).fail_on([7]), 4);

        // Schedules 1..=8 in the background; 7 fails there
        let frame = prefetcher.get_frame(0, &main);
        assert!(frame.is_ok());
        prefetcher.wait_idle();
        assert!(!prefetcher.is_cached(7));

        let err = prefetcher.get_frame(1, &main).unwrap_err();
        match &err {
            ClipError::Worker { frame, source } => {
                assert_eq!(*frame, 7);
                assert!(matches!(**source, ClipError::Decode { frame: 7, .. }));
            }
            other => panic!("unexpected error {:?}", other),
        }

        // Stays surfaced
        assert_eq!(prefetcher.get_frame(2, &main).unwrap_err(), err);
    }

    #[test]
    fn test_inflight_frame_is_served_inline() {
        let env = Environment::new();
        let main = ThreadEnv::main(&env);
        let clip = Arc::new(GatedClip::new(SyntheticClip::new(100, 4, 4), 1));
        let prefetcher = Prefetcher::new(clip.clone(), 2, &env).unwrap();

        // Schedules 1..=4; the worker that takes 1 parks inside upstream
        prefetcher.get_frame(0, &main).unwrap();
        clip.entered_rx.recv_timeout(Duration::from_secs(10)).unwrap();

        // Frame 1 is reserved by that worker, so the consumer builds its own copy
        let inline = prefetcher.get_frame(1, &main).unwrap();
        assert_eq!(inline, clip.inner.render(1));
        assert_eq!(clip.consumer_calls.load(Ordering::SeqCst), 1);
        assert!(!prefetcher.is_cached(1));

        clip.release_tx.send(()).unwrap();
        prefetcher.wait_idle();
        assert_eq!(clip.worker_calls.load(Ordering::SeqCst), 1);

        // The worker's commit is the one that got published
        let LookupResult::FoundAndReady(_handle, published) = prefetcher.shared.cache.lookup_uncounted(&1, false)
        else {
            panic!("frame 1 not published");
        };
        assert_eq!(published, inline);
        assert!(!published.ptr_eq(&inline));
    }

    #[test]
    fn test_worker_panic_becomes_error() {
        let env = Environment::new();
        let main = ThreadEnv::main(&env);
        let clip = Arc::new(PanickingClip {
            inner: SyntheticClip::new(100, 4, 4),
            frame: 7,
        });
        let prefetcher = Prefetcher::new(clip, 4, &env).unwrap();

        // 7 is computed (and panics) on a worker
        prefetcher.get_frame(0, &main).unwrap();
        prefetcher.wait_idle();
        assert_eq!(prefetcher.running_workers(), 0);
        assert!(!prefetcher.is_cached(7));
        assert!(prefetcher.is_cached(8));

        match prefetcher.get_frame(1, &main) {
            Err(ClipError::Worker { frame, source }) => {
                assert_eq!(frame, 7);
                assert!(matches!(*source, ClipError::Decode { frame: 7, .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_stats_count_consumer_reads_only() {
        let (_clip, prefetcher, main) = setup(SyntheticClip::new(100, 4, 4), 4);

        prefetcher.get_frame(0, &main).unwrap();
        prefetcher.wait_idle();
        let stats = prefetcher.cache_stats();
        assert_eq!((stats.hits, stats.misses), (0, 1));

        // Scheduling looks at 2..=9 here; only the read of 1 counts
        prefetcher.get_frame(1, &main).unwrap();
        let stats = prefetcher.cache_stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn test_thread_count_is_clamped() {
        let env = Environment::new();
        let clip: Arc<dyn Clip> = Arc::new(SyntheticClip::new(10, 2, 2));

        let prefetcher = Prefetcher::new(Arc::clone(&clip), usize::MAX, &env).unwrap();
        assert_eq!(prefetcher.thread_count(), MAX_THREADS);
        assert_eq!(prefetcher.prefetch_window(), 2 * MAX_THREADS);
        assert_eq!(prefetcher.cache_capacity(), 4 * MAX_THREADS);
        drop(prefetcher);

        let prefetcher = Prefetcher::new(clip, 0, &env).unwrap();
        assert_eq!(prefetcher.thread_count(), 1);
    }

    #[test]
    fn test_erratic_access_matches_reference() {
        let (clip, prefetcher, main) =
            setup(SyntheticClip::new(200, 4, 4).with_cost(Duration::from_micros(200)), 3);
        let requests = [0, 17, 3, 3, 4, 90, 91, 92, 93, 50, 48, 46, 44, 42, 199, 0, 120, 7];

        for &n in &requests {
            assert_eq!(prefetcher.get_frame(n, &main).unwrap(), clip.render(n), "frame {}", n);
        }
    }

    #[test]
    fn test_job_records_are_recycled() {
        let (_clip, prefetcher, main) = setup(SyntheticClip::new(500, 2, 2), 2);

        for n in 0..200 {
            prefetcher.get_frame(n, &main).unwrap();
        }
        prefetcher.wait_idle();
        assert!(prefetcher.shared.job_pool.allocated() <= prefetcher.prefetch_window());
    }

    #[test]
    fn test_drop_detaches_and_drains() {
        let env = Environment::new();
        let main = ThreadEnv::main(&env);
        let clip = Arc::new(SyntheticClip::new(100, 4, 4).with_cost(Duration::from_millis(10)));
        let prefetcher = Prefetcher::new(clip.clone(), 4, &env).unwrap();
        let id = prefetcher.id();
        assert!(env.is_registered(id));

        prefetcher.get_frame(0, &main).unwrap();
        drop(prefetcher);

        assert_eq!(env.prefetcher_count(), 0);
        // Every scheduled job ran before drop returned
        assert_eq!(clip.worker_calls(), 8);
        assert_eq!(clip.calls(), 9);
    }

    #[test]
    fn test_clip_passthrough() {
        let (clip, prefetcher, main) = setup(SyntheticClip::new(10, 4, 2), 1);

        assert_eq!(prefetcher.mt_mode(), MtMode::NiceFilter);
        assert_eq!(prefetcher.video_info(), clip.video_info());
        assert_eq!(prefetcher.get_parity(3), clip.get_parity(3));

        let mut audio = [1u8; 8];
        prefetcher.get_audio(&mut audio, 0, 8, &main).unwrap();
        assert_eq!(audio, [0u8; 8]);
    }

    #[test]
    fn test_with_config() {
        let env = Environment::new();
        let clip: Arc<dyn Clip> = Arc::new(SyntheticClip::new(10, 2, 2));
        let config = PrefetchConfig { threads: 3 };
        let prefetcher = Prefetcher::with_config(clip, &config, &env).unwrap();
        assert_eq!(prefetcher.thread_count(), 3);
        assert_eq!(prefetcher.prefetch_window(), 6);
        assert_eq!(prefetcher.cache_capacity(), 12);
    }
}
