//! Deterministic generator clip.
//!
//! Produces a Gray8 frame whose bytes are a pure function of the frame index,
//! so any two reads of the same index compare equal. An optional per-frame
//! cost simulates decode time, and selected frames can be made to fail.

use log::trace;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use super::clip::{Clip, ClipError, MtMode, VideoInfo};
use super::env::ThreadEnv;
use super::frame::{Frame, PixelFormat};

#[derive(Debug)]
pub struct SyntheticClip {
    info: VideoInfo,
    cost: Duration,
    failing: HashSet<i32>,
    calls: AtomicUsize,
    worker_calls: AtomicUsize,
}

impl SyntheticClip {
    pub fn new(frame_count: i32, width: usize, height: usize) -> Self {
        Self {
            info: VideoInfo {
                frame_count,
                width,
                height,
                fps: 25.0,
            },
            cost: Duration::ZERO,
            failing: HashSet::new(),
            calls: AtomicUsize::new(0),
            worker_calls: AtomicUsize::new(0),
        }
    }

    /// Sleep this long inside every `get_frame`
    pub fn with_cost(mut self, cost: Duration) -> Self {
        self.cost = cost;
        self
    }

    /// Make `get_frame` fail for the given indices
    pub fn fail_on(mut self, frames: impl IntoIterator<Item = i32>) -> Self {
        self.failing.extend(frames);
        self
    }

    /// Expected content of frame `n`, computed without side effects
    pub fn render(&self, n: i32) -> Frame {
        let len = self.info.width * self.info.height;
        let seed = n.wrapping_mul(31) as u32;
        let buffer = (0..len)
            .map(|i| (seed.wrapping_add(i as u32) % 251) as u8)
            .collect();
        Frame::from_parts(buffer, PixelFormat::Gray8, self.info.width, self.info.height)
    }

    /// Total `get_frame` calls so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    /// `get_frame` calls made from pool worker contexts
    pub fn worker_calls(&self) -> usize {
        self.worker_calls.load(Ordering::Relaxed)
    }
}

impl Clip for SyntheticClip {
    fn get_frame(&self, n: i32, env: &ThreadEnv) -> Result<Frame, ClipError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if env.is_worker() {
            self.worker_calls.fetch_add(1, Ordering::Relaxed);
        }
        trace!("SyntheticClip: frame {} on {:?}", n, env.worker_index());

        if !self.info.contains(n) {
            return Err(ClipError::OutOfRange {
                frame: n,
                frame_count: self.info.frame_count,
            });
        }
        if !self.cost.is_zero() {
            thread::sleep(self.cost);
        }
        if self.failing.contains(&n) {
            return Err(ClipError::decode(n, "synthetic failure"));
        }
        Ok(self.render(n))
    }

    fn video_info(&self) -> VideoInfo {
        self.info
    }

    fn get_parity(&self, n: i32) -> bool {
        n % 2 == 0
    }

    fn get_audio(&self, buf: &mut [u8], _start: i64, _count: i64, _env: &ThreadEnv) -> Result<(), ClipError> {
        buf.fill(0);
        Ok(())
    }

    fn mt_mode(&self) -> MtMode {
        MtMode::NiceFilter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::env::Environment;

    #[test]
    fn test_deterministic_frames() {
        let env = Environment::new();
        let main = ThreadEnv::main(&env);
        let clip = SyntheticClip::new(10, 8, 4);

        let a = clip.get_frame(3, &main).unwrap();
        let b = clip.get_frame(3, &main).unwrap();
        let c = clip.get_frame(4, &main).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, clip.render(3));
        assert_eq!(clip.calls(), 3);
        assert_eq!(clip.worker_calls(), 0);
    }

    #[test]
    fn test_failures_and_range() {
        let env = Environment::new();
        let worker = ThreadEnv::specialize(&env, 0);
        let clip = SyntheticClip::new(10, 2, 2).fail_on([7]);

        assert!(matches!(clip.get_frame(7, &worker), Err(ClipError::Decode { frame: 7, .. })));
        assert!(matches!(clip.get_frame(10, &worker), Err(ClipError::OutOfRange { .. })));
        assert!(clip.get_frame(6, &worker).is_ok());
        assert_eq!(clip.worker_calls(), 3);
    }
}
