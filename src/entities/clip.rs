//! Upstream clip interface and its error type.
//!
//! A `Clip` is anything that can produce frame `n` on demand: a source reader,
//! a filter chain, or another prefetcher. The frame server only relies on
//! this trait; pixel processing happens behind it.

use std::error::Error;
use std::fmt;
use std::sync::Arc;

use super::env::ThreadEnv;
use super::frame::Frame;

/// Static description of a clip
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    pub frame_count: i32,
    pub width: usize,
    pub height: usize,
    pub fps: f64,
}

impl VideoInfo {
    /// True if `n` addresses an existing frame
    pub fn contains(&self, n: i32) -> bool {
        n >= 0 && n < self.frame_count
    }
}

/// Threading contract a clip advertises to graph orchestration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MtMode {
    /// One instance, safe to call from any number of threads at once
    NiceFilter,
    /// Must only be called from one thread at a time
    #[default]
    Serialized,
}

/// Frame production errors
#[derive(Debug, Clone, PartialEq)]
pub enum ClipError {
    /// Upstream failed to build the frame
    Decode { frame: i32, reason: String },
    /// Requested index outside `0..frame_count`
    OutOfRange { frame: i32, frame_count: i32 },
    /// A background compute failed; surfaced later on the consumer thread
    Worker { frame: i32, source: Box<ClipError> },
    /// Resource exhaustion (thread spawn, allocation)
    Resource(String),
    /// Internal invariant broken; indicates a defect
    Invariant(String),
}

impl ClipError {
    pub fn decode(frame: i32, reason: impl Into<String>) -> Self {
        ClipError::Decode {
            frame,
            reason: reason.into(),
        }
    }

    /// Frame index the error is about, if any
    pub fn frame(&self) -> Option<i32> {
        match self {
            ClipError::Decode { frame, .. }
            | ClipError::OutOfRange { frame, .. }
            | ClipError::Worker { frame, .. } => Some(*frame),
            ClipError::Resource(_) | ClipError::Invariant(_) => None,
        }
    }
}

impl fmt::Display for ClipError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClipError::Decode { frame, reason } => write!(f, "Frame {}: {}", frame, reason),
            ClipError::OutOfRange { frame, frame_count } => {
                write!(f, "Frame {} out of range (clip has {} frames)", frame, frame_count)
            }
            ClipError::Worker { frame, .. } => {
                write!(f, "Background compute of frame {} failed", frame)
            }
            ClipError::Resource(e) => write!(f, "Resource error: {}", e),
            ClipError::Invariant(e) => write!(f, "Invariant violated: {}", e),
        }
    }
}

impl Error for ClipError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ClipError::Worker { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

/// Frame source capability consumed (and implemented) by the prefetcher.
///
/// `get_frame` is synchronous and may be slow. Implementations receive the
/// execution context of the calling thread.
pub trait Clip: Send + Sync {
    fn get_frame(&self, n: i32, env: &ThreadEnv) -> Result<Frame, ClipError>;

    fn video_info(&self) -> VideoInfo;

    /// Field parity of frame `n` (true = top field first)
    fn get_parity(&self, n: i32) -> bool;

    /// Fill `buf` with `count` audio samples starting at `start`
    fn get_audio(&self, buf: &mut [u8], start: i64, count: i64, env: &ThreadEnv) -> Result<(), ClipError>;

    /// Threading contract (cache-hints query)
    fn mt_mode(&self) -> MtMode {
        MtMode::Serialized
    }
}

/// Blanket impl: Arc<T> is a clip if T is
impl<T: Clip + ?Sized> Clip for Arc<T> {
    fn get_frame(&self, n: i32, env: &ThreadEnv) -> Result<Frame, ClipError> {
        (**self).get_frame(n, env)
    }

    fn video_info(&self) -> VideoInfo {
        (**self).video_info()
    }

    fn get_parity(&self, n: i32) -> bool {
        (**self).get_parity(n)
    }

    fn get_audio(&self, buf: &mut [u8], start: i64, count: i64, env: &ThreadEnv) -> Result<(), ClipError> {
        (**self).get_audio(buf, start, count, env)
    }

    fn mt_mode(&self) -> MtMode {
        (**self).mt_mode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_and_source() {
        let inner = ClipError::decode(7, "corrupt packet");
        assert_eq!(inner.to_string(), "Frame 7: corrupt packet");
        assert!(inner.source().is_none());

        let outer = ClipError::Worker {
            frame: 7,
            source: Box::new(inner.clone()),
        };
        assert_eq!(outer.frame(), Some(7));
        assert_eq!(outer.source().map(|e| e.to_string()), Some(inner.to_string()));

        assert_eq!(ClipError::Resource("spawn".into()).frame(), None);
    }

    #[test]
    fn test_video_info_contains() {
        let info = VideoInfo {
            frame_count: 10,
            width: 4,
            height: 4,
            fps: 25.0,
        };
        assert!(info.contains(0));
        assert!(info.contains(9));
        assert!(!info.contains(10));
        assert!(!info.contains(-1));
    }
}
