//! Immutable, shared frame buffers
//!
//! A frame published into the cache can be held by the consumer and by other
//! cache readers at once. Nobody mutates it after construction, so the buffer
//! lives behind an `Arc` and clones are a refcount bump.
//!
//! Pixel semantics are opaque to the frame server: the buffer is a byte blob
//! with a declared layout.

use std::fmt;
use std::sync::Arc;

/// Pixel layout of a frame buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Gray8, // 1 byte per pixel
    Rgba8, // 4 bytes per pixel
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgba8 => 4,
        }
    }
}

struct FrameData {
    buffer: Vec<u8>,
    pixel_format: PixelFormat,
    width: usize,
    height: usize,
}

/// Reference-counted, read-only frame
///
/// Lifetime is the longest holder: the cache slot, the consumer, or a worker
/// that has not yet dropped its copy.
#[derive(Clone)]
pub struct Frame {
    data: Arc<FrameData>,
}

impl Frame {
    /// Wrap a buffer with an explicit pixel format
    pub fn from_parts(mut buffer: Vec<u8>, pixel_format: PixelFormat, width: usize, height: usize) -> Self {
        buffer.resize(width * height * pixel_format.bytes_per_pixel(), 0);
        Self {
            data: Arc::new(FrameData {
                buffer,
                pixel_format,
                width,
                height,
            }),
        }
    }

    pub fn width(&self) -> usize {
        self.data.width
    }

    pub fn height(&self) -> usize {
        self.data.height
    }

    /// Get resolution as tuple
    pub fn resolution(&self) -> (usize, usize) {
        (self.data.width, self.data.height)
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.data.pixel_format
    }

    /// Borrow the raw pixel bytes
    pub fn pixels(&self) -> &[u8] {
        &self.data.buffer
    }

    /// Memory size in bytes
    pub fn mem(&self) -> usize {
        self.data.buffer.len()
    }

    /// True if both handles share the same underlying buffer
    pub fn ptr_eq(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Number of live handles to this buffer
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.data)
    }
}

/// Content equality: same layout and same bytes
impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        self.data.pixel_format == other.data.pixel_format
            && self.data.width == other.data.width
            && self.data.height == other.data.height
            && self.data.buffer == other.data.buffer
    }
}

impl Eq for Frame {}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.data.width)
            .field("height", &self.data.height)
            .field("pixel_format", &self.data.pixel_format)
            .field("bytes", &self.data.buffer.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test: Frame creation
    /// Validates: Dimensions, format and buffer size
    #[test]
    fn test_frame_creation() {
        let frame = Frame::from_parts(vec![0, 100, 0, 255].repeat(16 * 8), PixelFormat::Rgba8, 16, 8);

        assert_eq!(frame.resolution(), (16, 8));
        assert_eq!(frame.pixel_format(), PixelFormat::Rgba8);
        assert_eq!(frame.mem(), 16 * 8 * 4);
        assert_eq!(&frame.pixels()[..4], &[0, 100, 0, 255]);
    }

    /// Test: Short buffers are padded to the declared size
    #[test]
    fn test_buffer_is_sized_to_layout() {
        let frame = Frame::from_parts(vec![7; 3], PixelFormat::Gray8, 2, 2);
        assert_eq!(frame.pixels(), &[7, 7, 7, 0]);

        let frame = Frame::from_parts(vec![1; 100], PixelFormat::Rgba8, 2, 2);
        assert_eq!(frame.mem(), 16);
    }

    /// Test: Clones share storage, equality compares content
    #[test]
    fn test_shared_ownership() {
        let a = Frame::from_parts(vec![1, 2, 3, 4], PixelFormat::Gray8, 2, 2);
        let b = a.clone();
        assert!(a.ptr_eq(&b));
        assert_eq!(a.holders(), 2);

        let c = Frame::from_parts(vec![1, 2, 3, 4], PixelFormat::Gray8, 2, 2);
        assert!(!a.ptr_eq(&c));
        assert_eq!(a, c);

        let d = Frame::from_parts(vec![1, 2, 3, 5], PixelFormat::Gray8, 2, 2);
        assert_ne!(a, d);

        drop(b);
        assert_eq!(a.holders(), 1);
    }
}
