//! Entities - frames, the upstream clip capability, execution contexts

pub mod clip;
pub mod env;
pub mod frame;
pub mod synthetic;

pub use clip::{Clip, ClipError, MtMode, VideoInfo};
pub use env::{Environment, ThreadEnv};
pub use frame::{Frame, PixelFormat};
pub use synthetic::SyntheticClip;
