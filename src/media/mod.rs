//! Media frame model shared by capture, relay and clip recording

pub mod format;
pub mod frame;

pub use format::{AudioFormat, PixelFormat, Resolution};
pub use frame::{is_valid_jpeg, FrameFormat, MediaFrame, MediaKind};
