pub mod decoder;
pub mod fake;
pub mod frame;
pub mod source;
pub mod v4l2;

pub use frame::{Frame, FrameMetadata, PixelFormat};
pub use source::{grab_next, open, CameraDriver, DeviceInfo, FrameSource, GrabStrategy, RetryPolicy};
pub use v4l2::V4l2Driver;
