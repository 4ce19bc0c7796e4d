//! facegate-hw — V4L2 camera capture feeding the core's `FrameSource`.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, CameraStream, DeviceInfo};
pub use frame::PixelFormat;
