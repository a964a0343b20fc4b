//! likeness-hw: V4L2 camera capture.
//!
//! Frames are delivered as 8-bit grayscale regardless of the negotiated
//! pixel format.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::GrayFrame;
