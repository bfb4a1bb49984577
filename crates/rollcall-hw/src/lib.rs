//! Hardware abstraction for classroom camera capture.
//!
//! Provides V4L2-based camera access producing grayscale frames for the
//! motion pipeline, plus PNG encoding for dispatch to the recognition
//! service.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, FrameSource, PixelFormat};
pub use frame::Frame;
